//! `camlink` binary entry point
//!
//! Turns this machine into a camera or a viewer for a CamLink call.
//!
//! # Usage
//!
//! ```bash
//! # Print a fresh session code
//! camlink code
//!
//! # Share the camera under a generated code (Firebase rendezvous)
//! camlink --database-url https://my-app.firebaseio.com camera --generate
//!
//! # Watch it from another machine
//! camlink --database-url https://my-app.firebaseio.com view --code 482-913
//!
//! # Both sides in one process over the in-memory store
//! camlink demo --duration-secs 10
//! ```

mod call;

use anyhow::{bail, Context};
use camlink_core::{
    CamLinkConfig, CallSession, CameraFacing, Error, MediaEngine, MemoryStore, RendezvousStore, Role,
    SessionCode, StoreBackend,
};
use camlink_webrtc::{MediaOptions, WebRtcMediaEngine};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Fresh codes tried when a generated one is already taken
const MAX_CODE_ATTEMPTS: usize = 5;

/// CamLink
///
/// Peer-to-peer camera link: one side shares its camera under a six digit
/// code, the other side enters the code and watches.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, global = true, env = "CAMLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Firebase Realtime Database URL (selects the Firebase store)
    #[arg(long, global = true, env = "CAMLINK_DATABASE_URL")]
    database_url: Option<String>,

    /// Firebase database secret or ID token
    #[arg(long, global = true, env = "CAMLINK_AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    /// STUN servers (comma-separated)
    #[arg(long, global = true, value_delimiter = ',', env = "CAMLINK_STUN_SERVERS")]
    stun_servers: Vec<String>,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true, env = "CAMLINK_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a fresh session code
    Code,

    /// Share this machine's camera
    Camera {
        /// Session code to publish under
        #[arg(long, conflicts_with = "generate")]
        code: Option<String>,

        /// Generate a fresh code (default when --code is absent)
        #[arg(long)]
        generate: bool,

        /// Send an audio track
        #[arg(long, conflicts_with = "no_audio")]
        audio: bool,

        /// Send video only
        #[arg(long)]
        no_audio: bool,

        /// Which camera to share: user (front) or environment (back)
        #[arg(long)]
        facing: Option<CameraFacing>,

        /// Feed synthetic frames into the outbound tracks
        #[arg(long)]
        test_pattern: bool,
    },

    /// Watch a camera by its session code
    View {
        /// Session code shown on the camera
        #[arg(long)]
        code: String,
    },

    /// Run camera and viewer in one process over the in-memory store
    Demo {
        /// Session code (generated when absent)
        #[arg(long)]
        code: Option<String>,

        /// Seconds to keep the call up before hanging up
        #[arg(long, default_value_t = 10)]
        duration_secs: u64,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        let was_already_set = shutdown_flag_handler.swap(true, Ordering::SeqCst);
        if was_already_set {
            eprintln!("Hangup already in progress, forcing exit");
            std::process::exit(0);
        }
        eprintln!("\nCtrl+C received, hanging up...");

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(5));
            eprintln!("Hangup timed out (5s), forcing exit");
            std::process::exit(0);
        });
    })
    .context("Failed to set Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("camlink-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    init_tracing(args.log_json);

    let config = load_config(&args)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.store.backend,
        stun_servers = config.ice.stun_servers.len(),
        turn_servers = config.ice.turn_servers.len(),
        "CamLink starting"
    );

    match args.command {
        Command::Code => {
            println!("{}", SessionCode::generate());
            Ok(())
        }
        Command::Camera {
            code,
            generate: _,
            audio,
            no_audio,
            facing,
            test_pattern,
        } => {
            let mut config = config;
            if audio {
                config.media.enable_audio = true;
            } else if no_audio {
                config.media.enable_audio = false;
            }
            if let Some(facing) = facing {
                config.media.facing = facing;
            }
            run_camera(config, code, test_pattern, shutdown_flag).await
        }
        Command::View { code } => run_viewer(config, &code, shutdown_flag).await,
        Command::Demo {
            code,
            duration_secs,
        } => run_demo(config, code, duration_secs, shutdown_flag).await,
    }
}

/// Config file (if any), then `CAMLINK_*` environment, then flags
fn load_config(args: &Args) -> anyhow::Result<CamLinkConfig> {
    let mut config = match &args.config {
        Some(path) => CamLinkConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => CamLinkConfig::default(),
    };

    config.apply_overrides(|key| match key {
        "CAMLINK_DATABASE_URL" => args.database_url.clone(),
        "CAMLINK_AUTH_TOKEN" => args.auth_token.clone(),
        "CAMLINK_STUN_SERVERS" => {
            (!args.stun_servers.is_empty()).then(|| args.stun_servers.join(","))
        }
        _ => None,
    });

    config.validate()?;
    Ok(config)
}

fn require_shared_store(config: &CamLinkConfig) -> anyhow::Result<()> {
    if config.store.backend == StoreBackend::Memory {
        bail!(
            "camera and viewer need a shared rendezvous store: pass --database-url \
             (or set CAMLINK_DATABASE_URL), or try `camlink demo`"
        );
    }
    Ok(())
}

fn parse_code(input: &str) -> anyhow::Result<SessionCode> {
    SessionCode::parse(input).with_context(|| format!("Invalid session code '{}'", input))
}

async fn run_camera(
    config: CamLinkConfig,
    code: Option<String>,
    test_pattern: bool,
    shutdown_flag: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    require_shared_store(&config)?;

    let store = config.build_store()?;
    let mut session = CallSession::new(store, config.signaling.clone());
    let mut events = session
        .take_events()
        .context("Session events already taken")?;

    let (code, media) = start_camera(&mut session, &config, code).await?;
    println!("Session code: {}", code);

    let pattern = test_pattern
        .then(|| call::spawn_test_pattern(&media, Arc::clone(&shutdown_flag)));

    let result = call::drive(
        &mut session,
        &mut events,
        Role::Offerer,
        &code,
        &shutdown_flag,
    )
    .await;

    if let Some(pattern) = pattern {
        pattern.abort();
    }
    result
}

/// Reserve a code and publish the offer, retrying generated codes on conflict
async fn start_camera(
    session: &mut CallSession,
    config: &CamLinkConfig,
    requested: Option<String>,
) -> anyhow::Result<(SessionCode, Arc<WebRtcMediaEngine>)> {
    let generated = requested.is_none();
    let mut code = match requested {
        Some(input) => parse_code(&input)?,
        None => SessionCode::generate(),
    };

    let mut attempts = 0;
    loop {
        attempts += 1;
        let media = Arc::new(
            WebRtcMediaEngine::new(
                Role::Offerer,
                &config.ice,
                MediaOptions::from(&config.media),
            )
            .await?,
        );

        match session
            .start_offerer(code.clone(), Arc::clone(&media) as Arc<dyn MediaEngine>)
            .await
        {
            Ok(()) => return Ok((code, media)),
            Err(Error::CodeConflict(_)) if generated && attempts < MAX_CODE_ATTEMPTS => {
                warn!(code = %code, "Code already in use, generating a new one");
                code = SessionCode::generate();
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn run_viewer(
    config: CamLinkConfig,
    code: &str,
    shutdown_flag: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    require_shared_store(&config)?;
    let code = parse_code(code)?;

    let store = config.build_store()?;
    let mut session = CallSession::new(store, config.signaling.clone());
    let mut events = session
        .take_events()
        .context("Session events already taken")?;

    let media = WebRtcMediaEngine::new(
        Role::Answerer,
        &config.ice,
        MediaOptions::from(&config.media),
    )
    .await?;
    session
        .start_answerer(code.clone(), Arc::new(media) as Arc<dyn MediaEngine>)
        .await?;

    call::drive(
        &mut session,
        &mut events,
        Role::Answerer,
        &code,
        &shutdown_flag,
    )
    .await
}

async fn run_demo(
    config: CamLinkConfig,
    code: Option<String>,
    duration_secs: u64,
    shutdown_flag: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let code = match code {
        Some(input) => parse_code(&input)?,
        None => SessionCode::generate(),
    };

    let store: Arc<dyn RendezvousStore> = Arc::new(MemoryStore::new());
    let mut camera = CallSession::new(Arc::clone(&store), config.signaling.clone());
    let mut viewer = CallSession::new(store, config.signaling.clone());
    let mut camera_events = camera.take_events().context("Camera events already taken")?;
    let mut viewer_events = viewer.take_events().context("Viewer events already taken")?;

    let stop = Arc::new(AtomicBool::new(false));
    let timer = call::spawn_stop_timer(
        Duration::from_secs(duration_secs),
        Arc::clone(&shutdown_flag),
        Arc::clone(&stop),
    );

    // Viewer first: it waits for the offer like a real viewer would
    let viewer_media = WebRtcMediaEngine::new(
        Role::Answerer,
        &config.ice,
        MediaOptions::from(&config.media),
    )
    .await?;
    viewer
        .start_answerer(code.clone(), Arc::new(viewer_media) as Arc<dyn MediaEngine>)
        .await?;

    let camera_media = Arc::new(
        WebRtcMediaEngine::new(
            Role::Offerer,
            &config.ice,
            MediaOptions::from(&config.media),
        )
        .await?,
    );
    camera
        .start_offerer(
            code.clone(),
            Arc::clone(&camera_media) as Arc<dyn MediaEngine>,
        )
        .await?;
    println!("Session code: {}", code);

    let pattern = call::spawn_test_pattern(&camera_media, Arc::clone(&stop));

    let (camera_result, viewer_result) = tokio::join!(
        call::drive(&mut camera, &mut camera_events, Role::Offerer, &code, &stop),
        call::drive(&mut viewer, &mut viewer_events, Role::Answerer, &code, &stop),
    );

    pattern.abort();
    timer.abort();

    camera_result.and(viewer_result)
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,camlink_core=debug,camlink_webrtc=debug"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // stdout carries status lines; logs go to stderr either way
    tracing_subscriber::registry()
        .with(env_filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_camera_args() {
        let args = Args::try_parse_from([
            "camlink",
            "--stun-servers",
            "stun:a.example:3478,stun:b.example:3478",
            "camera",
            "--code",
            "482-913",
            "--no-audio",
            "--facing",
            "front",
        ])
        .unwrap();

        assert_eq!(args.stun_servers.len(), 2);
        assert!(!args.log_json);
        match args.command {
            Command::Camera {
                code,
                no_audio,
                facing,
                ..
            } => {
                assert_eq!(code.as_deref(), Some("482-913"));
                assert!(no_audio);
                assert_eq!(facing, Some(CameraFacing::User));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_facing_rejected() {
        let result = Args::try_parse_from(["camlink", "camera", "--facing", "sideways"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_log_json_flag_is_global() {
        let args = Args::try_parse_from(["camlink", "code", "--log-json"]).unwrap();
        assert!(args.log_json);
    }

    #[test]
    fn test_code_and_generate_conflict() {
        let result =
            Args::try_parse_from(["camlink", "camera", "--code", "482-913", "--generate"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_applies_flags() {
        let args = Args::try_parse_from([
            "camlink",
            "--database-url",
            "https://camlink-test.firebaseio.com",
            "--stun-servers",
            "stun:stun.example.org:3478",
            "view",
            "--code",
            "482913",
        ])
        .unwrap();

        let config = load_config(&args).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Firebase);
        assert_eq!(
            config.store.database_url,
            "https://camlink-test.firebaseio.com"
        );
        assert_eq!(config.ice.stun_servers, vec!["stun:stun.example.org:3478"]);
        assert!(require_shared_store(&config).is_ok());
    }

    #[test]
    fn test_memory_store_needs_demo() {
        let config = CamLinkConfig::default();
        assert!(require_shared_store(&config).is_err());
    }
}
