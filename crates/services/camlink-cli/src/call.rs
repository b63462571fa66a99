//! Driving a running call from the terminal

use bytes::Bytes;
use camlink_core::{CallSession, Role, SessionCode, SessionEvent};
use camlink_webrtc::WebRtcMediaEngine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::media::Sample;

const FRAME_INTERVAL: Duration = Duration::from_millis(33);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Print status lines until the call closes or `stop` is raised
///
/// Raising `stop` hangs the call up. Returns an error if the call ended
/// with a fatal error.
pub async fn drive(
    session: &mut CallSession,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    role: Role,
    code: &SessionCode,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    let label = match role {
        Role::Offerer => "camera",
        Role::Answerer => "viewer",
    };
    let mut failure = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if let SessionEvent::Error(e) = &event {
                    failure = Some(e.to_string());
                }
                let closed = matches!(event, SessionEvent::Closed);
                report(label, role, code, &event);
                if closed {
                    break;
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                if stop.load(Ordering::SeqCst) {
                    info!(role = %role, "Hanging up");
                    session.hangup().await;
                    while let Ok(event) = events.try_recv() {
                        report(label, role, code, &event);
                    }
                    break;
                }
            }
        }
    }

    match failure {
        Some(e) => Err(anyhow::anyhow!("{} call failed: {}", label, e)),
        None => Ok(()),
    }
}

fn report(label: &str, role: Role, code: &SessionCode, event: &SessionEvent) {
    match event {
        SessionEvent::Notice(e) => warn!(role = %role, "{}", e),
        _ => debug!(role = %role, event = event.name(), "Session event"),
    }
    if let Some(text) = event.status_text(role, code) {
        println!("[{}] {}", label, text);
    }
}

/// Write synthetic frames into the outbound tracks until `stop` is raised
///
/// Payload bytes only; nothing decodes them. Enough for the viewer to see
/// its inbound tracks.
pub fn spawn_test_pattern(media: &WebRtcMediaEngine, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    let video = media.video_track();
    let audio = media.audio_track();

    tokio::spawn(async move {
        let frame = Bytes::from(vec![0u8; 1024]);
        let mut interval = tokio::time::interval(FRAME_INTERVAL);

        while !stop.load(Ordering::SeqCst) {
            interval.tick().await;
            let sample = Sample {
                data: frame.clone(),
                duration: FRAME_INTERVAL,
                ..Default::default()
            };

            for track in video.iter().chain(audio.iter()) {
                if let Err(e) = track.write_sample(&sample).await {
                    debug!("Failed to write test sample: {}", e);
                }
            }
        }
    })
}

/// Raise `stop` after `duration`, or as soon as `shutdown` is raised
pub fn spawn_stop_timer(
    duration: Duration,
    shutdown: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + duration;
        while tokio::time::Instant::now() < deadline && !shutdown.load(Ordering::SeqCst) {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        stop.store(true, Ordering::SeqCst);
    })
}
