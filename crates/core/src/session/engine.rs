//! Signaling engine
//!
//! Every externally triggered input (store deliveries, media engine events,
//! timers) is funnelled into one channel and handled by a single dispatcher
//! task. Duplicate and ordering guards therefore live in one place and never
//! race each other.

use super::events::SessionEvent;
use super::state::{Role, SignalingSession, SignalingState};
use crate::code::SessionCode;
use crate::codec::{
    decode_candidate, decode_description, encode_candidate, encode_description, IceCandidate,
    SdpKind, SessionDescription, SignalMessage,
};
use crate::media::{MediaEngine, MediaEvent};
use crate::store::{LogEntry, RendezvousStore, Subscription};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Input consumed by the dispatcher
#[derive(Debug)]
pub(crate) enum EngineInput {
    Peer(SignalMessage),
    /// A store value that failed to decode; `id` is set for log entries
    Malformed {
        id: Option<String>,
        error: Error,
    },
    Local(MediaEvent),
    OfferWaitElapsed,
    SubscriptionEnded(&'static str),
}

/// Everything a running call needs, shared by the controller and its tasks
#[derive(Clone)]
pub(crate) struct CallContext {
    pub(crate) store: Arc<dyn RendezvousStore>,
    pub(crate) media: Arc<dyn MediaEngine>,
    pub(crate) session: Arc<Mutex<SignalingSession>>,
    pub(crate) events: mpsc::UnboundedSender<SessionEvent>,
}

impl CallContext {
    pub(crate) fn state(&self) -> SignalingState {
        self.session.lock().state
    }

    pub(crate) fn code(&self) -> SessionCode {
        self.session.lock().code.clone()
    }

    pub(crate) fn role(&self) -> Role {
        self.session.lock().role
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }

    /// Move to `to`; nothing leaves `Closed`
    pub(crate) fn transition(&self, to: SignalingState) {
        let (from, code, role) = {
            let mut session = self.session.lock();
            let from = session.state;
            if from == to || from.is_terminal() {
                return;
            }
            session.state = to;
            (from, session.code.clone(), session.role)
        };

        debug!(
            code = %code,
            role = %role,
            "Signaling state transition: {:?} -> {:?}",
            from,
            to
        );
        self.emit(SessionEvent::StateChanged { from, to });
    }
}

/// Convert a slot delivery into dispatcher input
pub(crate) fn slot_input(kind: SdpKind) -> impl Fn(Value) -> EngineInput + Send + 'static {
    move |value| match decode_description(kind, &value) {
        Ok(description) => EngineInput::Peer(SignalMessage::description(description)),
        Err(error) => EngineInput::Malformed { id: None, error },
    }
}

/// Convert a candidate log delivery into dispatcher input
pub(crate) fn log_input(entry: LogEntry) -> EngineInput {
    match decode_candidate(&entry.value) {
        Ok(candidate) => EngineInput::Peer(SignalMessage::Candidate {
            id: entry.id,
            candidate,
        }),
        Err(error) => EngineInput::Malformed {
            id: Some(entry.id),
            error,
        },
    }
}

/// Forward a subscription into the dispatcher until either side goes away
///
/// `on_end` is sent if the source ends on its own.
pub(crate) fn spawn_pump<T, F>(
    mut source: Subscription<T>,
    tx: mpsc::UnboundedSender<EngineInput>,
    on_end: Option<EngineInput>,
    convert: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(T) -> EngineInput + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                delivery = source.recv() => {
                    let Some(item) = delivery else {
                        if let Some(input) = on_end {
                            let _ = tx.send(input);
                        }
                        break;
                    };
                    if tx.send(convert(item)).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Tell the dispatcher once that the viewer has waited `after` for an offer
pub(crate) fn spawn_offer_wait_timer(
    after: Duration,
    tx: mpsc::UnboundedSender<EngineInput>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = tx.closed() => {}
            _ = tokio::time::sleep(after) => {
                let _ = tx.send(EngineInput::OfferWaitElapsed);
            }
        }
    })
}

/// Dispatcher loop; returns after a fatal error (having torn the call down)
pub(crate) async fn run_dispatcher(ctx: CallContext, mut inputs: mpsc::UnboundedReceiver<EngineInput>) {
    while let Some(input) = inputs.recv().await {
        if ctx.state().is_terminal() {
            trace!("Call closed, dropping late input");
            break;
        }

        let result = match input {
            EngineInput::Peer(message) => handle_peer(&ctx, message).await,
            EngineInput::Malformed { id, error } => {
                handle_malformed(&ctx, id, error);
                Ok(())
            }
            EngineInput::Local(event) => {
                handle_local(&ctx, event).await;
                Ok(())
            }
            EngineInput::OfferWaitElapsed => {
                handle_offer_wait(&ctx);
                Ok(())
            }
            EngineInput::SubscriptionEnded(what) => {
                warn!(code = %ctx.code(), "Store subscription to {} ended", what);
                ctx.emit(SessionEvent::Notice(Error::StoreUnavailable(format!(
                    "subscription to {} ended",
                    what
                ))));
                Ok(())
            }
        };

        if let Err(e) = result {
            error!(code = %ctx.code(), role = %ctx.role(), kind = %e.kind(), "Call failed: {}", e);
            ctx.emit(SessionEvent::Error(e));
            teardown(&ctx).await;
            break;
        }
    }
}

async fn handle_peer(ctx: &CallContext, message: SignalMessage) -> Result<()> {
    trace!(message = message.name(), "Peer message");
    match message {
        SignalMessage::Offer(description) | SignalMessage::Answer(description) => {
            handle_description(ctx, description).await
        }
        SignalMessage::Candidate { id, candidate } => handle_candidate(ctx, id, candidate).await,
    }
}

async fn handle_description(ctx: &CallContext, description: SessionDescription) -> Result<()> {
    let (code, role) = {
        let session = ctx.session.lock();
        if description.kind == session.role.local_kind() {
            debug!(kind = description.kind.as_str(), "Ignoring description of our own kind");
            return Ok(());
        }
        if session.peer_description_applied {
            trace!(kind = description.kind.as_str(), "Peer description already applied");
            return Ok(());
        }
        (session.code.clone(), session.role)
    };

    info!(code = %code, role = %role, "Applying peer {} description", description.kind.as_str());
    ctx.media.apply_remote_description(description).await?;
    ctx.session.lock().peer_description_applied = true;

    drain_pending_candidates(ctx).await?;

    match role {
        Role::Offerer => ctx.transition(SignalingState::Connected),
        Role::Answerer => {
            let answer = ctx.media.create_local_description(SdpKind::Answer).await?;
            let value = encode_description(&answer)?;
            ctx.session.lock().local_description = Some(answer);
            ctx.store.publish(&code, role.local_slot(), value).await?;
            info!(code = %code, "Answer published");
            ctx.transition(SignalingState::Published);
            ctx.transition(SignalingState::Connected);
        }
    }
    Ok(())
}

async fn handle_candidate(ctx: &CallContext, id: String, candidate: IceCandidate) -> Result<()> {
    {
        let mut session = ctx.session.lock();
        if !session.seen_candidates.insert(id.clone()) {
            trace!(id = %id, "Duplicate candidate delivery");
            return Ok(());
        }
        if !session.peer_description_applied {
            debug!(id = %id, queued = session.pending_candidates.len() + 1, "Queueing early candidate");
            session.pending_candidates.push_back((id, candidate));
            return Ok(());
        }
    }

    debug!(id = %id, "Adding peer candidate");
    ctx.media.add_remote_candidate(candidate).await
}

async fn drain_pending_candidates(ctx: &CallContext) -> Result<()> {
    loop {
        let next = ctx.session.lock().pending_candidates.pop_front();
        let Some((id, candidate)) = next else {
            return Ok(());
        };
        debug!(id = %id, "Adding queued peer candidate");
        ctx.media.add_remote_candidate(candidate).await?;
    }
}

fn handle_malformed(ctx: &CallContext, id: Option<String>, error: Error) {
    {
        let mut session = ctx.session.lock();
        let duplicate = match &id {
            Some(id) => !session.seen_candidates.insert(id.clone()),
            None => session.peer_description_applied,
        };
        if duplicate {
            trace!("Ignoring repeated malformed delivery");
            return;
        }
    }

    warn!(code = %ctx.code(), "Skipping malformed message: {}", error);
    ctx.emit(SessionEvent::Notice(error));
}

async fn handle_local(ctx: &CallContext, event: MediaEvent) {
    match event {
        MediaEvent::LocalCandidate(candidate) => {
            let (code, log) = {
                let session = ctx.session.lock();
                (session.code.clone(), session.role.local_log())
            };

            let result = match encode_candidate(&candidate) {
                Ok(value) => ctx.store.append(&code, log, value).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(id) => {
                    let mut session = ctx.session.lock();
                    session.sent_candidate_count += 1;
                    trace!(id = %id, sent = session.sent_candidate_count, "Local candidate published");
                }
                Err(e) => {
                    warn!(code = %code, "Failed to publish local candidate: {}", e);
                    ctx.emit(SessionEvent::Notice(e));
                }
            }
        }
        MediaEvent::CandidateGatheringComplete => {
            debug!(code = %ctx.code(), "Local candidate gathering complete");
        }
        MediaEvent::RemoteTrack(track) => {
            info!(code = %ctx.code(), kind = %track.kind, track_id = %track.track_id, "Remote track");
            ctx.emit(SessionEvent::RemoteTrack(track));
        }
        MediaEvent::ConnectionStateChanged(state) => {
            debug!(code = %ctx.code(), "Media connection state: {:?}", state);
            ctx.emit(SessionEvent::MediaStateChanged(state));
        }
    }
}

fn handle_offer_wait(ctx: &CallContext) {
    let (code, waiting) = {
        let session = ctx.session.lock();
        (
            session.code.clone(),
            session.role == Role::Answerer && !session.peer_description_applied,
        )
    };

    if waiting {
        info!(code = %code, "Still no offer, continuing to wait");
        ctx.emit(SessionEvent::Notice(Error::CodeNotFound(code.to_string())));
    }
}

/// Tear the call down; safe to repeat and to resume after an interruption
///
/// Stops local media, closes the media connection and, if this side reserved
/// the namespace, removes it from the store. Each step runs once. Failures
/// are logged only; a removal that failed is retried by the next call.
pub(crate) async fn teardown(ctx: &CallContext) {
    let (code, role, media_done, close_media, release) = {
        let session = ctx.session.lock();
        let release = session.owns_namespace && !session.namespace_released;
        if session.teardown_complete && !release {
            return;
        }
        (
            session.code.clone(),
            session.role,
            session.teardown_complete,
            !session.media_released,
            release,
        )
    };

    if !media_done {
        ctx.transition(SignalingState::Closed);
    }

    if close_media {
        if let Err(e) = ctx.media.stop_local_media().await {
            warn!(code = %code, "Failed to stop local media: {}", e);
        }
        if let Err(e) = ctx.media.close().await {
            warn!(code = %code, "Failed to close media connection: {}", e);
        }
        ctx.session.lock().media_released = true;
    }

    if release {
        match ctx.store.remove_namespace(&code).await {
            Ok(()) => {
                debug!(code = %code, "Namespace released");
                ctx.session.lock().namespace_released = true;
            }
            Err(e) => warn!(code = %code, "Failed to remove namespace: {}", e),
        }
    }

    if !media_done {
        {
            let mut session = ctx.session.lock();
            session.pending_candidates.clear();
            session.teardown_complete = true;
        }

        info!(code = %code, role = %role, "Call closed");
        ctx.emit(SessionEvent::Closed);
    }
}
