//! Call lifecycle controller
//!
//! A [`CallSession`] is owned by the caller and runs at most one call at a
//! time. Each call gets its own media engine; once a call is closed the same
//! controller can start the next one.

use super::engine::{
    log_input, run_dispatcher, slot_input, spawn_offer_wait_timer, spawn_pump, teardown,
    CallContext, EngineInput,
};
use super::events::SessionEvent;
use super::state::{Role, SignalingSession, SignalingState};
use crate::code::SessionCode;
use crate::codec::{encode_description, SdpKind};
use crate::config::SignalingConfig;
use crate::media::{MediaEngine, MediaEvent};
use crate::store::{RendezvousStore, Subscription};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

struct ActiveCall {
    ctx: CallContext,
    tasks: Vec<JoinHandle<()>>,
}

/// Owner-facing handle for one device's side of a call
pub struct CallSession {
    store: Arc<dyn RendezvousStore>,
    config: SignalingConfig,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    call: Option<ActiveCall>,
    call_id: String,
}

impl CallSession {
    pub fn new(store: Arc<dyn RendezvousStore>, config: SignalingConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            store,
            config,
            events_tx,
            events_rx: Some(events_rx),
            call: None,
            call_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Take the event receiver (can only be called once)
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.take()
    }

    /// Current signaling state; `Idle` when no call was started
    pub fn state(&self) -> SignalingState {
        self.call
            .as_ref()
            .map(|call| call.ctx.state())
            .unwrap_or(SignalingState::Idle)
    }

    pub fn code(&self) -> Option<SessionCode> {
        self.call.as_ref().map(|call| call.ctx.code())
    }

    pub fn role(&self) -> Option<Role> {
        self.call.as_ref().map(|call| call.ctx.role())
    }

    /// Identifier of this controller, for correlating logs
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    /// Copy of the current call's aggregate state
    pub fn snapshot(&self) -> Option<SignalingSession> {
        self.call
            .as_ref()
            .map(|call| call.ctx.session.lock().clone())
    }

    /// Start as the camera: reserve `code` and publish an offer
    pub async fn start_offerer(
        &mut self,
        code: SessionCode,
        media: Arc<dyn MediaEngine>,
    ) -> Result<()> {
        self.start(Role::Offerer, code, media).await
    }

    /// Start as the viewer: wait for the offer under `code` and answer it
    pub async fn start_answerer(
        &mut self,
        code: SessionCode,
        media: Arc<dyn MediaEngine>,
    ) -> Result<()> {
        self.start(Role::Answerer, code, media).await
    }

    /// Start a call in the given role
    ///
    /// Returns once the local side is set up: for the camera after the offer
    /// is published and the answer subscription is live, for the viewer once
    /// it is subscribed. The rest of the exchange is reported through
    /// [`SessionEvent`]s.
    ///
    /// On `CodeConflict` the state returns to `Idle`; any other failure tears
    /// the call down. Either way the media engine is closed and a fresh
    /// `start` is possible.
    #[instrument(skip(self, media), fields(call_id = %self.call_id, code = %code, role = %role))]
    pub async fn start(
        &mut self,
        role: Role,
        code: SessionCode,
        media: Arc<dyn MediaEngine>,
    ) -> Result<()> {
        let state = self.state();
        if !state.can_start() {
            return Err(Error::InvalidState(format!(
                "cannot start a call while {}",
                state.as_str()
            )));
        }

        // A fatal error may still be tearing the previous call down
        if let Some(mut previous) = self.call.take() {
            finish(&mut previous).await;
        }

        let media_events = media
            .take_events()
            .ok_or_else(|| Error::MediaError("media engine events already taken".to_string()))?;

        let ctx = CallContext {
            store: Arc::clone(&self.store),
            media,
            session: Arc::new(Mutex::new(SignalingSession::new(code, role))),
            events: self.events_tx.clone(),
        };
        self.call = Some(ActiveCall {
            ctx: ctx.clone(),
            tasks: Vec::new(),
        });

        let media_events = Subscription::new(media_events);
        let result = match role {
            Role::Offerer => self.run_offerer(&ctx, media_events).await,
            Role::Answerer => self.run_answerer(&ctx, media_events).await,
        };

        if let Err(e) = &result {
            warn!(kind = %e.kind(), "Failed to start call: {}", e);
            if ctx.state() == SignalingState::Idle {
                if let Err(close_err) = ctx.media.close().await {
                    warn!("Failed to close media connection: {}", close_err);
                }
                self.call = None;
            } else {
                self.hangup().await;
            }
        }

        result
    }

    async fn run_offerer(
        &mut self,
        ctx: &CallContext,
        media_events: Subscription<MediaEvent>,
    ) -> Result<()> {
        let code = ctx.code();

        ctx.transition(SignalingState::Initializing);
        if let Err(e) = ctx.store.create_namespace(&code).await {
            ctx.transition(SignalingState::Idle);
            return Err(e);
        }
        ctx.session.lock().owns_namespace = true;

        let (tx, rx) = mpsc::unbounded_channel();
        self.track(tokio::spawn(run_dispatcher(ctx.clone(), rx)));
        // Local candidates start flowing once the offer is installed
        self.track(spawn_pump(media_events, tx.clone(), None, EngineInput::Local));

        ctx.transition(SignalingState::AwaitingLocalDescription);
        let offer = ctx.media.create_local_description(SdpKind::Offer).await?;
        let value = encode_description(&offer)?;
        ctx.session.lock().local_description = Some(offer);

        ctx.store.publish(&code, Role::Offerer.local_slot(), value).await?;
        ctx.transition(SignalingState::Published);
        info!(code = %code, "Offer published");

        let answers = ctx
            .store
            .subscribe_slot(&code, Role::Offerer.peer_slot())
            .await?;
        let candidates = ctx
            .store
            .subscribe_appends(&code, Role::Offerer.peer_log())
            .await?;
        ctx.transition(SignalingState::PeerDescriptionPending);

        self.track(spawn_pump(
            answers,
            tx.clone(),
            Some(EngineInput::SubscriptionEnded("answer")),
            slot_input(SdpKind::Answer),
        ));
        self.track(spawn_pump(
            candidates,
            tx,
            Some(EngineInput::SubscriptionEnded("answerer candidates")),
            log_input,
        ));
        Ok(())
    }

    async fn run_answerer(
        &mut self,
        ctx: &CallContext,
        media_events: Subscription<MediaEvent>,
    ) -> Result<()> {
        let code = ctx.code();

        ctx.transition(SignalingState::Initializing);

        // One continuous subscription covers both an offer that is already
        // there and one that arrives later.
        let offers = ctx
            .store
            .subscribe_slot(&code, Role::Answerer.peer_slot())
            .await?;
        let candidates = ctx
            .store
            .subscribe_appends(&code, Role::Answerer.peer_log())
            .await?;
        ctx.emit(SessionEvent::WaitingForOffer);
        info!(code = %code, "Waiting for offer");

        let (tx, rx) = mpsc::unbounded_channel();
        self.track(tokio::spawn(run_dispatcher(ctx.clone(), rx)));
        self.track(spawn_pump(media_events, tx.clone(), None, EngineInput::Local));
        self.track(spawn_pump(
            offers,
            tx.clone(),
            Some(EngineInput::SubscriptionEnded("offer")),
            slot_input(SdpKind::Offer),
        ));
        self.track(spawn_pump(
            candidates,
            tx.clone(),
            Some(EngineInput::SubscriptionEnded("offerer candidates")),
            log_input,
        ));

        if let Some(after) = self.config.offer_wait_notice() {
            self.track(spawn_offer_wait_timer(after, tx));
        }
        Ok(())
    }

    fn track(&mut self, task: JoinHandle<()>) {
        match self.call.as_mut() {
            Some(call) => call.tasks.push(task),
            None => task.abort(),
        }
    }

    /// End the current call
    ///
    /// Safe in any state and safe to repeat: cancels every subscription so
    /// late deliveries are dropped, stops local media, closes the media
    /// connection and, for the camera only, removes the namespace.
    #[instrument(skip(self), fields(call_id = %self.call_id))]
    pub async fn hangup(&mut self) {
        let Some(call) = self.call.as_mut() else {
            debug!("Hangup without a call");
            return;
        };

        finish(call).await;
    }
}

/// Stop every task of `call`, then complete its teardown
async fn finish(call: &mut ActiveCall) {
    for task in call.tasks.drain(..) {
        task.abort();
        let _ = task.await;
    }

    teardown(&call.ctx).await;
}

impl Drop for CallSession {
    fn drop(&mut self) {
        if let Some(call) = self.call.as_mut() {
            for task in call.tasks.drain(..) {
                task.abort();
            }
        }
    }
}
