//! Signaling sessions: state machine, role flows and lifecycle

mod engine;
pub mod events;
pub mod lifecycle;
pub mod state;

pub use events::SessionEvent;
pub use lifecycle::CallSession;
pub use state::{Role, SignalingSession, SignalingState};
