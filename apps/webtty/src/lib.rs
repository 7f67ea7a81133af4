//! Terminal session controller for ttyd-style remote ptys.
//!
//! A [`session::SessionController`] refreshes a token, opens the channel to
//! the remote pty, attaches a [`display::DisplaySurface`] and injects
//! arguments received from the embedding context through a
//! [`bridge::BridgeHub`]. When each step happens depends on the configured
//! [`config::DeferralPolicy`].

pub mod auth;
pub mod bridge;
pub mod channel;
pub mod config;
pub mod display;
pub mod mock;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transfer;
pub mod transport;

pub use bridge::{BridgeEnvelope, BridgeHub, TrustPolicy};
pub use config::{DeferralPolicy, SessionConfig};
pub use session::{
    SessionController, SessionDeps, SessionError, SessionEvent, SessionHandle, SessionSnapshot,
    SessionState,
};
