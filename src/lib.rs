pub mod classifier;
pub mod config;
pub mod constants;
pub mod controller;
pub mod decoder;
pub mod logging;
pub mod session;
pub mod transport;
pub mod types;

pub use types::*;

pub use controller::{CancelHandle, NegotiationClient, SessionHandle};
pub use session::NegotiationSession;
