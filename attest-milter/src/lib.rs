//! The Sendmail milter sideband engine.
//!
//! Length-prefixed frames on the MTA socket drive a per-connection
//! finite state machine through the message lifecycle; each wire
//! command dispatches the matching pipeline stage and the accumulated
//! disposition is answered at end-of-message.

pub mod codec;
pub mod session;

pub use session::{Session, SessionConfig, SessionOutcome};
