pub mod authres;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;

pub use tracing;

/// Control message broadcast from the controller to every listener,
/// worker and sideband task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Finish the current message, then tear everything down.
    Shutdown,
    /// Stop accepting new connections, drain in-flight ones, then exit.
    Drain,
    /// Configuration was reloaded; workers retire once idle and are
    /// replaced with freshly configured ones.
    Reload,
}
