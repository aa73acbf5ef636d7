//! Daemon orchestration: listener binding, the worker supervisor, and
//! the top-level controller with its restart loop.

pub mod controller;
pub mod listeners;
pub mod privs;
pub mod supervisor;
pub mod worker;
