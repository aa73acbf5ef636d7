use std::fmt;

use async_trait::async_trait;
use attest_common::context::Context;
use attest_metrics::MetricsRegistry;
use thiserror::Error;

/// A named event in the message-processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Connect,
    Helo,
    EnvFrom,
    EnvRcpt,
    Header,
    Eoh,
    Body,
    Eom,
    Abort,
    Close,
}

impl Stage {
    pub const ALL: [Self; 10] = [
        Self::Connect,
        Self::Helo,
        Self::EnvFrom,
        Self::EnvRcpt,
        Self::Header,
        Self::Eoh,
        Self::Body,
        Self::Eom,
        Self::Abort,
        Self::Close,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Helo => "helo",
            Self::EnvFrom => "envfrom",
            Self::EnvRcpt => "envrcpt",
            Self::Header => "header",
            Self::Eoh => "eoh",
            Self::Body => "body",
            Self::Eom => "eom",
            Self::Abort => "abort",
            Self::Close => "close",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A handler's failure to produce a verdict. Reified by the dispatcher
/// as a `temperror`/`permerror` fragment; never propagated out of the
/// pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Transient: DNS timeout, verifier hiccup. Retrying may succeed.
    #[error("{0}")]
    Temp(String),

    /// Permanent: definitively invalid input.
    #[error("{0}")]
    Perm(String),
}

impl HandlerError {
    #[must_use]
    pub const fn result_token(&self) -> &'static str {
        match self {
            Self::Temp(_) => "temperror",
            Self::Perm(_) => "permerror",
        }
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// One pluggable authentication module.
///
/// Every callback defaults to a no-op so a handler implements only the
/// stages it declares. Callbacks run strictly sequentially within a
/// connection; a handler may read anything on the context but should
/// write only its own slot, its fragments, and the disposition.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    /// The lifecycle stages this handler wants to see.
    fn stages(&self) -> &'static [Stage];

    /// Peers that must run before this handler in `stage`.
    fn requires_before(&self, _stage: Stage) -> &'static [&'static str] {
        &[]
    }

    /// Peers that must run after this handler in `stage`.
    fn required_after(&self, _stage: Stage) -> &'static [&'static str] {
        &[]
    }

    /// Declare this handler's counters. Called once per worker during
    /// `setup_handlers`.
    fn register_metrics(&self, _registry: &MetricsRegistry) {}

    async fn connect(&self, _ctx: &mut Context) -> HandlerResult {
        Ok(())
    }

    async fn helo(&self, _ctx: &mut Context, _helo: &str) -> HandlerResult {
        Ok(())
    }

    async fn envfrom(&self, _ctx: &mut Context, _addr: &str) -> HandlerResult {
        Ok(())
    }

    async fn envrcpt(&self, _ctx: &mut Context, _addr: &str) -> HandlerResult {
        Ok(())
    }

    async fn header(&self, _ctx: &mut Context, _name: &str, _value: &str) -> HandlerResult {
        Ok(())
    }

    async fn eoh(&self, _ctx: &mut Context) -> HandlerResult {
        Ok(())
    }

    async fn body(&self, _ctx: &mut Context, _chunk: &[u8]) -> HandlerResult {
        Ok(())
    }

    async fn eom(&self, _ctx: &mut Context) -> HandlerResult {
        Ok(())
    }

    async fn abort(&self, _ctx: &mut Context) -> HandlerResult {
        Ok(())
    }

    async fn close(&self, _ctx: &mut Context) -> HandlerResult {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_are_lifecycle_names() {
        let names: Vec<_> = Stage::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "connect", "helo", "envfrom", "envrcpt", "header", "eoh", "body", "eom", "abort",
                "close"
            ]
        );
    }

    #[test]
    fn error_result_tokens() {
        assert_eq!(
            HandlerError::Temp("dns timeout".to_string()).result_token(),
            "temperror"
        );
        assert_eq!(
            HandlerError::Perm("bad signature syntax".to_string()).result_token(),
            "permerror"
        );
    }
}
