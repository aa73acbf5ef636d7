use std::{fs::File, io, path::Path, sync::Arc};

use tracing::metadata::LevelFilter;
use tracing_subscriber::{filter::FilterFn, prelude::*, Layer};

/// One event on a named log channel. Every daemon log line flows
/// through here so the channel shows up as the enclosing span and the
/// `attest` target filter catches everything.
///
/// `internal!`, `incoming!` and `outgoing!` are the channel shorthands
/// used throughout the workspace; the optional `level = LEVEL` prefix
/// overrides their TRACE default.
#[macro_export]
macro_rules! log {
    ($channel:literal, $level:ident, $($arg:tt)+) => {{
        let span = $crate::tracing::span!(
            target: "attest",
            $crate::tracing::Level::$level,
            $channel
        );
        let _guard = span.enter();
        $crate::tracing::event!(target: "attest", $crate::tracing::Level::$level, $($arg)+);
    }};
}

/// Daemon-internal events: lifecycle, worker churn, handler failures.
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::log!("internal", $level, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::log!("internal", TRACE, $($arg)+)
    };
}

/// Commands and bytes arriving from a peer.
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::log!("incoming", $level, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::log!("incoming", TRACE, $($arg)+)
    };
}

/// Replies and bytes sent to a peer.
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($arg:tt)+) => {
        $crate::log!("outgoing", $level, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::log!("outgoing", TRACE, $($arg)+)
    };
}

fn level_filter(debug: bool) -> LevelFilter {
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        match level.to_ascii_lowercase().as_str() {
            "error" => LevelFilter::ERROR,
            "warn" => LevelFilter::WARN,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => LevelFilter::INFO,
        }
    } else if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    }
}

/// Open the error log for appending. Called before privileges drop so
/// the file descriptor survives `runas`/`chroot`.
pub fn open_error_log(path: &Path) -> io::Result<File> {
    File::options().create(true).append(true).open(path)
}

/// Install the global subscriber: a compact stdout layer plus, when an
/// error log is configured, a plain (non-ANSI) file layer.
///
/// Calling this twice is a no-op; the second `init` attempt is ignored
/// so the restart loop can pass through here repeatedly.
pub fn init(debug: bool, error_log: Option<File>) {
    let level = level_filter(debug);
    let target = FilterFn::new(|metadata| metadata.target().starts_with("attest"));

    let stdout = tracing_subscriber::fmt::layer()
        .compact()
        .with_ansi(true)
        .with_target(false)
        .with_filter(level)
        .with_filter(target.clone());

    let file = error_log.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(Arc::new(file))
            .with_filter(LevelFilter::WARN)
            .with_filter(target)
    });

    let _ = tracing_subscriber::registry()
        .with(stdout)
        .with(file)
        .try_init();
}
