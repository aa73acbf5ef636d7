//! The operator control surface: pid-file handling and the
//! start/stop/restart/status verbs behind `attestctl`.

use std::{
    io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use thiserror::Error;

/// The daemon's identity, used for pid-file liveness checks.
pub const IDENT: &str = "attestd";

pub const DEFAULT_PID_FILE: &str = "/var/run/attest.pid";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Failed to read pid file {path}: {source}")]
    ReadPidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write pid file {path}: {source}")]
    WritePidFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Pid file {0} does not contain a pid")]
    MalformedPidFile(PathBuf),

    #[error("No running daemon found via {0}")]
    NotRunning(PathBuf),

    #[error("Failed to signal pid {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: io::Error,
    },

    #[error("Daemon (pid {0}) did not exit in time")]
    StopTimeout(i32),

    #[error("Failed to spawn daemon: {0}")]
    Spawn(#[from] io::Error),
}

/// Write the caller's pid. Called by the running master at startup.
pub fn write_pid_file(path: &Path) -> Result<(), ControlError> {
    let pid = std::process::id();
    std::fs::write(path, format!("{pid}\n")).map_err(|source| ControlError::WritePidFile {
        path: path.to_path_buf(),
        source,
    })
}

pub fn remove_pid_file(path: &Path) {
    let _ = std::fs::remove_file(path);
}

pub fn read_pid_file(path: &Path) -> Result<i32, ControlError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ControlError::ReadPidFile {
        path: path.to_path_buf(),
        source,
    })?;

    contents
        .trim()
        .parse()
        .map_err(|_| ControlError::MalformedPidFile(path.to_path_buf()))
}

/// Whether a process with `pid` exists (signal 0 probe; EPERM still
/// means it exists).
fn process_exists(pid: i32) -> bool {
    let outcome = unsafe { libc::kill(pid, 0) };
    outcome == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Whether the process table identifies `pid` as our daemon.
///
/// Returns `None` when the table cannot be inspected (no /proc on this
/// OS, say); pid existence alone then suffices, matching the
/// controller-cannot-identify-itself escape hatch.
fn cmdline_matches(pid: i32, ident: &str) -> Option<bool> {
    let cmdline = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let argv0 = cmdline.split(|&byte| byte == 0).next()?;
    Some(String::from_utf8_lossy(argv0).contains(ident))
}

/// The pid of the running master, when the pid file is valid: the pid
/// exists in the process table AND its command line matches `ident`
/// (or the table is uninspectable).
pub fn running_pid(pid_file: &Path, ident: &str) -> Result<Option<i32>, ControlError> {
    let pid = match read_pid_file(pid_file) {
        Ok(pid) => pid,
        Err(ControlError::ReadPidFile { source, .. })
            if source.kind() == io::ErrorKind::NotFound =>
        {
            return Ok(None);
        }
        Err(err) => return Err(err),
    };

    if !process_exists(pid) {
        return Ok(None);
    }

    match cmdline_matches(pid, ident) {
        Some(true) | None => Ok(Some(pid)),
        Some(false) => Ok(None),
    }
}

/// `status`: exit 0 when running, nonzero otherwise.
pub fn status(pid_file: &Path) -> Result<i32, ControlError> {
    running_pid(pid_file, IDENT)?.ok_or_else(|| ControlError::NotRunning(pid_file.to_path_buf()))
}

/// `start`: spawn the daemon binary detached.
pub fn start(
    daemon: &Path,
    config: Option<&Path>,
    pid_file: &Path,
) -> Result<u32, ControlError> {
    if let Some(pid) = running_pid(pid_file, IDENT)? {
        tracing::info!("Daemon already running as pid {pid}");
        return Ok(u32::try_from(pid).unwrap_or_default());
    }

    let mut command = std::process::Command::new(daemon);
    command
        .arg("--pid-file")
        .arg(pid_file)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Some(config) = config {
        command.arg("--config").arg(config);
    }

    let child = command.spawn()?;
    Ok(child.id())
}

/// `stop`: SIGTERM the master and wait for it to leave the process
/// table.
pub fn stop(pid_file: &Path, wait: Duration) -> Result<(), ControlError> {
    let Some(pid) = running_pid(pid_file, IDENT)? else {
        return Err(ControlError::NotRunning(pid_file.to_path_buf()));
    };

    let outcome = unsafe { libc::kill(pid, libc::SIGTERM) };
    if outcome != 0 {
        return Err(ControlError::Signal {
            pid,
            source: io::Error::last_os_error(),
        });
    }

    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        if !process_exists(pid) {
            remove_pid_file(pid_file);
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    Err(ControlError::StopTimeout(pid))
}
