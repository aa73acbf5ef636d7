//! Privilege handling: chroot and runas/rungroup drop, applied after
//! the listeners are bound. Takes effect only with EUID 0; otherwise
//! logged and ignored.

use std::{ffi::CString, io, path::Path};

use attest_common::{config::Config, internal};

fn cstring(value: &str) -> io::Result<CString> {
    CString::new(value).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "embedded NUL"))
}

fn lookup_uid(user: &str) -> io::Result<(libc::uid_t, libc::gid_t)> {
    let name = cstring(user)?;
    let passwd = unsafe { libc::getpwnam(name.as_ptr()) };
    if passwd.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("unknown user {user:?}"),
        ));
    }
    let passwd = unsafe { &*passwd };
    Ok((passwd.pw_uid, passwd.pw_gid))
}

fn lookup_gid(group: &str) -> io::Result<libc::gid_t> {
    let name = cstring(group)?;
    let entry = unsafe { libc::getgrnam(name.as_ptr()) };
    if entry.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("unknown group {group:?}"),
        ));
    }
    Ok(unsafe { (*entry).gr_gid })
}

fn check(outcome: libc::c_int) -> io::Result<()> {
    if outcome == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Whether this process can actually change identity.
#[must_use]
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Hand the error log to the runas user before privileges drop, so the
/// worker processes can keep writing to it.
pub fn chown_to_runas(path: &Path, config: &Config) -> io::Result<()> {
    let Some(runas) = &config.runas else {
        return Ok(());
    };
    if !is_root() {
        return Ok(());
    }

    let (uid, gid) = lookup_uid(runas)?;
    let gid = match &config.rungroup {
        Some(group) => lookup_gid(group)?,
        None => gid,
    };

    let path = cstring(&path.display().to_string())?;
    check(unsafe { libc::chown(path.as_ptr(), uid, gid) })
}

/// Apply chroot and drop to runas/rungroup, in that order.
pub fn drop_privileges(config: &Config) -> io::Result<()> {
    if !is_root() {
        if config.runas.is_some() || config.chroot.is_some() {
            internal!(
                level = WARN,
                "runas/chroot configured but EUID is not 0; ignored"
            );
        }
        return Ok(());
    }

    if let Some(root) = &config.chroot {
        let path = cstring(&root.display().to_string())?;
        check(unsafe { libc::chroot(path.as_ptr()) })?;
        std::env::set_current_dir("/")?;
        internal!(level = INFO, "Chrooted to {}", root.display());
    }

    if let Some(group) = &config.rungroup {
        let gid = lookup_gid(group)?;
        check(unsafe { libc::setgid(gid) })?;
    }

    if let Some(user) = &config.runas {
        let (uid, gid) = lookup_uid(user)?;
        if config.rungroup.is_none() {
            check(unsafe { libc::setgid(gid) })?;
        }
        check(unsafe { libc::setuid(uid) })?;
        internal!(level = INFO, "Dropped privileges to {user}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        ron::from_str(
            r#"(
                hostname: "mx.example.com",
                connection: "inet:8893@localhost",
            )"#,
        )
        .unwrap()
    }

    #[test]
    fn unprivileged_drop_is_a_noop() {
        // Test suites never run as root; configured runas must be
        // logged and ignored, not attempted.
        if is_root() {
            return;
        }

        let mut config = minimal_config();
        config.runas = Some("nobody".to_string());
        assert!(drop_privileges(&config).is_ok());
        assert!(chown_to_runas(Path::new("/tmp/never-created"), &config).is_ok());
    }

    #[test]
    fn unknown_user_is_reported_when_looked_up() {
        let err = lookup_uid("attest-user-that-does-not-exist").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
