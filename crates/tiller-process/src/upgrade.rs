//! Binary upgrade
//!
//! Two-process handoff: the running master starts the new binary with the
//! listening sockets in its fd table and their identities in the
//! inheritance environment variable. Both masters run until the operator
//! retires one; if the new binary fails to start, the old master continues
//! untouched and the pid file still names it.

use crate::environment::{
    assemble_child_env, decode_listen_fds, decode_zone_names, encode_listen_fds,
    encode_zone_names, LISTEN_FDS_ENV, ZONE_NAMES_ENV,
};
use crate::pidfile::PidFile;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::net::TcpListener;
use std::os::fd::{AsRawFd, FromRawFd};
use std::path::Path;
use std::process::{Child, Command};
use tiller_config::CoreConfig;
use tiller_core::{Error, Result};
use tiller_cycle::{Cycle, InheritedListener};

/// Start `binary`, handing it this cycle's listening sockets and the
/// names of the shared memory zones it may attach to.
///
/// The pid file is renamed to the oldbin name before the spawn and renamed
/// back if the spawn fails, so the file always names a running master.
/// Returns the child so the caller can reap it.
pub fn exec_new_binary(
    cycle: &Cycle,
    core: &CoreConfig,
    pidfile: &mut PidFile,
    binary: &Path,
    args: &[String],
) -> Result<Child> {
    // Duplicate every open listening socket and strip close-on-exec from
    // the duplicates. The clones stay alive until spawn returns; the
    // child's fd table is copied at that point.
    let mut clones = Vec::new();
    let mut pairs = Vec::new();
    for listening in cycle.listening() {
        if let Some(clone) = listening.try_clone_socket()? {
            let fd = clone.as_raw_fd();
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))
                .map_err(|e| Error::Upgrade(format!("clearing FD_CLOEXEC on fd {fd}: {e}")))?;
            pairs.push((listening.addr(), fd));
            clones.push(clone);
        }
    }

    // Reusable zones keep their backing files; the child attaches to the
    // ones named here and recreates everything else.
    let zones: Vec<&str> = cycle
        .shared_zones()
        .iter()
        .filter(|z| !z.spec().noreuse)
        .map(|z| z.spec().name.as_str())
        .collect();

    let env = assemble_child_env(core);
    pidfile.rename(core.oldpid_path())?;

    let mut command = Command::new(binary);
    command.args(args).env_clear();
    for (name, value) in env.iter() {
        command.env(name, value);
    }
    command.env(LISTEN_FDS_ENV, encode_listen_fds(&pairs));
    command.env(ZONE_NAMES_ENV, encode_zone_names(&zones));

    match command.spawn() {
        Ok(child) => {
            tracing::info!(
                binary = %binary.display(),
                child = child.id(),
                sockets = pairs.len(),
                zones = zones.len(),
                "new binary started"
            );
            Ok(child)
        }
        Err(e) => {
            if let Err(back) = pidfile.rename(&core.pid) {
                tracing::error!(error = %back, "could not restore pid file after failed upgrade");
            }
            Err(Error::Upgrade(format!("exec {}: {e}", binary.display())))
        }
    }
}

/// Collect the listening sockets handed over by the parent binary, if any.
///
/// Consumes the inheritance variable so the fds are adopted exactly once;
/// close-on-exec is restored on each adopted socket.
pub fn take_inherited_listeners() -> Result<Vec<InheritedListener>> {
    let value = match std::env::var(LISTEN_FDS_ENV) {
        Ok(value) => value,
        Err(_) => return Ok(Vec::new()),
    };
    std::env::remove_var(LISTEN_FDS_ENV);

    let mut listeners = Vec::new();
    for (addr, fd) in decode_listen_fds(&value)? {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(|e| Error::Upgrade(format!("inherited fd {fd} is not usable: {e}")))?;
        // SAFETY: the parent placed this fd in the inheritance list for us
        // to own; nothing else in this process refers to it.
        let listener = unsafe { TcpListener::from_raw_fd(fd) };
        listeners.push(InheritedListener { addr, listener });
    }

    tracing::info!(sockets = listeners.len(), "listening sockets inherited");
    Ok(listeners)
}

/// Collect the zone names handed over by the parent binary, if any.
///
/// Consumes the variable; later builds in this process go through the
/// previous cycle's registry instead.
pub fn take_inherited_zones() -> Vec<String> {
    let value = match std::env::var(ZONE_NAMES_ENV) {
        Ok(value) => value,
        Err(_) => return Vec::new(),
    };
    std::env::remove_var(ZONE_NAMES_ENV);

    let names = decode_zone_names(&value);
    if !names.is_empty() {
        tracing::info!(zones = names.len(), "shared zones inherited");
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::environment::ENV_TEST_LOCK as ENV_LOCK;

    #[test]
    fn test_no_inheritance_env_means_empty() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var(LISTEN_FDS_ENV);
        assert!(take_inherited_listeners().unwrap().is_empty());
    }

    #[test]
    fn test_inheritance_env_is_consumed() {
        let _guard = ENV_LOCK.lock().unwrap();
        // Duplicate a real listener fd so adoption has something valid.
        let source = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = source.local_addr().unwrap();
        let dup = source.try_clone().unwrap();
        let fd = dup.as_raw_fd();
        std::mem::forget(dup);

        std::env::set_var(LISTEN_FDS_ENV, encode_listen_fds(&[(addr, fd)]));
        let inherited = take_inherited_listeners().unwrap();
        assert_eq!(inherited.len(), 1);
        assert_eq!(inherited[0].addr, addr);
        assert!(std::env::var(LISTEN_FDS_ENV).is_err());
    }

    #[test]
    fn test_zone_handoff_env_is_consumed() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(ZONE_NAMES_ENV, "limits;sessions");
        assert_eq!(take_inherited_zones(), vec!["limits", "sessions"]);
        assert!(std::env::var(ZONE_NAMES_ENV).is_err());
        assert!(take_inherited_zones().is_empty());
    }

    #[test]
    fn test_bad_inherited_fd_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var(
            LISTEN_FDS_ENV,
            encode_listen_fds(&[("127.0.0.1:1".parse().unwrap(), 987_654)]),
        );
        assert!(take_inherited_listeners().is_err());
        std::env::remove_var(LISTEN_FDS_ENV);
    }
}
