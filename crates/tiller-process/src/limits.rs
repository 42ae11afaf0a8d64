//! Process-wide resource settings
//!
//! The configuration fields are advisory until this pass applies them,
//! once, at process start. A reload never re-applies them to the running
//! process.

use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{setgid, setuid, Group, Uid, User};
use tiller_config::CoreConfig;
use tiller_core::{Error, Result};

/// Apply rlimits, scheduling priority, run-as identity, and working
/// directory from `core`.
pub fn apply(core: &CoreConfig) -> Result<()> {
    if let Some(nofile) = core.rlimit_nofile {
        setrlimit(Resource::RLIMIT_NOFILE, nofile, nofile)
            .map_err(|e| Error::Internal(format!("setrlimit(RLIMIT_NOFILE, {nofile}): {e}")))?;
        tracing::debug!(nofile, "open-file limit applied");
    }

    if let Some(bytes) = core.rlimit_core {
        setrlimit(Resource::RLIMIT_CORE, bytes, bytes)
            .map_err(|e| Error::Internal(format!("setrlimit(RLIMIT_CORE, {bytes}): {e}")))?;
        tracing::debug!(bytes, "core-dump limit applied");
    }

    if core.priority != 0 {
        // SAFETY: setpriority reads no caller memory and has no
        // invariants beyond valid flag values.
        let rc = unsafe {
            nix::libc::setpriority(nix::libc::PRIO_PROCESS, 0, core.priority)
        };
        if rc != 0 {
            return Err(Error::Internal(format!(
                "setpriority({}): {}",
                core.priority,
                std::io::Error::last_os_error()
            )));
        }
        tracing::debug!(priority = core.priority, "scheduling priority applied");
    }

    drop_privileges(core)?;

    if let Some(dir) = &core.working_directory {
        std::env::set_current_dir(dir)?;
        tracing::debug!(dir = %dir.display(), "working directory changed");
    }

    Ok(())
}

/// Switch to the configured user/group. The group changes first; after
/// setuid the process can no longer change either.
fn drop_privileges(core: &CoreConfig) -> Result<()> {
    if core.user.is_none() && core.group.is_none() {
        return Ok(());
    }
    if !Uid::effective().is_root() {
        tracing::warn!("user/group settings need root privileges, ignored");
        return Ok(());
    }

    if let Some(name) = &core.group {
        let group = Group::from_name(name)
            .map_err(|e| Error::Internal(format!("group lookup '{name}': {e}")))?
            .ok_or_else(|| Error::Config(format!("unknown group '{name}'")))?;
        setgid(group.gid).map_err(|e| Error::Internal(format!("setgid({}): {e}", group.gid)))?;
        tracing::debug!(group = %name, "group changed");
    }

    if let Some(name) = &core.user {
        let user = User::from_name(name)
            .map_err(|e| Error::Internal(format!("user lookup '{name}': {e}")))?
            .ok_or_else(|| Error::Config(format!("unknown user '{name}'")))?;
        if core.group.is_none() {
            setgid(user.gid).map_err(|e| Error::Internal(format!("setgid({}): {e}", user.gid)))?;
        }
        setuid(user.uid).map_err(|e| Error::Internal(format!("setuid({}): {e}", user.uid)))?;
        tracing::debug!(user = %name, "user changed");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_cleanly() {
        // No limits configured: the pass is a no-op and must not fail.
        apply(&CoreConfig::default()).unwrap();
    }

    #[test]
    fn test_root_identity_applies_cleanly() {
        // With root this re-applies the current identity; without root the
        // fields are skipped with a warning. Neither may fail.
        let core = CoreConfig {
            user: Some("root".into()),
            group: Some("root".into()),
            ..Default::default()
        };
        apply(&core).unwrap();
    }

    #[test]
    fn test_rlimit_nofile_within_current_hard_limit() {
        let (soft, hard) = nix::sys::resource::getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        let core = CoreConfig {
            rlimit_nofile: Some(soft.min(hard)),
            ..Default::default()
        };
        apply(&core).unwrap();
    }
}
