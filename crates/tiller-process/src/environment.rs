//! Child environment assembly
//!
//! Children never inherit the master's environment wholesale. The
//! configuration lists what passes through: `"VAR"` forwards the master's
//! value, `"VAR=value"` sets one explicitly. The socket-inheritance
//! variable is appended during an upgrade.

use std::net::SocketAddr;
use std::os::fd::RawFd;
use tiller_config::CoreConfig;
use tiller_core::{Error, Result};

/// Environment variable carrying the inherited listening sockets across
/// an upgrade exec: `addr=fd` pairs separated by `;`.
pub const LISTEN_FDS_ENV: &str = "TILLER_FDS";

/// Environment variable naming the shared memory zones whose backing
/// files the new binary may attach to, separated by `;`. Zone files not
/// named here are recreated from scratch.
pub const ZONE_NAMES_ENV: &str = "TILLER_ZONES";

/// An explicit, owned set of environment variables for a child process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvSnapshot {
    vars: Vec<(String, String)>,
}

impl EnvSnapshot {
    /// Empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable, replacing an earlier entry of the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.vars.retain(|(n, _)| *n != name);
        self.vars.push((name, value.into()));
    }

    /// Look up a variable.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.vars.len()
    }

    /// Whether the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Iterate over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Assemble the child environment declared by `core`.
///
/// Unknown inherited names are skipped silently; the child simply runs
/// without them.
pub fn assemble_child_env(core: &CoreConfig) -> EnvSnapshot {
    let mut snapshot = EnvSnapshot::new();
    for entry in &core.env {
        match entry.split_once('=') {
            Some((name, value)) => snapshot.set(name, value),
            None => {
                if let Ok(value) = std::env::var(entry) {
                    snapshot.set(entry, value);
                }
            }
        }
    }
    snapshot
}

/// Encode `addr=fd` pairs for [`LISTEN_FDS_ENV`].
pub fn encode_listen_fds(pairs: &[(SocketAddr, RawFd)]) -> String {
    pairs
        .iter()
        .map(|(addr, fd)| format!("{addr}={fd}"))
        .collect::<Vec<_>>()
        .join(";")
}

/// Decode the [`LISTEN_FDS_ENV`] value back into `addr=fd` pairs.
pub fn decode_listen_fds(value: &str) -> Result<Vec<(SocketAddr, RawFd)>> {
    let mut pairs = Vec::new();
    for item in value.split(';').filter(|s| !s.is_empty()) {
        let (addr, fd) = item.split_once('=').ok_or_else(|| {
            Error::Upgrade(format!("malformed {LISTEN_FDS_ENV} entry '{item}'"))
        })?;
        let addr: SocketAddr = addr.parse().map_err(|_| {
            Error::Upgrade(format!("malformed address in {LISTEN_FDS_ENV}: '{addr}'"))
        })?;
        let fd: RawFd = fd.parse().map_err(|_| {
            Error::Upgrade(format!("malformed fd in {LISTEN_FDS_ENV}: '{fd}'"))
        })?;
        pairs.push((addr, fd));
    }
    Ok(pairs)
}

/// Encode zone names for [`ZONE_NAMES_ENV`].
pub fn encode_zone_names<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|n| n.as_ref())
        .collect::<Vec<_>>()
        .join(";")
}

/// Decode the [`ZONE_NAMES_ENV`] value back into zone names.
pub fn decode_zone_names(value: &str) -> Vec<String> {
    value
        .split(';')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// The inheritance variables are process-global; tests that read or write
// them serialize on this lock.
#[cfg(test)]
pub(crate) static ENV_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_assignment_wins_over_inherit() {
        let core = CoreConfig {
            env: vec!["TILLER_TEST_ROLE=primary".into()],
            ..Default::default()
        };
        let snapshot = assemble_child_env(&core);
        assert_eq!(snapshot.get("TILLER_TEST_ROLE"), Some("primary"));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn test_unknown_inherited_name_is_skipped() {
        let core = CoreConfig {
            env: vec!["TILLER_TEST_DEFINITELY_UNSET_VAR".into()],
            ..Default::default()
        };
        assert!(assemble_child_env(&core).is_empty());
    }

    #[test]
    fn test_set_replaces() {
        let mut snapshot = EnvSnapshot::new();
        snapshot.set("A", "1");
        snapshot.set("A", "2");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("A"), Some("2"));
    }

    #[test]
    fn test_listen_fds_encoding() {
        let pairs = vec![
            ("127.0.0.1:8080".parse().unwrap(), 5),
            ("[::1]:9090".parse().unwrap(), 7),
        ];
        let encoded = encode_listen_fds(&pairs);
        assert_eq!(decode_listen_fds(&encoded).unwrap(), pairs);
    }

    #[test]
    fn test_listen_fds_rejects_garbage() {
        assert!(decode_listen_fds("nonsense").is_err());
        assert!(decode_listen_fds("127.0.0.1:80=notafd").is_err());
        assert!(decode_listen_fds("").unwrap().is_empty());
    }

    #[test]
    fn test_zone_names_encoding() {
        let names = ["limits", "sessions"];
        assert_eq!(
            decode_zone_names(&encode_zone_names(&names)),
            vec!["limits".to_string(), "sessions".to_string()]
        );
        assert!(decode_zone_names("").is_empty());
    }
}
