//! Host compatibility signature
//!
//! Every module carries a compile-time fingerprint of the platform and
//! feature set it was built against. The registry compares it against the
//! host fingerprint once, at registration; a mismatch rejects the module
//! at load time, never at runtime after that.

use std::fmt;

/// A platform/feature fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature(String);

impl Signature {
    /// The fingerprint of the running host.
    pub fn host() -> Self {
        let ptr_size = std::mem::size_of::<usize>() * 8;
        let family = if cfg!(unix) {
            "unix"
        } else if cfg!(windows) {
            "windows"
        } else {
            "other"
        };
        let endian = if cfg!(target_endian = "little") {
            "le"
        } else {
            "be"
        };
        Signature(format!("{ptr_size},{endian},{family}"))
    }

    /// Construct a signature from its serialized form.
    ///
    /// Used by tests and by modules built out-of-tree.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Signature(raw.into())
    }

    /// The serialized form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
