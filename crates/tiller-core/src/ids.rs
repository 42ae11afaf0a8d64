//! Generation, module, and context-slot identifiers

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of one runtime generation.
///
/// Monotonically increasing for the lifetime of the process; the first
/// built generation is `CycleId(1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CycleId(u64);

static NEXT_CYCLE_ID: AtomicU64 = AtomicU64::new(1);

impl CycleId {
    /// Allocate the next generation identifier.
    pub fn next() -> Self {
        CycleId(NEXT_CYCLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value, exposed to external collaborators as the
    /// stable handle for "this generation".
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Global registration index of a module.
///
/// Assigned at registration and stable for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleIndex(pub usize);

/// Index into a cycle's configuration table reserved for one module.
///
/// Stable for the lifetime of a given cycle's table; since the module set
/// is fixed at process start it never changes across generations either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CtxSlot(pub usize);

impl fmt::Display for ModuleIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for CtxSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
