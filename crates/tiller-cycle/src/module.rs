//! Module trait and capability kinds

use crate::cycle::Cycle;
use tiller_core::{ConfValue, CtxSlot, Result, Signature};

/// Module capability tag.
///
/// Determines which lifecycle hooks apply and how the module's
/// configuration slot is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    /// Owns a section of the core configuration; its conf hooks run on
    /// every build
    Core,
    /// Event/connection machinery
    Event,
    /// Service-specific feature module
    Service,
}

/// Lifecycle hook kinds, in the order they fire over a generation's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// After configuration is merged, before commit; may fill defaults in
    /// the module's own slot
    InitConf,
    /// In the master, on the new cycle, while the old generation still
    /// exists
    InitModule,
    /// In a worker, just before it enters its loop
    InitProcess,
    /// In a worker, when its loop is about to exit
    ExitProcess,
    /// In the master, at final shutdown
    ExitMaster,
}

/// A compiled-in unit of functionality.
///
/// All hooks are optional; the defaults are no-ops. Hooks of a given kind
/// run in registration order, never concurrently, and the first error
/// aborts the pass.
pub trait Module: Send + Sync {
    /// Module name, unique within the registry.
    fn name(&self) -> &'static str;

    /// Capability tag.
    fn kind(&self) -> ModuleKind;

    /// Compatibility fingerprint this module was built against.
    ///
    /// Checked once at registration; in-tree modules inherit the host
    /// fingerprint.
    fn signature(&self) -> Signature {
        Signature::host()
    }

    /// Allocate this module's per-cycle configuration object.
    ///
    /// Invoked while the new cycle exists but no configuration has been
    /// parsed yet. A `Core` module returning `Ok(None)` is a fatal build
    /// error; other kinds may simply not own a slot.
    fn create_conf(&self, cycle: &Cycle) -> Result<Option<ConfValue>> {
        let _ = cycle;
        Ok(None)
    }

    /// Finalize this module's configuration after parsing merged into it.
    fn init_conf(&self, cycle: &mut Cycle, slot: CtxSlot) -> Result<()> {
        let _ = (cycle, slot);
        Ok(())
    }

    /// Materialize module state on the new cycle before commit.
    fn init_module(&self, cycle: &mut Cycle, slot: CtxSlot) -> Result<()> {
        let _ = (cycle, slot);
        Ok(())
    }

    /// Worker-side setup against a committed cycle.
    fn init_process(&self, cycle: &Cycle, slot: CtxSlot) -> Result<()> {
        let _ = (cycle, slot);
        Ok(())
    }

    /// Worker-side teardown.
    fn exit_process(&self, cycle: &Cycle, slot: CtxSlot) {
        let _ = (cycle, slot);
    }

    /// Master-side teardown at final shutdown.
    fn exit_master(&self, cycle: &Cycle, slot: CtxSlot) {
        let _ = (cycle, slot);
    }
}

impl std::fmt::Debug for dyn Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name())
            .field("kind", &self.kind())
            .finish()
    }
}
