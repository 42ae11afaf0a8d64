//! Module registry
//!
//! A static catalog of the compiled-in modules. Registration order is the
//! order modules were listed at process start, and that order is the order
//! every lifecycle pass fires in.

use crate::cycle::Cycle;
use crate::module::{HookKind, Module, ModuleKind};
use std::collections::HashSet;
use std::sync::Arc;
use tiller_core::{CtxSlot, Error, ModuleIndex, Result, Signature};

struct Entry {
    module: Arc<dyn Module>,
    slot: CtxSlot,
}

/// The process-wide module catalog.
///
/// Populated once at process start, then shared immutably with every
/// cycle build.
pub struct ModuleRegistry {
    entries: Vec<Entry>,
    names: HashSet<&'static str>,
    host: Signature,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.entries.len())
            .finish()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            names: HashSet::new(),
            host: Signature::host(),
        }
    }

    /// Register a module, assigning its registration index and context
    /// slot.
    ///
    /// Rejects duplicate names and modules whose compatibility signature
    /// does not match the host; after registration a module is never
    /// compatibility-checked again.
    pub fn register(&mut self, module: Arc<dyn Module>) -> Result<ModuleIndex> {
        let name = module.name();

        let found = module.signature();
        if found != self.host {
            return Err(Error::SignatureMismatch {
                module: name.to_string(),
                expected: self.host.to_string(),
                found: found.to_string(),
            });
        }

        if !self.names.insert(name) {
            return Err(Error::module(name, "module already registered"));
        }

        let index = ModuleIndex(self.entries.len());
        let slot = CtxSlot(self.entries.len());
        tracing::debug!(module = name, index = %index, "module registered");
        self.entries.push(Entry { module, slot });
        Ok(index)
    }

    /// Number of registered modules; also the size of every cycle's
    /// configuration table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no modules are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count modules matching a capability tag.
    pub fn count(&self, kind: ModuleKind) -> usize {
        self.entries
            .iter()
            .filter(|e| e.module.kind() == kind)
            .count()
    }

    /// Context slot of the module named `name`.
    pub fn slot_of(&self, name: &str) -> Option<CtxSlot> {
        self.entries
            .iter()
            .find(|e| e.module.name() == name)
            .map(|e| e.slot)
    }

    /// Iterate over modules in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&Arc<dyn Module>, CtxSlot)> {
        self.entries.iter().map(|e| (&e.module, e.slot))
    }

    /// Run every `Core` module's `create_conf` hook, storing the produced
    /// configuration at the module's context slot.
    ///
    /// A `Core` module producing no configuration is a fatal build error.
    pub(crate) fn create_conf_pass(&self, cycle: &mut Cycle) -> Result<()> {
        for entry in &self.entries {
            let name = entry.module.name();
            match entry.module.create_conf(cycle)? {
                Some(conf) => {
                    cycle.conf_table_mut().set(entry.slot, conf);
                    tracing::trace!(module = name, slot = %entry.slot, "conf slot allocated");
                }
                None => {
                    if entry.module.kind() == ModuleKind::Core {
                        return Err(Error::module(
                            name,
                            "core module produced no configuration",
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Invoke every module's build-side hook of `kind` (`InitConf` or
    /// `InitModule`), in registration order.
    ///
    /// Fails fast: the first hook returning an error aborts the pass and
    /// the error names the failing module. Worker-side passes run against
    /// committed (shared) cycles and have their own entry points.
    pub fn hook_pass(&self, cycle: &mut Cycle, kind: HookKind) -> Result<()> {
        for entry in &self.entries {
            let result = match kind {
                HookKind::InitConf => entry.module.init_conf(cycle, entry.slot),
                HookKind::InitModule => entry.module.init_module(cycle, entry.slot),
                other => {
                    return Err(Error::Internal(format!(
                        "{other:?} is not a build-side pass"
                    )))
                }
            };
            if let Err(e) = result {
                tracing::error!(module = entry.module.name(), ?kind, error = %e, "hook failed");
                return Err(match e {
                    e @ Error::Module { .. } => e,
                    other => Error::module(entry.module.name(), other.to_string()),
                });
            }
        }
        Ok(())
    }

    /// Run every module's `init_process` hook against a committed cycle,
    /// in registration order, failing fast.
    pub fn init_process_pass(&self, cycle: &Cycle) -> Result<()> {
        for entry in &self.entries {
            if let Err(e) = entry.module.init_process(cycle, entry.slot) {
                tracing::error!(module = entry.module.name(), error = %e, "init_process failed");
                return Err(match e {
                    e @ Error::Module { .. } => e,
                    other => Error::module(entry.module.name(), other.to_string()),
                });
            }
        }
        Ok(())
    }

    /// Run every module's `exit_process` hook. Teardown never fails.
    pub fn exit_process_pass(&self, cycle: &Cycle) {
        for entry in &self.entries {
            entry.module.exit_process(cycle, entry.slot);
        }
    }

    /// Run every module's `exit_master` hook at final shutdown.
    pub fn exit_master_pass(&self, cycle: &Cycle) {
        for entry in &self.entries {
            entry.module.exit_master(cycle, entry.slot);
        }
    }
}
