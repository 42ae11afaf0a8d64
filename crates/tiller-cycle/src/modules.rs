//! Built-in modules
//!
//! The core and event modules every deployment registers first; service
//! modules stack behind them in registration order.

use crate::cycle::Cycle;
use crate::module::{Module, ModuleKind};
use crate::registry::ModuleRegistry;
use std::sync::Arc;
use tiller_config::{CoreConfig, EventConfig};
use tiller_core::{ConfValue, CtxSlot, Error, Result};

/// Name of the core module.
pub const CORE_MODULE: &str = "core";

/// Name of the event module.
pub const EVENT_MODULE: &str = "events";

/// The core module: process model, paths, and identity.
#[derive(Debug, Default)]
pub struct CoreModule;

impl Module for CoreModule {
    fn name(&self) -> &'static str {
        CORE_MODULE
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Core
    }

    fn create_conf(&self, _cycle: &Cycle) -> Result<Option<ConfValue>> {
        Ok(Some(Box::new(CoreConfig::default())))
    }

    fn init_conf(&self, cycle: &mut Cycle, slot: CtxSlot) -> Result<()> {
        let (lock_file, workers) = {
            let conf = cycle
                .conf::<CoreConfig>(slot)
                .ok_or_else(|| Error::module(CORE_MODULE, "configuration slot missing"))?;
            (conf.lock_file.clone(), conf.worker_count())
        };

        cycle.set_lock_file(lock_file);
        let error_log = cycle.error_log().to_path_buf();
        cycle.register_open_file(error_log);

        tracing::debug!(workers, "core configuration finalized");
        Ok(())
    }
}

/// The event module: owns the connection table size.
#[derive(Debug, Default)]
pub struct EventModule;

impl Module for EventModule {
    fn name(&self) -> &'static str {
        EVENT_MODULE
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Event
    }

    fn create_conf(&self, _cycle: &Cycle) -> Result<Option<ConfValue>> {
        Ok(Some(Box::new(EventConfig::default())))
    }

    fn init_conf(&self, cycle: &mut Cycle, slot: CtxSlot) -> Result<()> {
        let conf = cycle
            .conf::<EventConfig>(slot)
            .ok_or_else(|| Error::module(EVENT_MODULE, "configuration slot missing"))?;
        if conf.connections == 0 {
            return Err(Error::module(EVENT_MODULE, "connections must be non-zero"));
        }
        Ok(())
    }

    fn init_module(&self, cycle: &mut Cycle, slot: CtxSlot) -> Result<()> {
        let connections = cycle
            .conf::<EventConfig>(slot)
            .ok_or_else(|| Error::module(EVENT_MODULE, "configuration slot missing"))?
            .connections;
        cycle.size_connection_table(connections);
        tracing::debug!(connections, "connection table sized");
        Ok(())
    }
}

/// A registry preloaded with the built-in core and event modules.
pub fn builtin_registry() -> Result<ModuleRegistry> {
    let mut registry = ModuleRegistry::new();
    registry.register(Arc::new(CoreModule))?;
    registry.register(Arc::new(EventModule))?;
    Ok(registry)
}
