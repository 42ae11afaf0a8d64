//! Configuration sources
//!
//! The builder does not parse configuration itself; a `ConfSource` merges
//! parsed directives into the cycle's slots and records resource requests
//! (listeners, zones) for commit to materialize.

use crate::cycle::Cycle;
use crate::modules::{CORE_MODULE, EVENT_MODULE};
use crate::registry::ModuleRegistry;
use std::path::Path;
use std::sync::Arc;
use tiller_config::{Config, CoreConfig, EventConfig};
use tiller_core::Result;
use tiller_shmem::{ZoneRequest, ZoneSpec};

/// Merges parsed configuration into a cycle under construction.
pub trait ConfSource {
    /// Apply the source to `cycle`. Runs strictly between the
    /// `create_conf` and `init_conf` passes.
    fn apply(&self, cycle: &mut Cycle, registry: &ModuleRegistry) -> Result<()>;
}

/// The file-backed configuration source.
#[derive(Debug)]
pub struct FileConfSource {
    config: Config,
}

impl FileConfSource {
    /// Load, expand, and validate the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            config: tiller_config::load_config(path)?,
        })
    }

    /// Wrap an already-parsed configuration.
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// The parsed configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl ConfSource for FileConfSource {
    fn apply(&self, cycle: &mut Cycle, registry: &ModuleRegistry) -> Result<()> {
        if let Some(slot) = registry.slot_of(CORE_MODULE) {
            if let Some(conf) = cycle.conf_mut::<CoreConfig>(slot) {
                *conf = self.config.core.clone();
            }
        }
        if let Some(slot) = registry.slot_of(EVENT_MODULE) {
            if let Some(conf) = cycle.conf_mut::<EventConfig>(slot) {
                *conf = self.config.events.clone();
            }
        }

        for listen in &self.config.listen {
            cycle.request_listen(listen.addr, listen.backlog);
        }

        for zone in &self.config.zones {
            let mut spec = ZoneSpec::new(&zone.name, zone.size, &zone.owner);
            if zone.noreuse {
                spec = spec.noreuse();
            }
            cycle.request_zone(ZoneRequest::new(spec, zeroed()));
        }

        Ok(())
    }
}

fn zeroed() -> tiller_shmem::ZoneInit {
    Arc::new(|data: &mut [u8]| {
        data.fill(0);
        Ok(())
    })
}
