//! Configuration validation

use crate::Config;
use std::collections::HashSet;
use tiller_core::{Error, Result};

/// Validate a loaded configuration before it reaches a cycle build.
///
/// Catches the errors that would otherwise surface mid-build: duplicate
/// listen addresses, zone identity clashes inside a single file, and
/// obviously unusable sizes.
pub fn validate_config(config: &Config) -> Result<()> {
    let mut seen_addrs = HashSet::new();
    for listen in &config.listen {
        if !seen_addrs.insert(listen.addr) {
            return Err(Error::Config(format!(
                "duplicate listen address: {}",
                listen.addr
            )));
        }
        if listen.backlog < 0 {
            return Err(Error::Config(format!(
                "listen {}: backlog must be non-negative",
                listen.addr
            )));
        }
    }

    let mut seen_zones = HashSet::new();
    for zone in &config.zones {
        if zone.name.is_empty() {
            return Err(Error::Config("zone name must not be empty".to_string()));
        }
        if zone.size == 0 {
            return Err(Error::zone_conflict(&zone.name, "zone size must be non-zero"));
        }
        if !seen_zones.insert(zone.name.clone()) {
            return Err(Error::zone_conflict(
                &zone.name,
                "zone declared more than once",
            ));
        }
    }

    if config.events.connections == 0 {
        return Err(Error::Config(
            "events.connections must be non-zero".to_string(),
        ));
    }

    Ok(())
}
