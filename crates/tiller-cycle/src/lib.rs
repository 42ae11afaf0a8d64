//! # Tiller Cycle
//!
//! The module registry and the generational cycle builder:
//! - Modules are compiled-in units with a capability tag and optional
//!   lifecycle hooks, registered once at process start.
//! - A cycle is one immutable snapshot of runtime state (per-module
//!   configuration, listening endpoints, shared memory zones, file
//!   registries), produced by one build pass.
//! - A reload builds a new cycle next to the still-active one; the old
//!   generation stays untouched until the new one commits, and remains
//!   alive afterwards only while in-flight work drains.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod builder;
pub mod conf_source;
pub mod cycle;
pub mod listening;
pub mod module;
pub mod modules;
pub mod openfiles;
pub mod registry;

pub use builder::{BootInfo, BuildState, CycleBuilder};
pub use conf_source::{ConfSource, FileConfSource};
pub use cycle::{ConnectionTable, Cycle};
pub use listening::{InheritedListener, Listening};
pub use module::{HookKind, Module, ModuleKind};
pub use modules::{CoreModule, EventModule};
pub use openfiles::{OpenFile, OpenFileRegistry};
pub use registry::ModuleRegistry;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::builder::{BootInfo, BuildState, CycleBuilder};
    pub use crate::conf_source::{ConfSource, FileConfSource};
    pub use crate::cycle::Cycle;
    pub use crate::module::{HookKind, Module, ModuleKind};
    pub use crate::registry::ModuleRegistry;
    pub use tiller_core::{Error, Result};
}
