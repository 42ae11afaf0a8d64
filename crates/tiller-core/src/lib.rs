//! # Tiller Core
//!
//! Core types, identifiers, and error handling for the Tiller control plane.
//!
//! This crate provides the foundational abstractions used throughout the
//! runtime:
//! - Error types
//! - Generation, module, and context-slot identifiers
//! - The host compatibility signature
//! - The typed per-module configuration table

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod conf;
pub mod error;
pub mod ids;
pub mod signature;

pub use conf::{ConfTable, ConfValue};
pub use error::{Error, Result};
pub use ids::{CtxSlot, CycleId, ModuleIndex};
pub use signature::Signature;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::conf::{ConfTable, ConfValue};
    pub use crate::error::{Error, Result};
    pub use crate::ids::{CtxSlot, CycleId, ModuleIndex};
    pub use crate::signature::Signature;
}
