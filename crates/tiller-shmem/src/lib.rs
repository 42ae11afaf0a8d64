//! # Tiller Shared Memory
//!
//! Named shared memory zones that survive configuration reloads and binary
//! upgrades. Zones are file-backed mappings identified by name; two
//! requests for the same name must agree on owner tag and size, and each
//! backing mapping runs its initializer exactly once, synchronized across
//! every process that attaches to it.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod manager;
pub mod zone;

pub use manager::{ZoneManager, ZoneRegistry, ZoneRequest};
pub use zone::{ZoneHandle, ZoneInit, ZoneSpec};
