//! # Tiller Process
//!
//! The process controller: it owns the current cycle slot, translates OS
//! signals into control directives, tracks the pid file, drives graceful
//! shutdown against a deadline, and hands listening sockets to a new
//! binary during an upgrade.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

pub mod controller;
pub mod environment;
pub mod limits;
pub mod pidfile;
pub mod shutdown;
pub mod signals;
pub mod upgrade;
pub mod worker;

pub use controller::{check_config, ControllerOptions, ProcessController};
pub use environment::{assemble_child_env, EnvSnapshot, LISTEN_FDS_ENV, ZONE_NAMES_ENV};
pub use pidfile::PidFile;
pub use shutdown::{drain_connections, ShutdownSignal};
pub use signals::{send_directive, Directive, DirectiveStream};
pub use upgrade::{exec_new_binary, take_inherited_listeners, take_inherited_zones};
pub use worker::WorkerPool;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::controller::{ControllerOptions, ProcessController};
    pub use crate::signals::{send_directive, Directive};
    pub use tiller_core::{Error, Result};
}
