//! The master process controller
//!
//! Owns the current-cycle slot and the pid file, and turns inbound
//! directives into cycle builds, file reopens, upgrades, and shutdown.
//! There is exactly one writer to the slot (this controller); workers read
//! it through cheap atomic snapshots.

use crate::limits;
use crate::pidfile::PidFile;
use crate::shutdown::drain_connections;
use crate::signals::{Directive, DirectiveStream};
use crate::upgrade::{exec_new_binary, take_inherited_listeners, take_inherited_zones};
use crate::worker::WorkerPool;
use arc_swap::ArcSwap;
use std::path::PathBuf;
use std::process::Child;
use std::sync::Arc;
use tiller_config::CoreConfig;
use tiller_cycle::modules::CORE_MODULE;
use tiller_cycle::{BootInfo, Cycle, CycleBuilder, FileConfSource, ModuleRegistry};
use tiller_core::{Error, Result};

/// Startup options for the controller.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Configuration file path
    pub conf_file: PathBuf,
    /// Inline configuration fragment from the command line
    pub conf_param: String,
    /// Installation prefix
    pub prefix: PathBuf,
    /// Arguments to start the new binary with during an upgrade
    pub args: Vec<String>,
}

impl ControllerOptions {
    /// Options with conventional defaults relative to `prefix`.
    pub fn new(conf_file: impl Into<PathBuf>, prefix: impl Into<PathBuf>) -> Self {
        Self {
            conf_file: conf_file.into(),
            conf_param: String::new(),
            prefix: prefix.into(),
            args: Vec::new(),
        }
    }

    fn boot(&self) -> BootInfo {
        let mut boot = BootInfo::new(self.conf_file.clone(), self.prefix.clone());
        boot.conf_param = self.conf_param.clone();
        boot
    }
}

/// The master controller.
#[derive(Debug)]
pub struct ProcessController {
    registry: Arc<ModuleRegistry>,
    options: ControllerOptions,
    current: ArcSwap<Cycle>,
    pidfile: PidFile,
}

impl ProcessController {
    /// Build and commit the first cycle, apply process-wide limits, and
    /// write the pid file.
    ///
    /// A first-build failure is fatal and propagates: there is no previous
    /// generation to fall back to. When started by an upgrading parent,
    /// the sockets in [`LISTEN_FDS_ENV`](crate::environment::LISTEN_FDS_ENV)
    /// are adopted instead of bound.
    pub fn start(registry: Arc<ModuleRegistry>, options: ControllerOptions) -> Result<Self> {
        let mut boot = options.boot();
        boot.inherited = take_inherited_listeners()?;
        boot.inherited_zones = take_inherited_zones();
        let upgraded = !boot.inherited.is_empty();

        let mut builder = CycleBuilder::new(Arc::clone(&registry), boot, None)?;
        let source = FileConfSource::load(&options.conf_file)?;
        builder.load_conf(&source)?;
        let cycle = builder.commit()?;

        let core = core_conf(&cycle, &registry)?;
        limits::apply(&core)?;
        let pidfile = PidFile::create(&core.pid)?;

        if upgraded {
            tracing::info!("started as upgrade replacement, sockets adopted");
        }

        Ok(Self {
            registry,
            options,
            current: ArcSwap::from(cycle),
            pidfile,
        })
    }

    /// Snapshot of the active cycle.
    pub fn current(&self) -> Arc<Cycle> {
        self.current.load_full()
    }

    /// Build a new cycle from the configuration file and make it current.
    ///
    /// On failure the active cycle is untouched and the error is returned;
    /// on success the retired generation drains as its snapshots drop.
    pub fn reload(&self) -> Result<Arc<Cycle>> {
        let previous = self.current.load_full();
        let mut builder =
            CycleBuilder::new(Arc::clone(&self.registry), self.options.boot(), Some(previous))?;
        let source = FileConfSource::load(&self.options.conf_file)?;
        builder.load_conf(&source)?;
        let cycle = builder.commit()?;
        self.current.store(Arc::clone(&cycle));
        Ok(cycle)
    }

    /// Run the master loop until a quit or stop directive arrives.
    pub async fn run(mut self) -> Result<()> {
        let mut signals = DirectiveStream::install()?;
        let first = self.current();
        let core = core_conf(&first, &self.registry)?;
        let mut pool = WorkerPool::spawn(
            Arc::clone(&self.registry),
            first,
            &core,
            core.worker_count(),
        );
        let mut upgrade_child: Option<Child> = None;

        loop {
            let directive = signals.recv().await;
            tracing::info!(%directive, "directive received");

            match directive {
                Directive::Reload => match self.reload() {
                    Ok(cycle) => {
                        let core = core_conf(&cycle, &self.registry)?;
                        let next = WorkerPool::spawn(
                            Arc::clone(&self.registry),
                            cycle,
                            &core,
                            core.worker_count(),
                        );
                        std::mem::replace(&mut pool, next).retire();
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            build_error = e.is_build_error(),
                            "reload failed, keeping current cycle"
                        );
                    }
                },

                Directive::Reopen => {
                    if let Err(e) = self.current().open_files().reopen_all() {
                        tracing::error!(error = %e, "file reopen failed");
                    }
                }

                Directive::Upgrade => {
                    let cycle = self.current();
                    let core = core_conf(&cycle, &self.registry)?;
                    let spawned = std::env::current_exe()
                        .map_err(|e| Error::Upgrade(format!("own binary path: {e}")))
                        .and_then(|exe| {
                            exec_new_binary(
                                &cycle,
                                &core,
                                &mut self.pidfile,
                                &exe,
                                &self.options.args,
                            )
                        });
                    match spawned {
                        Ok(child) => upgrade_child = Some(child),
                        Err(e) => {
                            tracing::error!(error = %e, "upgrade failed, continuing with current binary");
                        }
                    }
                }

                Directive::Quit => {
                    let cycle = self.current();
                    let core = core_conf(&cycle, &self.registry)?;
                    pool.shutdown();
                    drain_connections(&cycle, core.shutdown_timeout).await;
                    pool.retire();
                    self.finish(&cycle, upgrade_child.take());
                    return Ok(());
                }

                Directive::Stop => {
                    let cycle = self.current();
                    pool.retire();
                    self.finish(&cycle, upgrade_child.take());
                    return Ok(());
                }
            }
        }
    }

    fn finish(&self, cycle: &Cycle, upgrade_child: Option<Child>) {
        self.registry.exit_master_pass(cycle);
        if let Some(mut child) = upgrade_child {
            let _ = child.try_wait();
        }
        if let Err(e) = self.pidfile.delete() {
            tracing::error!(error = %e, "pid file removal failed");
        }
        tracing::info!(cycle = %cycle.id(), "master exited");
    }
}

/// Validate the configuration without committing anything: no sockets are
/// bound, no files opened, no zones mapped.
pub fn check_config(registry: Arc<ModuleRegistry>, options: &ControllerOptions) -> Result<()> {
    let mut boot = options.boot();
    boot.test_config = true;

    let mut builder = CycleBuilder::new(registry, boot, None)?;
    let source = FileConfSource::load(&options.conf_file)?;
    builder.load_conf(&source)?;

    tracing::info!(file = %options.conf_file.display(), "configuration file test is successful");
    Ok(())
}

fn core_conf(cycle: &Cycle, registry: &ModuleRegistry) -> Result<CoreConfig> {
    let slot = registry
        .slot_of(CORE_MODULE)
        .ok_or_else(|| Error::Internal("core module is not registered".into()))?;
    cycle
        .conf::<CoreConfig>(slot)
        .cloned()
        .ok_or_else(|| Error::Internal("core configuration slot is empty".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::ENV_TEST_LOCK;
    use tiller_cycle::modules::builtin_registry;

    fn write_config(dir: &std::path::Path, body: &str) -> PathBuf {
        let path = dir.join("tiller.yaml");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn options(dir: &std::path::Path, conf: PathBuf) -> ControllerOptions {
        ControllerOptions::new(conf, dir)
    }

    #[test]
    fn test_start_writes_pid_file() {
        let _guard = ENV_TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("tiller.pid");
        let conf = write_config(
            dir.path(),
            &format!("core:\n  pid: {}\n", pid_path.display()),
        );

        let registry = Arc::new(builtin_registry().unwrap());
        let controller =
            ProcessController::start(registry, options(dir.path(), conf)).unwrap();

        assert!(pid_path.exists());
        assert!(controller.current().is_first_generation());

        controller.pidfile.delete().unwrap();
    }

    #[test]
    fn test_first_build_failure_is_fatal() {
        let _guard = ENV_TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let conf = write_config(dir.path(), "events:\n  connections: 0\n");

        let registry = Arc::new(builtin_registry().unwrap());
        assert!(ProcessController::start(registry, options(dir.path(), conf)).is_err());
    }

    #[test]
    fn test_reload_failure_keeps_current_cycle() {
        let _guard = ENV_TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("tiller.pid");
        let conf = write_config(
            dir.path(),
            &format!("core:\n  pid: {}\n", pid_path.display()),
        );

        let registry = Arc::new(builtin_registry().unwrap());
        let controller =
            ProcessController::start(registry, options(dir.path(), conf.clone())).unwrap();
        let first = controller.current();

        // Break the configuration, then reload.
        std::fs::write(&conf, "events:\n  connections: 0\n").unwrap();
        assert!(controller.reload().is_err());
        assert_eq!(controller.current().id(), first.id());

        controller.pidfile.delete().unwrap();
    }

    #[test]
    fn test_reload_advances_generation() {
        let _guard = ENV_TEST_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("tiller.pid");
        let conf = write_config(
            dir.path(),
            &format!("core:\n  pid: {}\n", pid_path.display()),
        );

        let registry = Arc::new(builtin_registry().unwrap());
        let controller =
            ProcessController::start(registry, options(dir.path(), conf)).unwrap();
        let first = controller.current();

        let second = controller.reload().unwrap();
        assert_ne!(second.id(), first.id());
        assert_eq!(controller.current().id(), second.id());
        assert_eq!(second.previous().unwrap().id(), first.id());

        controller.pidfile.delete().unwrap();
    }

    #[test]
    fn test_check_mode_leaves_no_residue() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("tiller.pid");
        let conf = write_config(
            dir.path(),
            &format!(
                "core:\n  pid: {}\nlisten:\n  - addr: 127.0.0.1:0\n",
                pid_path.display()
            ),
        );

        let registry = Arc::new(builtin_registry().unwrap());
        check_config(registry, &options(dir.path(), conf)).unwrap();

        assert!(!pid_path.exists());
        // No zone directory or error log were created either.
        assert!(!dir.path().join("zones").exists());
    }
}
