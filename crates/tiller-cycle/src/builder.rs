//! Cycle builder state machine
//!
//! `Created → ConfLoaded → CommitPending → {Committed | RolledBack}`
//!
//! Any failure at or after configuration loading discards the new
//! generation wholesale and leaves the previously active cycle untouched;
//! a failed reload never leaves the process without a valid active cycle.

use crate::cycle::Cycle;
use crate::listening::{bind_listener, InheritedListener, Listening};
use crate::module::HookKind;
use crate::registry::ModuleRegistry;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use tiller_core::{CycleId, Error, Result};
use tiller_shmem::ZoneManager;

/// Build states of one cycle construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    /// Arena and configuration table exist; core conf slots allocated
    Created,
    /// Configuration merged and finalized by every module
    ConfLoaded,
    /// Structural resources being materialized
    CommitPending,
    /// The new cycle replaced the active one
    Committed,
    /// The build failed and the new generation was discarded
    RolledBack,
}

/// Startup identity of a build, fixed at process start.
#[derive(Debug)]
pub struct BootInfo {
    /// Configuration file path
    pub conf_file: PathBuf,
    /// Inline configuration fragment from the command line
    pub conf_param: String,
    /// Installation prefix
    pub prefix: PathBuf,
    /// Error log path
    pub error_log: PathBuf,
    /// Directory holding shared memory zone files
    pub zone_dir: PathBuf,
    /// Configuration-test mode: parse and validate, never commit
    pub test_config: bool,
    /// Listening sockets handed over by the previous binary during an
    /// upgrade; consumed by the first build
    pub inherited: Vec<InheritedListener>,
    /// Shared memory zones whose backing files the previous binary handed
    /// over; any other zone file found on disk is recreated
    pub inherited_zones: Vec<String>,
}

impl BootInfo {
    /// Boot info with conventional defaults relative to `prefix`.
    pub fn new(conf_file: impl Into<PathBuf>, prefix: impl Into<PathBuf>) -> Self {
        let prefix = prefix.into();
        Self {
            conf_file: conf_file.into(),
            conf_param: String::new(),
            prefix: prefix.clone(),
            error_log: prefix.join("error.log"),
            zone_dir: prefix.join("zones"),
            test_config: false,
            inherited: Vec::new(),
            inherited_zones: Vec::new(),
        }
    }
}

enum Planned {
    Fresh(TcpListener),
    Adopted(TcpListener),
    // Socket already taken out of the previous cycle's slot; restored
    // there on rollback.
    Inherited { socket: TcpListener, from: usize },
}

/// Builds one new generation from the previous one plus configuration.
pub struct CycleBuilder {
    registry: Arc<ModuleRegistry>,
    state: BuildState,
    cycle: Cycle,
    previous: Option<Arc<Cycle>>,
    zone_dir: PathBuf,
    inherited: Vec<InheritedListener>,
    inherited_zones: Vec<String>,
}

impl std::fmt::Debug for CycleBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CycleBuilder")
            .field("state", &self.state)
            .field("cycle", &self.cycle.id())
            .finish()
    }
}

impl CycleBuilder {
    /// Start a build: allocate the configuration table (one slot per
    /// registered module) and run every core module's `create_conf` hook.
    pub fn new(
        registry: Arc<ModuleRegistry>,
        boot: BootInfo,
        previous: Option<Arc<Cycle>>,
    ) -> Result<Self> {
        let hostname = resolve_hostname();
        let id = CycleId::next();

        let mut cycle = Cycle::empty(
            id,
            registry.len(),
            boot.conf_file,
            boot.conf_param,
            boot.prefix,
            boot.error_log,
            hostname,
            previous.as_ref(),
            boot.test_config,
        );

        registry.create_conf_pass(&mut cycle)?;
        tracing::debug!(cycle = %id, modules = registry.len(), "cycle created");

        Ok(Self {
            registry,
            state: BuildState::Created,
            cycle,
            previous,
            zone_dir: boot.zone_dir,
            inherited: boot.inherited,
            inherited_zones: boot.inherited_zones,
        })
    }

    /// Current build state.
    pub fn state(&self) -> BuildState {
        self.state
    }

    /// The cycle under construction.
    pub fn cycle(&self) -> &Cycle {
        &self.cycle
    }

    /// Merge parsed configuration into every module's slot, then run the
    /// `init_conf` pass.
    ///
    /// The parser itself is an external collaborator; it is handed the
    /// cycle strictly after `create_conf` and strictly before commit.
    pub fn load_conf(&mut self, source: &dyn crate::conf_source::ConfSource) -> Result<()> {
        if self.state != BuildState::Created {
            return Err(Error::Internal(format!(
                "load_conf in state {:?}",
                self.state
            )));
        }

        let result = source
            .apply(&mut self.cycle, &self.registry)
            .and_then(|()| self.registry.hook_pass(&mut self.cycle, HookKind::InitConf));

        match result {
            Ok(()) => {
                self.state = BuildState::ConfLoaded;
                Ok(())
            }
            Err(e) => {
                self.state = BuildState::RolledBack;
                tracing::warn!(cycle = %self.cycle.id(), error = %e, "configuration load failed, build rolled back");
                Err(e)
            }
        }
    }

    /// Materialize structural resources and commit the new generation.
    ///
    /// On failure every resource owned exclusively by the new cycle is
    /// released (freshly bound sockets closed, zone requests dropped) and
    /// sockets already taken from the previous cycle are restored to it;
    /// the previous generation stays active, unmodified.
    pub fn commit(mut self) -> Result<Arc<Cycle>> {
        if self.state != BuildState::ConfLoaded {
            return Err(Error::Internal(format!("commit in state {:?}", self.state)));
        }
        if self.cycle.is_test_config() {
            self.state = BuildState::RolledBack;
            return Err(Error::Internal(
                "a configuration-test build cannot be committed".into(),
            ));
        }
        self.state = BuildState::CommitPending;

        let plan = match self.commit_pending() {
            Ok(plan) => plan,
            Err((plan, e)) => {
                self.rollback(plan);
                return Err(e);
            }
        };

        // Infallible tail: move planned sockets into the new cycle.
        let requests = std::mem::take(&mut self.cycle.listen_requests);
        for (req, planned) in requests.into_iter().zip(plan) {
            let (socket, inherited) = match planned {
                Planned::Fresh(s) => (s, false),
                Planned::Adopted(s) => (s, true),
                Planned::Inherited { socket, .. } => (socket, true),
            };
            let addr = socket.local_addr().unwrap_or(req.addr);
            self.cycle
                .listening_mut()
                .push(Listening::new(addr, req.backlog, inherited, socket));
        }

        self.state = BuildState::Committed;
        tracing::info!(
            cycle = %self.cycle.id(),
            listeners = self.cycle.listening().len(),
            zones = self.cycle.shared_zones().len(),
            "cycle committed"
        );
        Ok(Arc::new(self.cycle))
    }

    /// The fallible portion of CommitPending. Returns the socket plan on
    /// success; on failure, returns whatever was planned so far for
    /// rollback.
    fn commit_pending(&mut self) -> std::result::Result<Vec<Planned>, (Vec<Planned>, Error)> {
        let mut plan = Vec::new();

        let fallible = |builder: &mut Self, plan: &mut Vec<Planned>| -> Result<()> {
            for path in builder.cycle.paths().to_vec() {
                std::fs::create_dir_all(&path)?;
            }
            builder.cycle.open_files().open_all()?;

            let requests = builder.cycle.listen_requests.clone();
            for req in &requests {
                // Transfer, not rebind: an inherited socket moves out of
                // the previous cycle's slot now and is restored there if
                // anything later in the build fails.
                let taken = builder.previous.as_ref().and_then(|prev| {
                    prev.listening()
                        .iter()
                        .position(|l| l.addr() == req.addr && l.is_open())
                        .and_then(|from| {
                            prev.listening()[from]
                                .take_socket()
                                .map(|socket| Planned::Inherited { socket, from })
                        })
                });

                let planned = if let Some(planned) = taken {
                    planned
                } else if let Some(pos) = builder
                    .inherited
                    .iter()
                    .position(|il| il.addr == req.addr)
                {
                    Planned::Adopted(builder.inherited.remove(pos).listener)
                } else {
                    bind_fresh(req)?
                };
                plan.push(planned);
            }

            let mut manager = ZoneManager::new(&builder.zone_dir);
            manager.inherit(builder.inherited_zones.drain(..));
            let zone_requests = std::mem::take(&mut builder.cycle.zone_requests);
            for request in &zone_requests {
                let handle = manager.resolve(
                    request,
                    builder.previous.as_ref().map(|p| p.shared_zones()),
                )?;
                builder.cycle.shared_zones_mut().insert(handle);
            }

            builder
                .registry
                .clone()
                .hook_pass(&mut builder.cycle, HookKind::InitModule)?;

            Ok(())
        };

        match fallible(self, &mut plan) {
            Ok(()) => Ok(plan),
            Err(e) => Err((plan, e)),
        }
    }

    fn rollback(&mut self, plan: Vec<Planned>) {
        for planned in plan {
            match planned {
                // Freshly bound and adopted sockets belong only to the
                // failed build; dropping closes them.
                Planned::Fresh(_) | Planned::Adopted(_) => {}
                // Sockets taken from the still-active previous cycle go
                // back; it must not lose them to a failed reload.
                Planned::Inherited { socket, from } => {
                    if let Some(prev) = &self.previous {
                        prev.listening()[from].restore_socket(socket);
                    }
                }
            }
        }
        self.state = BuildState::RolledBack;
        tracing::warn!(cycle = %self.cycle.id(), "build rolled back, previous cycle remains active");
    }
}

fn bind_fresh(req: &crate::cycle::ListenRequest) -> Result<Planned> {
    Ok(Planned::Fresh(bind_listener(req.addr, req.backlog)?))
}

fn resolve_hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().to_lowercase())
        .unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf_source::{ConfSource, FileConfSource};
    use crate::modules::builtin_registry;
    use tempfile::tempdir;
    use tiller_config::{Config, ListenConfig};

    fn boot(dir: &std::path::Path) -> BootInfo {
        BootInfo::new(dir.join("tiller.yaml"), dir)
    }

    fn config_with_listen(addr: std::net::SocketAddr) -> Config {
        Config {
            listen: vec![ListenConfig { addr, backlog: 16 }],
            ..Default::default()
        }
    }

    struct FailingSource;

    impl ConfSource for FailingSource {
        fn apply(
            &self,
            _cycle: &mut Cycle,
            _registry: &ModuleRegistry,
        ) -> Result<()> {
            Err(Error::Config("directive parse error".into()))
        }
    }

    #[test]
    fn test_state_machine_happy_path() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(builtin_registry().unwrap());

        let mut builder = CycleBuilder::new(registry, boot(dir.path()), None).unwrap();
        assert_eq!(builder.state(), BuildState::Created);

        let source = FileConfSource::from_config(Config::default());
        builder.load_conf(&source).unwrap();
        assert_eq!(builder.state(), BuildState::ConfLoaded);

        let cycle = builder.commit().unwrap();
        assert!(cycle.is_first_generation());
        assert!(cycle.connections().capacity() > 0);
    }

    #[test]
    fn test_conf_failure_rolls_back() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(builtin_registry().unwrap());

        let mut builder = CycleBuilder::new(registry, boot(dir.path()), None).unwrap();
        assert!(builder.load_conf(&FailingSource).is_err());
        assert_eq!(builder.state(), BuildState::RolledBack);
    }

    #[test]
    fn test_commit_requires_conf_loaded() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(builtin_registry().unwrap());

        let builder = CycleBuilder::new(registry, boot(dir.path()), None).unwrap();
        assert!(builder.commit().is_err());
    }

    #[test]
    fn test_config_test_build_refuses_commit() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(builtin_registry().unwrap());
        let mut info = boot(dir.path());
        info.test_config = true;

        let mut builder = CycleBuilder::new(registry, info, None).unwrap();
        builder
            .load_conf(&FileConfSource::from_config(Config::default()))
            .unwrap();
        assert!(builder.commit().is_err());
    }

    #[test]
    fn test_reload_inherits_listening_socket() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(builtin_registry().unwrap());

        let mut builder =
            CycleBuilder::new(Arc::clone(&registry), boot(dir.path()), None).unwrap();
        let source =
            FileConfSource::from_config(config_with_listen("127.0.0.1:0".parse().unwrap()));
        builder.load_conf(&source).unwrap();
        let first = builder.commit().unwrap();

        let bound = first.listening()[0].addr();
        assert!(!first.listening()[0].is_inherited());

        // Reload on the same (now concrete) address.
        let mut builder =
            CycleBuilder::new(Arc::clone(&registry), boot(dir.path()), Some(Arc::clone(&first)))
                .unwrap();
        let source = FileConfSource::from_config(config_with_listen(bound));
        builder.load_conf(&source).unwrap();
        let second = builder.commit().unwrap();

        assert!(second.listening()[0].is_inherited());
        assert_eq!(second.listening()[0].addr(), bound);
        // Ownership moved: the previous cycle's slot is empty.
        assert!(!first.listening()[0].is_open());
        assert_eq!(second.previous().unwrap().id(), first.id());
    }

    #[test]
    fn test_failed_reload_restores_previous_sockets() {
        use crate::module::{Module, ModuleKind};

        struct Saboteur;
        impl Module for Saboteur {
            fn name(&self) -> &'static str {
                "saboteur"
            }
            fn kind(&self) -> ModuleKind {
                ModuleKind::Service
            }
            fn init_module(&self, _cycle: &mut Cycle, _slot: tiller_core::CtxSlot) -> Result<()> {
                Err(Error::module("saboteur", "injected failure"))
            }
        }

        let dir = tempdir().unwrap();
        let mut registry = builtin_registry().unwrap();
        registry.register(Arc::new(Saboteur)).unwrap();
        let registry = Arc::new(registry);

        let mut builder =
            CycleBuilder::new(Arc::clone(&registry), boot(dir.path()), None).unwrap();
        let source =
            FileConfSource::from_config(config_with_listen("127.0.0.1:0".parse().unwrap()));
        builder.load_conf(&source).unwrap();
        // First build fails too (saboteur), so build without it first.
        drop(builder);

        let clean = Arc::new(builtin_registry().unwrap());
        let mut builder = CycleBuilder::new(Arc::clone(&clean), boot(dir.path()), None).unwrap();
        builder.load_conf(&source).unwrap();
        let first = builder.commit().unwrap();
        let bound = first.listening()[0].addr();

        // Reload through the sabotaged registry: init_module fails after
        // the socket was taken from the previous cycle.
        let mut builder =
            CycleBuilder::new(registry, boot(dir.path()), Some(Arc::clone(&first))).unwrap();
        let source = FileConfSource::from_config(config_with_listen(bound));
        builder.load_conf(&source).unwrap();
        assert!(builder.commit().is_err());

        // The previous generation still owns its socket and stays
        // fully functional.
        assert!(first.listening()[0].is_open());
        assert_eq!(first.listening()[0].addr(), bound);
    }

    #[test]
    fn test_bind_failure_reports_address() {
        let dir = tempdir().unwrap();
        let registry = Arc::new(builtin_registry().unwrap());

        // Hold the port with an unrelated listener.
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = blocker.local_addr().unwrap();

        let mut builder = CycleBuilder::new(registry, boot(dir.path()), None).unwrap();
        let source = FileConfSource::from_config(config_with_listen(addr));
        builder.load_conf(&source).unwrap();

        let err = builder.commit().unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
    }
}
