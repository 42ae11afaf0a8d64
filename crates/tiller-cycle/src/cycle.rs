//! The cycle (generation) object

use crate::listening::Listening;
use crate::openfiles::OpenFileRegistry;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tiller_core::{ConfTable, CtxSlot, CycleId};
use tiller_shmem::{ZoneRegistry, ZoneRequest};

/// One listening endpoint requested during configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ListenRequest {
    pub(crate) addr: SocketAddr,
    pub(crate) backlog: i32,
}

/// The per-generation connection table.
///
/// The core allocates the slot storage sized from the event module's
/// connection count; the event subsystem owns acquisition and scheduling.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    capacity: usize,
    free: Mutex<Vec<usize>>,
}

impl ConnectionTable {
    pub(crate) fn sized(capacity: usize) -> Self {
        Self {
            capacity,
            free: Mutex::new((0..capacity).rev().collect()),
        }
    }

    /// Total slots.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently acquired.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Acquire a free slot index, if any.
    pub fn acquire(&self) -> Option<usize> {
        self.free.lock().pop()
    }

    /// Release a slot index back to the table.
    pub fn release(&self, slot: usize) {
        debug_assert!(slot < self.capacity);
        self.free.lock().push(slot);
    }
}

/// One complete, immutable snapshot of server runtime state.
///
/// Mutable only while under construction; after commit, workers observe
/// it read-only through `Arc` snapshots. The generation is released in
/// bulk when the last snapshot drops.
#[derive(Debug)]
pub struct Cycle {
    id: CycleId,
    conf: ConfTable,

    conf_file: PathBuf,
    conf_param: String,
    prefix: PathBuf,
    error_log: PathBuf,
    lock_file: PathBuf,
    hostname: String,

    listening: Vec<Listening>,
    paths: Vec<PathBuf>,
    open_files: OpenFileRegistry,
    shared_zones: ZoneRegistry,
    connections: ConnectionTable,

    // Requests collected during the conf phase, drained at commit.
    pub(crate) listen_requests: Vec<ListenRequest>,
    pub(crate) zone_requests: Vec<ZoneRequest>,

    previous: Option<Weak<Cycle>>,
    test_config: bool,
}

impl Cycle {
    pub(crate) fn empty(
        id: CycleId,
        slots: usize,
        conf_file: PathBuf,
        conf_param: String,
        prefix: PathBuf,
        error_log: PathBuf,
        hostname: String,
        previous: Option<&Arc<Cycle>>,
        test_config: bool,
    ) -> Self {
        Self {
            id,
            conf: ConfTable::with_slots(slots),
            conf_file,
            conf_param,
            prefix,
            error_log,
            lock_file: PathBuf::new(),
            hostname,
            listening: Vec::new(),
            paths: Vec::new(),
            open_files: OpenFileRegistry::new(),
            shared_zones: ZoneRegistry::new(),
            connections: ConnectionTable::default(),
            listen_requests: Vec::new(),
            zone_requests: Vec::new(),
            previous: previous.map(Arc::downgrade),
            test_config,
        }
    }

    /// Stable numeric handle of this generation.
    pub fn id(&self) -> CycleId {
        self.id
    }

    /// Whether this is the first generation of the process (nothing to
    /// fall back to if its build fails).
    pub fn is_first_generation(&self) -> bool {
        self.previous.is_none()
    }

    /// The immediately preceding generation, if it is still draining.
    ///
    /// Never ownership: the previous cycle is freed independently once
    /// its last snapshot drops.
    pub fn previous(&self) -> Option<Arc<Cycle>> {
        self.previous.as_ref().and_then(Weak::upgrade)
    }

    /// Configuration file path.
    pub fn conf_file(&self) -> &Path {
        &self.conf_file
    }

    /// Inline configuration fragment supplied on the command line.
    pub fn conf_param(&self) -> &str {
        &self.conf_param
    }

    /// Installation prefix.
    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// Error log path.
    pub fn error_log(&self) -> &Path {
        &self.error_log
    }

    /// Lock file path.
    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    /// Resolved hostname, lowercased.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Whether this cycle was built in configuration-test mode.
    pub fn is_test_config(&self) -> bool {
        self.test_config
    }

    /// Typed read access to a module's configuration slot.
    pub fn conf<T: 'static>(&self, slot: CtxSlot) -> Option<&T> {
        self.conf.get(slot)
    }

    /// Typed mutable access to a module's configuration slot.
    ///
    /// Only meaningful while the cycle is under construction; committed
    /// cycles are only ever reachable through shared references.
    pub fn conf_mut<T: 'static>(&mut self, slot: CtxSlot) -> Option<&mut T> {
        self.conf.get_mut(slot)
    }

    pub(crate) fn conf_table_mut(&mut self) -> &mut ConfTable {
        &mut self.conf
    }

    /// Listening endpoints owned by this generation.
    pub fn listening(&self) -> &[Listening] {
        &self.listening
    }

    pub(crate) fn listening_mut(&mut self) -> &mut Vec<Listening> {
        &mut self.listening
    }

    /// Filesystem paths this generation guarantees to exist.
    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    /// Open-file registry.
    pub fn open_files(&self) -> &OpenFileRegistry {
        &self.open_files
    }

    pub(crate) fn open_files_mut(&mut self) -> &mut OpenFileRegistry {
        &mut self.open_files
    }

    /// Shared memory zones owned by this generation.
    pub fn shared_zones(&self) -> &ZoneRegistry {
        &self.shared_zones
    }

    pub(crate) fn shared_zones_mut(&mut self) -> &mut ZoneRegistry {
        &mut self.shared_zones
    }

    /// The connection table sized at build time.
    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    // Build-phase request API, called from module conf hooks.

    /// Request a listening endpoint; bound or inherited at commit.
    pub fn request_listen(&mut self, addr: SocketAddr, backlog: i32) {
        if !self.listen_requests.iter().any(|r| r.addr == addr) {
            self.listen_requests.push(ListenRequest { addr, backlog });
        }
    }

    /// Request a shared memory zone; resolved against the previous
    /// generation at commit.
    pub fn request_zone(&mut self, request: ZoneRequest) {
        self.zone_requests.push(request);
    }

    /// Register a directory that must exist once this cycle commits.
    pub fn register_path(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    /// Register a file to open at commit (and reopen on rotation).
    pub fn register_open_file(&mut self, path: impl Into<PathBuf>) -> usize {
        self.open_files.register(path)
    }

    /// Set the lock file path; normally done by the core module's
    /// `init_conf`.
    pub fn set_lock_file(&mut self, path: impl Into<PathBuf>) {
        self.lock_file = path.into();
    }

    /// Size the connection table; normally done by the event module.
    pub fn size_connection_table(&mut self, capacity: usize) {
        self.connections = ConnectionTable::sized(capacity);
    }
}
