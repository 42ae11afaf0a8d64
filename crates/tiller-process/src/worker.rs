//! Worker generation
//!
//! Workers are OS threads pinned to one cycle snapshot. Each applies its
//! CPU affinity, runs the `init_process` pass on entry and the
//! `exit_process` pass on the way out. A retired generation drops its
//! snapshots when the last worker exits, which is what releases the old
//! cycle after a reload.

use crate::shutdown::ShutdownSignal;
use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use std::sync::Arc;
use std::thread::JoinHandle;
use tiller_config::CoreConfig;
use tiller_cycle::{Cycle, ModuleRegistry};

/// The worker threads of one cycle generation.
#[derive(Debug)]
pub struct WorkerPool {
    shutdown: ShutdownSignal,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers against `cycle`.
    ///
    /// A worker that cannot be spawned is logged and skipped; the pool
    /// runs with the workers it has.
    pub fn spawn(
        registry: Arc<ModuleRegistry>,
        cycle: Arc<Cycle>,
        core: &CoreConfig,
        count: usize,
    ) -> Self {
        let shutdown = ShutdownSignal::new();
        let mut handles = Vec::with_capacity(count);

        for n in 0..count {
            let registry = Arc::clone(&registry);
            let cycle = Arc::clone(&cycle);
            let affinity = core.worker_affinity(n);
            let mut rx = shutdown.subscribe();

            let spawned = std::thread::Builder::new()
                .name(format!("tiller-worker-{n}"))
                .spawn(move || {
                    if let Some(cpus) = affinity {
                        pin_to_cpus(n, &cpus);
                    }
                    if let Err(e) = registry.init_process_pass(&cycle) {
                        tracing::error!(worker = n, error = %e, "worker start failed");
                        return;
                    }
                    tracing::info!(worker = n, cycle = %cycle.id(), "worker started");

                    let _ = rx.blocking_recv();

                    registry.exit_process_pass(&cycle);
                    tracing::info!(worker = n, cycle = %cycle.id(), "worker stopped");
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    tracing::error!(worker = n, error = %e, "could not spawn worker");
                    break;
                }
            }
        }

        Self { shutdown, handles }
    }

    /// Number of workers.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signal every worker to stop.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Signal every worker and wait for all of them to exit.
    ///
    /// Consumes the pool; afterwards no thread holds this generation's
    /// cycle snapshot any more.
    pub fn retire(self) {
        self.shutdown.trigger();
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// Pin the calling worker thread to `cpus`. A failed pin is logged, never
/// fatal.
fn pin_to_cpus(worker: usize, cpus: &[usize]) {
    let mut set = CpuSet::new();
    for &cpu in cpus {
        if let Err(e) = set.set(cpu) {
            tracing::warn!(worker, cpu, error = %e, "cpu outside the supported range, affinity skipped");
            return;
        }
    }
    match sched_setaffinity(Pid::from_raw(0), &set) {
        Ok(()) => tracing::debug!(worker, ?cpus, "worker pinned"),
        Err(e) => tracing::warn!(worker, ?cpus, error = %e, "sched_setaffinity failed"),
    }
}
