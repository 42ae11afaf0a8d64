//! Shutdown signalling and connection draining

use std::sync::Arc;
use std::time::Duration;
use tiller_cycle::Cycle;
use tokio::sync::broadcast;

/// Shutdown broadcaster for one worker generation.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    sender: Arc<broadcast::Sender<()>>,
}

impl ShutdownSignal {
    /// Create a new shutdown signal.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.sender.subscribe()
    }

    /// Trigger shutdown for every subscriber.
    pub fn trigger(&self) {
        let _ = self.sender.send(());
        tracing::debug!("shutdown signalled");
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Wait until every connection slot of `cycle` is released, or until
/// `timeout` elapses.
///
/// Returns `true` if the table drained in time. On `false` the stragglers
/// are force-closed by the caller dropping the generation; the deadline is
/// the upper bound on graceful shutdown.
pub async fn drain_connections(cycle: &Cycle, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut tick = tokio::time::interval(Duration::from_millis(50));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let table = cycle.connections();
        if table.available() == table.capacity() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            let open = table.capacity() - table.available();
            tracing::warn!(open, "shutdown deadline reached, force-closing connections");
            return false;
        }
        tick.tick().await;
    }
}
