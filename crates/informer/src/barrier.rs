use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Pending,
    Ready,
    /// The informer stopped before ever becoming ready.
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct State {
    phase: Phase,
    generation: u64,
}

/// Readiness gate: opens once the initial list is applied and delivered.
///
/// Cloning shares the gate. Ready never goes back to pending.
#[derive(Debug, Clone)]
pub struct SyncBarrier {
    tx: Arc<watch::Sender<State>>,
}

impl Default for SyncBarrier {
    fn default() -> Self { Self::new() }
}

impl SyncBarrier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(State { phase: Phase::Pending, generation: 0 });
        Self { tx: Arc::new(tx) }
    }

    pub fn is_synced(&self) -> bool { self.tx.borrow().phase == Phase::Ready }

    /// Number of full list batches applied so far (initial list plus relists).
    pub fn generation(&self) -> u64 { self.tx.borrow().generation }

    /// Wait until ready or cancelled. Returns `true` only when ready.
    pub async fn wait_for_sync(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            biased;
            res = rx.wait_for(|s| s.phase != Phase::Pending) => {
                res.map(|s| s.phase == Phase::Ready).unwrap_or(false)
            }
            _ = cancel.cancelled() => false,
        }
    }

    pub(crate) fn mark_synced(&self) {
        let mut opened = false;
        self.tx.send_modify(|s| {
            s.generation += 1;
            if s.phase == Phase::Pending {
                s.phase = Phase::Ready;
                opened = true;
            }
        });
        if opened {
            debug!("sync barrier opened");
        }
    }

    /// Release pending waiters with `false`. No effect once ready.
    pub(crate) fn close(&self) {
        self.tx.send_if_modified(|s| {
            if s.phase == Phase::Pending {
                s.phase = Phase::Closed;
                true
            } else {
                false
            }
        });
    }
}
