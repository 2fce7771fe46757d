use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Counters {
    total: AtomicUsize,
    in_flight: AtomicUsize,
    failed: AtomicUsize,
    completed: AtomicUsize,
}

/// Progress counters of a download, shared between the coordinator and
/// whoever reports on it. Purely observational.
#[derive(Debug, Clone, Default)]
pub struct Tally(Arc<Counters>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TallySnapshot {
    /// Signatures pending at the start of the current round.
    pub total: usize,
    /// Units currently being fetched or absorbed.
    pub in_flight: usize,
    /// Units that failed this round.
    pub failed: usize,
    /// Signatures written this round.
    pub completed: usize,
}

impl TallySnapshot {
    pub fn pending(&self) -> usize {
        self.total.saturating_sub(self.completed)
    }
}

impl Tally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self, total: usize) {
        let counters = &self.0;
        counters.total.store(total, Ordering::Relaxed);
        counters.in_flight.store(0, Ordering::Relaxed);
        counters.failed.store(0, Ordering::Relaxed);
        counters.completed.store(0, Ordering::Relaxed);
    }

    pub(crate) fn start_unit(&self) {
        self.0.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn finish_unit(&self, failed: bool) {
        self.0.in_flight.fetch_sub(1, Ordering::Relaxed);
        if failed {
            self.0.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn complete(&self, signatures: usize) {
        self.0.completed.fetch_add(signatures, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TallySnapshot {
        let counters = &self.0;
        TallySnapshot {
            total: counters.total.load(Ordering::Relaxed),
            in_flight: counters.in_flight.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            completed: counters.completed.load(Ordering::Relaxed),
        }
    }
}
