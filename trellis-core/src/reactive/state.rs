//! Node staleness.
//!
//! A derived node is Dirty when it was told that something it read changed
//! (or it never ran), and Clean once an evaluation has caught up with every
//! invalidation it received.
//!
//! Invalidations are counted rather than flagged. An evaluation remembers the
//! count it started from and, when it publishes, marks the node clean only up
//! to that count. An invalidation that lands while the derivation is running
//! therefore keeps the node dirty after the publish.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Externally visible state of a derived node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// The cached value is up to date.
    Clean,

    /// The node must recompute before its value can be served.
    Dirty,
}

/// Epoch at which an evaluation started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Epoch(u64);

#[derive(Debug)]
pub(crate) struct Staleness {
    invalidations: AtomicU64,
    clean_at: AtomicU64,
    /// Set whenever a reader starts, cleared when an invalidation is
    /// forwarded.
    read_since_forward: AtomicBool,
}

impl Staleness {
    /// A fresh node: dirty, never read.
    pub(crate) fn new() -> Self {
        Self {
            invalidations: AtomicU64::new(1),
            clean_at: AtomicU64::new(0),
            read_since_forward: AtomicBool::new(false),
        }
    }

    /// A node whose value is valid from the start.
    pub(crate) fn clean() -> Self {
        Self {
            invalidations: AtomicU64::new(0),
            clean_at: AtomicU64::new(0),
            read_since_forward: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_flagged(&self) -> bool {
        self.invalidations.load(Ordering::SeqCst) != self.clean_at.load(Ordering::SeqCst)
    }

    /// Must be called before a reader inspects the node.
    pub(crate) fn begin_read(&self) {
        self.read_since_forward.store(true, Ordering::SeqCst);
    }

    pub(crate) fn begin_evaluation(&self) -> Epoch {
        Epoch(self.invalidations.load(Ordering::SeqCst))
    }

    /// Publish: clean up to the epoch the evaluation started from.
    pub(crate) fn mark_clean(&self, epoch: Epoch) {
        self.clean_at.fetch_max(epoch.0, Ordering::SeqCst);
    }

    /// Record an invalidation. Returns whether it has to be forwarded.
    ///
    /// It can be skipped only if the node was already dirty and nobody has
    /// started reading it since the last forwarded invalidation: every
    /// dependent then already knows.
    pub(crate) fn invalidate(&self) -> bool {
        let previous = self.invalidations.fetch_add(1, Ordering::SeqCst);
        let was_clean = previous == self.clean_at.load(Ordering::SeqCst);
        let was_read = self.read_since_forward.swap(false, Ordering::SeqCst);
        was_clean || was_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_dirty() {
        let staleness = Staleness::new();
        assert!(staleness.is_flagged());
    }

    #[test]
    fn publish_cleans_up_to_start_epoch() {
        let staleness = Staleness::new();
        let epoch = staleness.begin_evaluation();
        staleness.mark_clean(epoch);
        assert!(!staleness.is_flagged());

        let epoch = staleness.begin_evaluation();
        assert!(staleness.invalidate());
        staleness.mark_clean(epoch);
        assert!(staleness.is_flagged());
    }

    #[test]
    fn repeated_invalidation_without_reads_is_not_forwarded() {
        let staleness = Staleness::new();
        staleness.mark_clean(staleness.begin_evaluation());

        assert!(staleness.invalidate());
        assert!(!staleness.invalidate());

        staleness.begin_read();
        assert!(staleness.invalidate());
    }
}
