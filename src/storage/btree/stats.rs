use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of tree statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct TreeStatsSnapshot {
    /// Root-to-leaf descents for point lookups
    pub searches: u64,
    /// Range scans started
    pub range_scans: u64,
    /// Leaf splits performed
    pub leaf_splits: u64,
    /// Internal node splits performed
    pub internal_splits: u64,
    /// Leaf merges performed
    pub leaf_merges: u64,
    /// Internal node merges performed
    pub internal_merges: u64,
    /// Underflows fixed by moving entries from a sibling
    pub redistributions: u64,
    /// Committed blocks copied before their first modification
    pub cow_copies: u64,
    /// Dirty block sets written early because the write cache filled up
    pub spills: u64,
    /// Retired blocks returned to the recycle pool
    pub blocks_reclaimed: u64,
}

/// Thread-safe counters for tree operations.
#[derive(Default)]
pub struct TreeStats {
    searches: AtomicU64,
    range_scans: AtomicU64,
    leaf_splits: AtomicU64,
    internal_splits: AtomicU64,
    leaf_merges: AtomicU64,
    internal_merges: AtomicU64,
    redistributions: AtomicU64,
    cow_copies: AtomicU64,
    spills: AtomicU64,
    blocks_reclaimed: AtomicU64,
}

impl TreeStats {
    pub(crate) fn inc_searches(&self) {
        self.searches.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_range_scans(&self) {
        self.range_scans.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_splits(&self) {
        self.internal_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_leaf_merges(&self) {
        self.leaf_merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_internal_merges(&self) {
        self.internal_merges.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_redistributions(&self) {
        self.redistributions.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_cow_copies(&self) {
        self.cow_copies.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_spills(&self) {
        self.spills.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn add_blocks_reclaimed(&self, n: u64) {
        self.blocks_reclaimed.fetch_add(n, AtomicOrdering::Relaxed);
    }

    /// Creates a snapshot of all current statistics.
    pub fn snapshot(&self) -> TreeStatsSnapshot {
        TreeStatsSnapshot {
            searches: self.searches.load(AtomicOrdering::Relaxed),
            range_scans: self.range_scans.load(AtomicOrdering::Relaxed),
            leaf_splits: self.leaf_splits.load(AtomicOrdering::Relaxed),
            internal_splits: self.internal_splits.load(AtomicOrdering::Relaxed),
            leaf_merges: self.leaf_merges.load(AtomicOrdering::Relaxed),
            internal_merges: self.internal_merges.load(AtomicOrdering::Relaxed),
            redistributions: self.redistributions.load(AtomicOrdering::Relaxed),
            cow_copies: self.cow_copies.load(AtomicOrdering::Relaxed),
            spills: self.spills.load(AtomicOrdering::Relaxed),
            blocks_reclaimed: self.blocks_reclaimed.load(AtomicOrdering::Relaxed),
        }
    }

    /// Emits current statistics to the tracing infrastructure.
    pub fn emit_tracing(&self, index: &str) {
        let snapshot = self.snapshot();
        tracing::info!(
            target: "quarry::btree::stats",
            index,
            searches = snapshot.searches,
            range_scans = snapshot.range_scans,
            leaf_splits = snapshot.leaf_splits,
            internal_splits = snapshot.internal_splits,
            leaf_merges = snapshot.leaf_merges,
            internal_merges = snapshot.internal_merges,
            redistributions = snapshot.redistributions,
            cow_copies = snapshot.cow_copies,
            spills = snapshot.spills,
            blocks_reclaimed = snapshot.blocks_reclaimed,
            "btree stats snapshot"
        );
    }
}
