//! Worker pool bookkeeping.
//!
//! A pool bounds how many handlers may run concurrently for a given
//! priority tier. Admission (`try_dispatch`) is governed by in-memory
//! atomic counters; the persisted `worker_pools` row is a periodically
//! flushed mirror for the admin surface and is advisory only -- losing a
//! flush never corrupts the dispatch invariant.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

use core_db::models::Priority;

use crate::store::TaskStore;

/// In-memory occupancy tracking for a single pool.
struct PoolState {
    max_workers: AtomicI32,
    active_workers: AtomicUsize,
    queued_depth: AtomicUsize,
}

impl PoolState {
    fn new(max_workers: i32) -> Self {
        Self {
            max_workers: AtomicI32::new(max_workers),
            active_workers: AtomicUsize::new(0),
            queued_depth: AtomicUsize::new(0),
        }
    }
}

/// The outcome of a dispatch admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Accepted,
    RejectedFull,
    RejectedDisabled,
}

/// Tracks per-pool worker occupancy for the three priority tiers, and
/// periodically flushes counters to the store for observability.
///
/// `buffer size = 2 * max_workers` bounds the ready-queue depth the
/// scheduler is willing to hold before new admissions start competing with
/// dispatch, per pool.
pub struct WorkerPoolSet {
    pools: HashMap<String, PoolState>,
    disabled: HashMap<String, bool>,
}

impl WorkerPoolSet {
    /// Build a pool set from a static configuration map (pool name ->
    /// max_workers), then reconcile each pool's row in the store so the
    /// persisted config stays in sync without disturbing live counters.
    pub async fn bootstrap(
        store: &Arc<dyn TaskStore>,
        configured: &HashMap<String, i32>,
    ) -> Result<Self> {
        let mut pools = HashMap::new();
        let mut disabled = HashMap::new();

        for (name, &max_workers) in configured {
            let row = store
                .reconcile_pool(name, max_workers, true)
                .await
                .with_context(|| format!("failed to reconcile pool {name}"))?;
            pools.insert(name.clone(), PoolState::new(row.max_workers));
            disabled.insert(name.clone(), !row.enabled);
        }

        Ok(Self { pools, disabled })
    }

    pub fn pool_name_for(priority: Priority) -> &'static str {
        priority.pool_name()
    }

    pub fn buffer_size(&self, pool_name: &str) -> usize {
        self.pools
            .get(pool_name)
            .map(|p| p.max_workers.load(Ordering::Relaxed).max(0) as usize * 2)
            .unwrap_or(0)
    }

    /// Attempt to admit one more in-flight worker into `pool_name`. Returns
    /// `Accepted` and increments the active count iff the pool is enabled
    /// and under its `max_workers` limit.
    pub fn try_dispatch(&self, pool_name: &str) -> DispatchOutcome {
        if *self.disabled.get(pool_name).unwrap_or(&false) {
            return DispatchOutcome::RejectedDisabled;
        }

        let Some(state) = self.pools.get(pool_name) else {
            return DispatchOutcome::RejectedDisabled;
        };

        let max = state.max_workers.load(Ordering::Relaxed);
        loop {
            let current = state.active_workers.load(Ordering::Acquire);
            if current as i32 >= max {
                return DispatchOutcome::RejectedFull;
            }
            if state
                .active_workers
                .compare_exchange(
                    current,
                    current + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return DispatchOutcome::Accepted;
            }
        }
    }

    /// Release a previously admitted worker slot. Must be called exactly
    /// once per `Accepted` outcome, on both success and failure paths.
    pub fn release(&self, pool_name: &str) {
        if let Some(state) = self.pools.get(pool_name) {
            state.active_workers.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub fn active_workers(&self, pool_name: &str) -> usize {
        self.pools
            .get(pool_name)
            .map(|p| p.active_workers.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn set_queued_depth(&self, pool_name: &str, depth: usize) {
        if let Some(state) = self.pools.get(pool_name) {
            state.queued_depth.store(depth, Ordering::Relaxed);
        }
    }

    /// Flush every pool's live occupancy counters to the store. Called on a
    /// timer by the scheduler; failures are advisory and logged by the
    /// caller, never propagated into dispatch.
    pub async fn flush_counts(&self, store: &Arc<dyn TaskStore>) -> Result<()> {
        for (name, state) in &self.pools {
            let active = state.active_workers.load(Ordering::Acquire) as i32;
            let queued = state.queued_depth.load(Ordering::Relaxed) as i32;
            store
                .update_pool_counts(name, active, queued, active)
                .await
                .with_context(|| format!("failed to flush counts for pool {name}"))?;
        }
        Ok(())
    }

    /// Stop accepting new admissions into `pool_name` until re-enabled.
    /// Existing in-flight workers are unaffected.
    pub fn disable(&mut self, pool_name: &str) {
        self.disabled.insert(pool_name.to_string(), true);
    }

    pub fn enable(&mut self, pool_name: &str) {
        self.disabled.insert(pool_name.to_string(), false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_with(max_workers: i32) -> WorkerPoolSet {
        let mut pools = HashMap::new();
        pools.insert("default".to_string(), PoolState::new(max_workers));
        let mut disabled = HashMap::new();
        disabled.insert("default".to_string(), false);
        WorkerPoolSet { pools, disabled }
    }

    #[test]
    fn dispatch_admits_up_to_max_workers() {
        let pools = set_with(2);
        assert_eq!(pools.try_dispatch("default"), DispatchOutcome::Accepted);
        assert_eq!(pools.try_dispatch("default"), DispatchOutcome::Accepted);
        assert_eq!(pools.try_dispatch("default"), DispatchOutcome::RejectedFull);
    }

    #[test]
    fn release_frees_a_slot() {
        let pools = set_with(1);
        assert_eq!(pools.try_dispatch("default"), DispatchOutcome::Accepted);
        assert_eq!(pools.try_dispatch("default"), DispatchOutcome::RejectedFull);
        pools.release("default");
        assert_eq!(pools.try_dispatch("default"), DispatchOutcome::Accepted);
    }

    #[test]
    fn disabled_pool_rejects_even_when_empty() {
        let mut pools = set_with(4);
        pools.disable("default");
        assert_eq!(
            pools.try_dispatch("default"),
            DispatchOutcome::RejectedDisabled
        );
    }

    #[test]
    fn unknown_pool_rejects_as_disabled() {
        let pools = set_with(1);
        assert_eq!(
            pools.try_dispatch("nonexistent"),
            DispatchOutcome::RejectedDisabled
        );
    }

    #[test]
    fn buffer_size_is_double_max_workers() {
        let pools = set_with(3);
        assert_eq!(pools.buffer_size("default"), 6);
    }
}
