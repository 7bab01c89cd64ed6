//! In-process simulated parallelism grid
//!
//! Runs every worker of a grid as a task inside one process, implementing the
//! [`Collective`] contract with shared-memory barriers and reduction cells.
//! This is the reference implementation of the group-membership math and the
//! harness used by multi-worker tests.

use crate::collective::{Collective, ProcessGroup};
use crate::topology::{GridTopology, WorkerCoordinate};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{Barrier, Notify};
use tracing::debug;

/// Key identifying one concrete subgroup of a process-group axis.
type GroupKey = (ProcessGroup, usize);

/// Shared reduction cell for one subgroup.
///
/// Reductions are generation-counted so the same cell can be reused across
/// iterations: arrivals accumulate into `pending_max`, and the last arrival
/// publishes the result and bumps the generation.
struct ReduceCell {
    state: Mutex<ReduceState>,
    notify: Notify,
}

struct ReduceState {
    pending_max: f64,
    arrived: usize,
    result: f64,
    completed_generation: u64,
}

impl ReduceCell {
    fn new() -> Self {
        Self {
            state: Mutex::new(ReduceState {
                pending_max: f64::NEG_INFINITY,
                arrived: 0,
                result: 0.0,
                completed_generation: 0,
            }),
            notify: Notify::new(),
        }
    }
}

struct SimGridShared {
    barriers: DashMap<GroupKey, Arc<Barrier>>,
    reductions: DashMap<GroupKey, Arc<ReduceCell>>,
}

/// An in-process grid of simulated workers.
pub struct SimGrid {
    topology: GridTopology,
    shared: Arc<SimGridShared>,
}

impl SimGrid {
    /// Create a simulated grid with the given topology.
    pub fn new(topology: GridTopology) -> Self {
        Self {
            topology,
            shared: Arc::new(SimGridShared {
                barriers: DashMap::new(),
                reductions: DashMap::new(),
            }),
        }
    }

    /// Grid topology.
    pub fn topology(&self) -> GridTopology {
        self.topology
    }

    /// Hand out the collective endpoint for the worker at `global_rank`.
    pub fn worker(&self, global_rank: usize) -> Result<Arc<SimWorker>> {
        let coordinate = WorkerCoordinate::from_global_rank(self.topology, global_rank)?;
        Ok(Arc::new(SimWorker {
            coordinate,
            shared: Arc::clone(&self.shared),
        }))
    }

    /// Collective endpoints for every worker, ordered by global rank.
    pub fn workers(&self) -> Result<Vec<Arc<SimWorker>>> {
        (0..self.topology.world_size())
            .map(|rank| self.worker(rank))
            .collect()
    }
}

/// Per-worker endpoint into a [`SimGrid`].
pub struct SimWorker {
    coordinate: WorkerCoordinate,
    shared: Arc<SimGridShared>,
}

impl SimWorker {
    fn group_key(&self, group: ProcessGroup) -> GroupKey {
        (group, self.coordinate.group_index(group))
    }

    fn barrier_for(&self, group: ProcessGroup, size: usize) -> Arc<Barrier> {
        self.shared
            .barriers
            .entry(self.group_key(group))
            .or_insert_with(|| Arc::new(Barrier::new(size)))
            .clone()
    }

    fn reduce_cell(&self, group: ProcessGroup) -> Arc<ReduceCell> {
        self.shared
            .reductions
            .entry(self.group_key(group))
            .or_insert_with(|| Arc::new(ReduceCell::new()))
            .clone()
    }
}

#[async_trait]
impl Collective for SimWorker {
    fn is_initialized(&self) -> bool {
        true
    }

    fn coordinate(&self) -> Option<WorkerCoordinate> {
        Some(self.coordinate)
    }

    async fn barrier(&self, group: ProcessGroup) -> Result<()> {
        let size = self.coordinate.group_size(group);
        if size <= 1 {
            return Ok(());
        }
        debug!(group = %group, worker = self.coordinate.global_rank(), "Entering barrier");
        self.barrier_for(group, size).wait().await;
        Ok(())
    }

    async fn all_reduce_max(&self, value: f64, group: ProcessGroup) -> Result<f64> {
        if value.is_nan() {
            return Err(Error::Internal {
                message: "NaN submitted to all_reduce_max".to_string(),
            });
        }

        let size = self.coordinate.group_size(group);
        if size <= 1 {
            return Ok(value);
        }

        let cell = self.reduce_cell(group);
        let my_generation = {
            let mut state = cell.state.lock();
            let generation = state.completed_generation;
            if state.arrived == 0 {
                state.pending_max = value;
            } else {
                state.pending_max = state.pending_max.max(value);
            }
            state.arrived += 1;

            if state.arrived == size {
                // Last arrival publishes the result and resets for reuse.
                state.result = state.pending_max;
                state.completed_generation += 1;
                state.arrived = 0;
                state.pending_max = f64::NEG_INFINITY;
                cell.notify.notify_waiters();
                return Ok(state.result);
            }
            generation
        };

        loop {
            let notified = cell.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = cell.state.lock();
                if state.completed_generation > my_generation {
                    return Ok(state.result);
                }
            }
            notified.await;
        }
    }
}
