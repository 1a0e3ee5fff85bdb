//! Per-iteration bookkeeping
//!
//! A fixed ring indexed by iteration id. Slot `k` carries the batch size of
//! iteration `k` and the checkpoint taken right before it, i.e. the operator
//! states left behind by iteration `k - 1`. The ring is larger than the
//! number of iterations that can be in flight, so a slot is never reused
//! while it can still be read.

use crate::checkpoint::Checkpoint;
use parking_lot::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
pub struct IterationData {
    pub iteration: u64,
    pub batch_size: usize,
    pub checkpoint: Checkpoint,
}

impl IterationData {
    fn new() -> Self {
        Self {
            iteration: 0,
            batch_size: 0,
            checkpoint: Checkpoint::new(0),
        }
    }
}

#[derive(Debug)]
pub struct IterationRing {
    slots: Vec<Mutex<IterationData>>,
}

impl IterationRing {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size.max(1)).map(|_| Mutex::new(IterationData::new())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, iteration: u64) -> MutexGuard<'_, IterationData> {
        self.slots[(iteration % self.slots.len() as u64) as usize].lock()
    }

    /// Record the start of an iteration. Leaves the checkpoint alone: it
    /// belongs to the previous iteration's operators.
    pub fn start(&self, iteration: u64, batch_size: usize) {
        let mut data = self.slot(iteration);
        data.iteration = iteration;
        data.batch_size = batch_size;
    }

    /// Store an operator's post-run state in the following iteration's slot
    pub fn save_op_state(&self, iteration: u64, instance_name: &str, state: Vec<u8>) {
        let next = iteration + 1;
        let mut data = self.slot(next);
        data.checkpoint.iteration = next;
        data.checkpoint.set_op_state(instance_name, state);
    }
}
