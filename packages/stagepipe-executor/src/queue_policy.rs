//! Queue policies
//!
//! A queue policy hands out buffer slots to the three stages and the output
//! consumer. Slots flow forward only; a stage can never get ahead of its
//! downstream consumer by more than its queue depth because it blocks (or
//! reports exhaustion) when no free slot is left.
//!
//! Both policies keep all their state behind one mutex and wake waiters
//! through a single condvar on every transition.

use crate::error::{ExecutorError, Result};
use crate::graph::OpType;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::Index;
use tracing::{debug, trace};

/// Requested queue depths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSizes {
    pub cpu: usize,
    pub gpu: usize,
}

impl QueueSizes {
    pub fn new(cpu: usize, gpu: usize) -> Self {
        Self { cpu, gpu }
    }

    pub fn uniform(depth: usize) -> Self {
        Self {
            cpu: depth,
            gpu: depth,
        }
    }
}

impl Default for QueueSizes {
    fn default() -> Self {
        Self::uniform(2)
    }
}

/// Effective depth of each stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageQueues([usize; 3]);

impl StageQueues {
    pub fn new(cpu: usize, mixed: usize, gpu: usize) -> Self {
        Self([cpu, mixed, gpu])
    }

    pub fn total(&self) -> usize {
        self.0.iter().sum()
    }
}

impl Index<OpType> for StageQueues {
    type Output = usize;

    fn index(&self, stage: OpType) -> &usize {
        &self.0[stage.index()]
    }
}

/// Slot index of one iteration in each stage's queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct QueueIdxs([usize; 3]);

impl QueueIdxs {
    pub fn new(cpu: usize, mixed: usize, gpu: usize) -> Self {
        Self([cpu, mixed, gpu])
    }

    pub fn uniform(idx: usize) -> Self {
        Self([idx; 3])
    }

    /// Only the indices a stage can observe: its own and its upstream ones
    pub fn visible_to(&self, stage: OpType) -> Self {
        match stage {
            OpType::Cpu => Self([self.0[0], 0, 0]),
            OpType::Mixed => Self([self.0[0], self.0[1], 0]),
            OpType::Gpu => *self,
        }
    }
}

impl Index<OpType> for QueueIdxs {
    type Output = usize;

    fn index(&self, stage: OpType) -> &usize {
        &self.0[stage.index()]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// Wait until a slot is available or the queues are stopped
    Block,
    /// Report `Exhausted` instead of waiting
    NonBlocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready(QueueIdxs),
    Exhausted,
    Stopped,
}

/// Number of iterations `prefetch` pushes through the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchPlan {
    pub full_iterations: usize,
    pub cpu_only_iterations: usize,
}

pub trait QueuePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn stage_queue_depths(&self, sizes: QueueSizes) -> Result<StageQueues>;

    /// `hold_cpu_outputs`: CPU slots stay in use until the output is
    /// released, because CPU tensors are read past the MIXED stage.
    fn initialize_queues(&self, depths: StageQueues, hold_cpu_outputs: bool);

    fn acquire_idxs(&self, stage: OpType, mode: Acquire) -> AcquireOutcome;

    /// Hand a completed iteration to the next stage
    fn release_idxs(&self, stage: OpType, idxs: QueueIdxs);

    /// Return the slots of a failed or skipped iteration to the free lists
    fn discard_idxs(&self, stage: OpType, idxs: QueueIdxs);

    /// Take the oldest ready output. Outputs completed before a stop are
    /// still handed out.
    fn use_output_idxs(&self, mode: Acquire) -> AcquireOutcome;

    /// Release the oldest in-use output. Returns false if none was in use.
    fn release_output_idxs(&self) -> bool;

    fn signal_stop(&self);

    fn is_stop_signaled(&self) -> bool;

    fn prefetch_plan(&self) -> PrefetchPlan;
}

#[derive(Debug, Default)]
struct UniformState {
    depth: usize,
    free: VecDeque<usize>,
    // indexed by the stage that picks the slot up next
    stage_work: [VecDeque<usize>; 3],
    ready: VecDeque<usize>,
    in_use: VecDeque<usize>,
    stop: bool,
}

/// One depth for all stages; a slot travels through every stage
#[derive(Debug, Default)]
pub struct UniformQueuePolicy {
    state: Mutex<UniformState>,
    cond: Condvar,
}

impl UniformQueuePolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueuePolicy for UniformQueuePolicy {
    fn name(&self) -> &'static str {
        "uniform"
    }

    fn stage_queue_depths(&self, sizes: QueueSizes) -> Result<StageQueues> {
        if sizes.cpu != sizes.gpu {
            return Err(ExecutorError::config(format!(
                "Uniform queue policy requires equal CPU and GPU queue depths (got {} and {})",
                sizes.cpu, sizes.gpu
            )));
        }
        Ok(StageQueues::new(sizes.cpu, sizes.cpu, sizes.cpu))
    }

    fn initialize_queues(&self, depths: StageQueues, _hold_cpu_outputs: bool) {
        let mut st = self.state.lock();
        *st = UniformState {
            depth: depths[OpType::Cpu],
            free: (0..depths[OpType::Cpu]).collect(),
            ..UniformState::default()
        };
        debug!(depth = st.depth, "Initialized uniform queues");
    }

    fn acquire_idxs(&self, stage: OpType, mode: Acquire) -> AcquireOutcome {
        let mut st = self.state.lock();
        loop {
            if st.stop {
                return AcquireOutcome::Stopped;
            }
            let popped = match stage {
                OpType::Cpu => st.free.pop_front(),
                _ => st.stage_work[stage.index()].pop_front(),
            };
            if let Some(idx) = popped {
                trace!("{} stage acquired slot {}", stage, idx);
                return AcquireOutcome::Ready(QueueIdxs::uniform(idx));
            }
            match mode {
                Acquire::NonBlocking => return AcquireOutcome::Exhausted,
                Acquire::Block => self.cond.wait(&mut st),
            }
        }
    }

    fn release_idxs(&self, stage: OpType, idxs: QueueIdxs) {
        let mut st = self.state.lock();
        let idx = idxs[stage];
        match stage.next() {
            Some(next) => st.stage_work[next.index()].push_back(idx),
            None => st.ready.push_back(idx),
        }
        self.cond.notify_all();
    }

    fn discard_idxs(&self, stage: OpType, idxs: QueueIdxs) {
        let mut st = self.state.lock();
        st.free.push_back(idxs[stage]);
        self.cond.notify_all();
    }

    fn use_output_idxs(&self, mode: Acquire) -> AcquireOutcome {
        let mut st = self.state.lock();
        loop {
            if let Some(idx) = st.ready.pop_front() {
                st.in_use.push_back(idx);
                return AcquireOutcome::Ready(QueueIdxs::uniform(idx));
            }
            if st.stop {
                return AcquireOutcome::Stopped;
            }
            match mode {
                Acquire::NonBlocking => return AcquireOutcome::Exhausted,
                Acquire::Block => self.cond.wait(&mut st),
            }
        }
    }

    fn release_output_idxs(&self) -> bool {
        let mut st = self.state.lock();
        match st.in_use.pop_front() {
            Some(idx) => {
                st.free.push_back(idx);
                self.cond.notify_all();
                true
            }
            None => false,
        }
    }

    fn signal_stop(&self) {
        self.state.lock().stop = true;
        self.cond.notify_all();
    }

    fn is_stop_signaled(&self) -> bool {
        self.state.lock().stop
    }

    fn prefetch_plan(&self) -> PrefetchPlan {
        PrefetchPlan {
            full_iterations: self.state.lock().depth,
            cpu_only_iterations: 0,
        }
    }
}

#[derive(Debug, Default)]
struct SeparateState {
    cpu_depth: usize,
    gpu_depth: usize,
    hold_cpu_outputs: bool,
    cpu_free: VecDeque<usize>,
    gpu_free: VecDeque<usize>,
    // CPU done, waiting for MIXED
    cpu_ready: VecDeque<usize>,
    // MIXED done, waiting for GPU
    mixed_ready: VecDeque<QueueIdxs>,
    ready: VecDeque<QueueIdxs>,
    in_use: VecDeque<QueueIdxs>,
    stop: bool,
}

/// Independent CPU and MIXED/GPU depths. The CPU stage can run ahead of the
/// device stages by its own depth.
#[derive(Debug, Default)]
pub struct SeparateQueuePolicy {
    state: Mutex<SeparateState>,
    cond: Condvar,
}

impl SeparateQueuePolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueuePolicy for SeparateQueuePolicy {
    fn name(&self) -> &'static str {
        "separate"
    }

    fn stage_queue_depths(&self, sizes: QueueSizes) -> Result<StageQueues> {
        Ok(StageQueues::new(sizes.cpu, sizes.gpu, sizes.gpu))
    }

    fn initialize_queues(&self, depths: StageQueues, hold_cpu_outputs: bool) {
        let mut st = self.state.lock();
        *st = SeparateState {
            cpu_depth: depths[OpType::Cpu],
            gpu_depth: depths[OpType::Gpu],
            hold_cpu_outputs,
            cpu_free: (0..depths[OpType::Cpu]).collect(),
            gpu_free: (0..depths[OpType::Gpu]).collect(),
            ..SeparateState::default()
        };
        debug!(
            cpu_depth = st.cpu_depth,
            gpu_depth = st.gpu_depth,
            hold_cpu_outputs,
            "Initialized separate queues"
        );
    }

    fn acquire_idxs(&self, stage: OpType, mode: Acquire) -> AcquireOutcome {
        let mut st = self.state.lock();
        loop {
            if st.stop {
                return AcquireOutcome::Stopped;
            }
            let acquired = match stage {
                OpType::Cpu => st.cpu_free.pop_front().map(|c| QueueIdxs::new(c, 0, 0)),
                OpType::Mixed => {
                    if !st.cpu_ready.is_empty() && !st.gpu_free.is_empty() {
                        match (st.cpu_ready.pop_front(), st.gpu_free.pop_front()) {
                            (Some(c), Some(g)) => Some(QueueIdxs::new(c, g, g)),
                            _ => None,
                        }
                    } else {
                        None
                    }
                }
                OpType::Gpu => st.mixed_ready.pop_front(),
            };
            if let Some(idxs) = acquired {
                trace!("{} stage acquired slots {:?}", stage, idxs);
                return AcquireOutcome::Ready(idxs);
            }
            match mode {
                Acquire::NonBlocking => return AcquireOutcome::Exhausted,
                Acquire::Block => self.cond.wait(&mut st),
            }
        }
    }

    fn release_idxs(&self, stage: OpType, idxs: QueueIdxs) {
        let mut st = self.state.lock();
        match stage {
            OpType::Cpu => st.cpu_ready.push_back(idxs[OpType::Cpu]),
            OpType::Mixed => {
                if !st.hold_cpu_outputs {
                    st.cpu_free.push_back(idxs[OpType::Cpu]);
                }
                st.mixed_ready.push_back(idxs);
            }
            OpType::Gpu => st.ready.push_back(idxs),
        }
        self.cond.notify_all();
    }

    fn discard_idxs(&self, stage: OpType, idxs: QueueIdxs) {
        let mut st = self.state.lock();
        match stage {
            OpType::Cpu => st.cpu_free.push_back(idxs[OpType::Cpu]),
            OpType::Mixed => {
                st.cpu_free.push_back(idxs[OpType::Cpu]);
                st.gpu_free.push_back(idxs[OpType::Gpu]);
            }
            OpType::Gpu => {
                if st.hold_cpu_outputs {
                    st.cpu_free.push_back(idxs[OpType::Cpu]);
                }
                st.gpu_free.push_back(idxs[OpType::Gpu]);
            }
        }
        self.cond.notify_all();
    }

    fn use_output_idxs(&self, mode: Acquire) -> AcquireOutcome {
        let mut st = self.state.lock();
        loop {
            if let Some(idxs) = st.ready.pop_front() {
                st.in_use.push_back(idxs);
                return AcquireOutcome::Ready(idxs);
            }
            if st.stop {
                return AcquireOutcome::Stopped;
            }
            match mode {
                Acquire::NonBlocking => return AcquireOutcome::Exhausted,
                Acquire::Block => self.cond.wait(&mut st),
            }
        }
    }

    fn release_output_idxs(&self) -> bool {
        let mut st = self.state.lock();
        match st.in_use.pop_front() {
            Some(idxs) => {
                if st.hold_cpu_outputs {
                    st.cpu_free.push_back(idxs[OpType::Cpu]);
                }
                st.gpu_free.push_back(idxs[OpType::Gpu]);
                self.cond.notify_all();
                true
            }
            None => false,
        }
    }

    fn signal_stop(&self) {
        self.state.lock().stop = true;
        self.cond.notify_all();
    }

    fn is_stop_signaled(&self) -> bool {
        self.state.lock().stop
    }

    fn prefetch_plan(&self) -> PrefetchPlan {
        let st = self.state.lock();
        if st.hold_cpu_outputs {
            let full = st.cpu_depth.min(st.gpu_depth);
            PrefetchPlan {
                full_iterations: full,
                cpu_only_iterations: st.cpu_depth - full,
            }
        } else {
            PrefetchPlan {
                full_iterations: st.gpu_depth,
                cpu_only_iterations: st.cpu_depth,
            }
        }
    }
}
