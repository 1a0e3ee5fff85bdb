//! Staged executor
//!
//! Runs the operators of each stage in topological order over the buffers of
//! one queue slot. Stages only communicate through the queue policy: a stage
//! acquires a slot, runs its operators and releases the slot to the next
//! stage. The GPU stage releases into the ready-output queue.
//!
//! Called directly, the executor is synchronous: `run` drives the three
//! stages on the calling thread and reports back-pressure instead of
//! blocking. `AsyncExecutor` drives the same stage functions from one worker
//! thread per stage in blocking mode.

use super::PipelineOutputs;
use crate::checkpoint::Checkpoint;
use crate::config::{ErrorPolicy, ExecutorConfig, Validatable};
use crate::device::{DeviceRuntime, DeviceStream, EmulatedDevice, EventList};
use crate::error::{ExecutorError, Result};
use crate::graph::{OpGraph, OpNode, OpNodeId, OpType, StorageDevice, TensorNodeId};
use crate::iteration::IterationRing;
use crate::queue_policy::{Acquire, AcquireOutcome, PrefetchPlan, QueueIdxs, QueuePolicy, StageQueues};
use crate::stats::{ExecutorMetaMap, MemoryStatsCollector};
use crate::tensor::{create_backing_storage, prepin, presize, tensor_queue_sizes, TensorStoreQueue};
use crate::workspace::{WorkspaceContext, WorkspacePolicy};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// State created by `build`
struct Built {
    graph: Arc<OpGraph>,
    output_names: Vec<String>,
    pipeline_outputs: Vec<TensorNodeId>,
    storage: Arc<Vec<TensorStoreQueue>>,
    mixed_stream: Option<Arc<dyn DeviceStream>>,
    gpu_stream: Option<Arc<dyn DeviceStream>>,
    // recorded after the MIXED stage, awaited by the GPU stream
    mixed_stage_events: EventList,
    // recorded after the GPU stage, awaited before outputs are handed out
    gpu_output_events: EventList,
    batch_size_providers: Vec<OpNodeId>,
    has_conditionals: bool,
    iterations: IterationRing,
}

pub struct Executor {
    config: ExecutorConfig,
    queue_policy: Arc<dyn QueuePolicy>,
    workspace_policy: Box<dyn WorkspacePolicy>,
    device: Option<Arc<dyn DeviceRuntime>>,
    thread_pool: Arc<rayon::ThreadPool>,
    stage_depths: StageQueues,
    acquire_mode: Acquire,
    built: Option<Built>,
    stage_iterations: [AtomicU64; 3],
    output_iteration: AtomicU64,
    errors: Mutex<VecDeque<ExecutorError>>,
    exec_error: AtomicBool,
    stats: MemoryStatsCollector,
    checkpointing: AtomicBool,
    // stage runs hold it shared, checkpoint restore exclusively
    run_lock: RwLock<()>,
    shut_down: AtomicBool,
}

impl Executor {
    /// Without an explicit device runtime, a configured `device_id` gets an
    /// `EmulatedDevice`; no device id means CPU-only execution.
    pub fn new(
        config: ExecutorConfig,
        queue_policy: Arc<dyn QueuePolicy>,
        workspace_policy: Box<dyn WorkspacePolicy>,
        device: Option<Arc<dyn DeviceRuntime>>,
    ) -> Result<Self> {
        if config.max_batch_size == 0 {
            return Err(ExecutorError::InvalidBatchSize(
                "Max batch size must be greater than 0".to_string(),
            ));
        }
        config.validate()?;

        let stage_depths = queue_policy.stage_queue_depths(config.effective_queue_depths())?;
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .thread_name(|i| format!("stagepipe-op-{}", i))
            .build()
            .map_err(|e| ExecutorError::Internal(format!("Failed to build thread pool: {}", e)))?;
        let device = device.or_else(|| {
            config
                .device_id
                .map(|id| Arc::new(EmulatedDevice::new(id)) as Arc<dyn DeviceRuntime>)
        });

        info!(
            queue_policy = queue_policy.name(),
            workspace_policy = workspace_policy.name(),
            max_batch_size = config.max_batch_size,
            num_threads = config.num_threads,
            device = ?device.as_ref().map(|d| d.device_id()),
            "Created executor"
        );

        Ok(Self {
            stats: MemoryStatsCollector::new(config.enable_memory_stats),
            checkpointing: AtomicBool::new(config.enable_checkpointing),
            config,
            queue_policy,
            workspace_policy,
            device,
            thread_pool: Arc::new(thread_pool),
            stage_depths,
            acquire_mode: Acquire::NonBlocking,
            built: None,
            stage_iterations: Default::default(),
            output_iteration: AtomicU64::new(0),
            errors: Mutex::new(VecDeque::new()),
            exec_error: AtomicBool::new(false),
            run_lock: RwLock::new(()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Stage functions block instead of reporting back-pressure
    pub(crate) fn set_blocking(&mut self) {
        self.acquire_mode = Acquire::Block;
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn stage_queue_depths(&self) -> StageQueues {
        self.stage_depths
    }

    pub fn device(&self) -> Option<&Arc<dyn DeviceRuntime>> {
        self.device.as_ref()
    }

    pub fn thread_pool(&self) -> &Arc<rayon::ThreadPool> {
        &self.thread_pool
    }

    pub fn build(&mut self, graph: Arc<OpGraph>, output_names: Vec<String>) -> Result<()> {
        if self.built.is_some() {
            return Err(ExecutorError::construction("Executor is already built"));
        }
        if graph.num_op(None) == 0 {
            return Err(ExecutorError::construction("Graph has no operators"));
        }
        graph.instantiate_operators()?;
        let pipeline_outputs = graph.get_outputs(&output_names)?;

        let sizes = tensor_queue_sizes(&graph, &pipeline_outputs, self.stage_depths);
        let storage = create_backing_storage(&graph, &sizes);

        let (mixed_stream, gpu_stream, mixed_stage_events, gpu_output_events) = match &self.device
        {
            Some(device) => (
                Some(device.create_stream()?),
                Some(device.create_stream()?),
                EventList::new(self.stage_depths[OpType::Mixed]),
                EventList::new(self.stage_depths[OpType::Gpu]),
            ),
            None => (None, None, EventList::default(), EventList::default()),
        };

        prepin(
            &storage,
            &graph,
            self.device.is_none(),
            self.config.restrict_pinned_memory,
        );
        presize(
            &storage,
            &graph,
            self.config.bytes_per_sample_hint,
            self.config.max_batch_size,
        );
        let storage = Arc::new(storage);

        self.workspace_policy.initialize(WorkspaceContext {
            graph: Arc::clone(&graph),
            storage: Arc::clone(&storage),
            depths: self.stage_depths,
            thread_pool: Arc::clone(&self.thread_pool),
            mixed_stream: mixed_stream.clone(),
            gpu_stream: gpu_stream.clone(),
        })?;

        let hold_cpu_outputs = holds_cpu_outputs(&graph, &pipeline_outputs);
        self.queue_policy
            .initialize_queues(self.stage_depths, hold_cpu_outputs);

        let batch_size_providers: Vec<OpNodeId> = graph
            .nodes()
            .filter(|n| n.capabilities.batch_size_provider)
            .map(|n| n.id)
            .collect();
        let has_conditionals = graph.has_conditionals();

        self.built = Some(Built {
            iterations: IterationRing::new(self.stage_depths.total() + 1),
            graph,
            output_names,
            pipeline_outputs,
            storage,
            mixed_stream,
            gpu_stream,
            mixed_stage_events,
            gpu_output_events,
            batch_size_providers,
            has_conditionals,
        });

        if self.checkpointing.load(Ordering::SeqCst) {
            self.init_checkpointing()?;
        }

        if let Some(built) = &self.built {
            info!(
                num_ops = built.graph.num_op(None),
                num_outputs = built.pipeline_outputs.len(),
                batch_size_providers = built.batch_size_providers.len(),
                has_conditionals,
                "Executor built"
            );
        }
        Ok(())
    }

    fn built(&self) -> Result<&Built> {
        self.built
            .as_ref()
            .ok_or_else(|| ExecutorError::NotBuilt("call build() first".to_string()))
    }

    pub fn is_built(&self) -> bool {
        self.built.is_some()
    }

    pub fn graph(&self) -> Option<&Arc<OpGraph>> {
        self.built.as_ref().map(|b| &b.graph)
    }

    pub fn operator_names(&self) -> Vec<String> {
        self.graph()
            .map(|g| g.nodes().map(|n| n.instance_name.clone()).collect())
            .unwrap_or_default()
    }

    /// Storage ring of a named tensor
    pub fn tensor_queue(&self, name: &str) -> Option<&TensorStoreQueue> {
        let built = self.built.as_ref()?;
        let tensor = built.graph.tensor_by_name(name)?;
        built.storage.get(tensor.id)
    }

    pub fn prefetch_plan(&self) -> PrefetchPlan {
        let plan = self.queue_policy.prefetch_plan();
        match self.acquire_mode {
            Acquire::Block => plan,
            // leave one CPU slot free for the first steady-state run
            Acquire::NonBlocking => PrefetchPlan {
                full_iterations: plan.full_iterations,
                cpu_only_iterations: plan.cpu_only_iterations.saturating_sub(1),
            },
        }
    }

    /// Fill the queues before the first `outputs` call
    pub fn prefetch(&self) -> Result<()> {
        let plan = self.prefetch_plan();
        debug!(
            full = plan.full_iterations,
            cpu_only = plan.cpu_only_iterations,
            "Prefetching"
        );
        for _ in 0..plan.full_iterations {
            self.run()?;
        }
        for _ in 0..plan.cpu_only_iterations {
            self.run_cpu()?;
        }
        Ok(())
    }

    pub fn run(&self) -> Result<()> {
        self.run_cpu()?;
        self.run_mixed()?;
        self.run_gpu()
    }

    pub fn run_cpu(&self) -> Result<()> {
        self.run_stage(OpType::Cpu)
    }

    pub fn run_mixed(&self) -> Result<()> {
        self.run_stage(OpType::Mixed)
    }

    pub fn run_gpu(&self) -> Result<()> {
        self.run_stage(OpType::Gpu)
    }

    fn run_stage(&self, stage: OpType) -> Result<()> {
        let built = self.built()?;
        let idxs = match self.queue_policy.acquire_idxs(stage, self.acquire_mode) {
            AcquireOutcome::Ready(idxs) => idxs,
            AcquireOutcome::Stopped => return Err(self.peek_error()),
            AcquireOutcome::Exhausted => return Err(ExecutorError::QueueDepthExhausted(stage)),
        };

        let _running = self.run_lock.read();
        if self.exec_error.load(Ordering::SeqCst) || self.queue_policy.is_stop_signaled() {
            self.queue_policy.discard_idxs(stage, idxs);
            return Err(self.peek_error());
        }
        let iteration = self.stage_iterations[stage.index()].fetch_add(1, Ordering::SeqCst);

        let batch_size = if stage == OpType::Cpu {
            match self.infer_batch_size(built) {
                Ok(batch_size) => {
                    built.iterations.start(iteration, batch_size);
                    batch_size
                }
                Err(e) => return self.fail_iteration(stage, idxs, vec![e]),
            }
        } else {
            built.iterations.slot(iteration).batch_size
        };

        if let Err(e) = self.before_stage(built, stage, idxs) {
            return self.fail_iteration(stage, idxs, vec![e]);
        }

        let mut failures = Vec::new();
        for node in built.graph.stage_nodes(stage) {
            if let Err(e) = self.run_node(built, stage, idxs, node, iteration, batch_size) {
                error!("{}", e);
                failures.push(e);
                if self.config.error_policy == ErrorPolicy::StopOnError {
                    break;
                }
            }
        }
        if !failures.is_empty() {
            return self.fail_iteration(stage, idxs, failures);
        }

        if let Err(e) = self.after_stage(built, stage, idxs) {
            return self.fail_iteration(stage, idxs, vec![e]);
        }
        self.queue_policy.release_idxs(stage, idxs);
        Ok(())
    }

    fn run_node(
        &self,
        built: &Built,
        stage: OpType,
        idxs: QueueIdxs,
        node: &OpNode,
        iteration: u64,
        batch_size: usize,
    ) -> Result<()> {
        let ws = self.workspace_policy.workspace(stage, idxs, node)?;
        let mut ws = ws.lock();
        ws.set_batch_size(batch_size);
        ws.set_iteration(iteration);

        let mut op = node.operator();
        op.run(&mut ws).map_err(|e| operator_error(node, e))?;
        if self.checkpointing.load(Ordering::SeqCst) {
            let state = op
                .save_state()
                .map_err(|e| operator_error(node, e.context("failed to save state")))?;
            built
                .iterations
                .save_op_state(iteration, &node.instance_name, state);
        }
        drop(op);

        self.stats.record(stage, &node.instance_name, ws.outputs());
        Ok(())
    }

    fn before_stage(&self, built: &Built, stage: OpType, idxs: QueueIdxs) -> Result<()> {
        if stage != OpType::Gpu {
            return Ok(());
        }
        match (&built.gpu_stream, built.mixed_stage_events.get(idxs[OpType::Mixed])) {
            (Some(stream), Some(event)) => stream.wait(event),
            _ => Ok(()),
        }
    }

    fn after_stage(&self, built: &Built, stage: OpType, idxs: QueueIdxs) -> Result<()> {
        match stage {
            OpType::Cpu => Ok(()),
            OpType::Mixed => {
                match (&built.mixed_stream, built.mixed_stage_events.get(idxs[OpType::Mixed])) {
                    (Some(stream), Some(event)) => stream.record(event),
                    _ => Ok(()),
                }
            }
            OpType::Gpu => {
                match (&built.gpu_stream, built.gpu_output_events.get(idxs[OpType::Gpu])) {
                    (Some(stream), Some(event)) => stream.record(event),
                    _ => Ok(()),
                }
            }
        }
    }

    fn fail_iteration(
        &self,
        stage: OpType,
        idxs: QueueIdxs,
        failures: Vec<ExecutorError>,
    ) -> Result<()> {
        self.errors.lock().extend(failures);
        self.exec_error.store(true, Ordering::SeqCst);
        self.queue_policy.signal_stop();
        self.queue_policy.discard_idxs(stage, idxs);
        warn!("{} stage iteration failed, executor stopped", stage);
        Err(self.peek_error())
    }

    fn infer_batch_size(&self, built: &Built) -> Result<usize> {
        let max = self.config.max_batch_size;
        let mut agreed: Option<(usize, &str)> = None;
        for &id in &built.batch_size_providers {
            let node = built
                .graph
                .node_by_id(id)
                .ok_or_else(|| ExecutorError::Internal(format!("Unknown node id {}", id)))?;
            let next = node.operator().next_batch_size().ok_or_else(|| {
                ExecutorError::InvalidBatchSize(format!(
                    "Batch size provider `{}` has no data queued",
                    node.instance_name
                ))
            })?;
            match agreed {
                None => agreed = Some((next, node.instance_name.as_str())),
                Some((size, first)) if size != next => {
                    return Err(ExecutorError::InvalidBatchSize(format!(
                        "Batch size providers disagree: `{}` gives {}, `{}` gives {}",
                        first, size, node.instance_name, next
                    )));
                }
                Some(_) => {}
            }
        }
        let batch_size = agreed.map(|(size, _)| size).unwrap_or(max);
        if batch_size == 0 || batch_size > max {
            return Err(ExecutorError::InvalidBatchSize(format!(
                "Batch size {} is outside 1..={}",
                batch_size, max
            )));
        }
        Ok(batch_size)
    }

    /// Release the previous outputs and hand out the next ones
    pub fn outputs(&self) -> Result<PipelineOutputs> {
        self.release_outputs();
        self.share_outputs()
    }

    /// Hand out the next ready outputs without releasing earlier ones.
    /// The buffers stay valid until `release_outputs`.
    pub fn share_outputs(&self) -> Result<PipelineOutputs> {
        let built = self.built()?;
        let idxs = match self.queue_policy.use_output_idxs(self.acquire_mode) {
            AcquireOutcome::Ready(idxs) => idxs,
            AcquireOutcome::Stopped => return Err(self.rethrow_error()),
            AcquireOutcome::Exhausted => return Err(ExecutorError::NoOutputsReady),
        };
        let iteration = self.output_iteration.fetch_add(1, Ordering::SeqCst);

        if let Some(event) = built.gpu_output_events.get(idxs[OpType::Gpu]) {
            event.synchronize();
        }

        let tensors = built
            .pipeline_outputs
            .iter()
            .zip(&built.output_names)
            .map(|(&tid, name)| {
                let queue = &built.storage[tid];
                (name.clone(), queue.slot(idxs[queue.stage()]))
            })
            .collect();
        Ok(PipelineOutputs::new(iteration, tensors))
    }

    pub fn release_outputs(&self) {
        self.queue_policy.release_output_idxs();
    }

    /// Oldest recorded error, left in place
    fn peek_error(&self) -> ExecutorError {
        self.errors
            .lock()
            .front()
            .cloned()
            .unwrap_or_else(|| self.fallback_error())
    }

    /// Oldest recorded error, consumed
    fn rethrow_error(&self) -> ExecutorError {
        self.errors
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback_error())
    }

    fn fallback_error(&self) -> ExecutorError {
        if self.queue_policy.is_stop_signaled() && !self.exec_error.load(Ordering::SeqCst) {
            ExecutorError::StopSignaled
        } else {
            ExecutorError::Unknown
        }
    }

    /// Stop after a failure surfaced outside the stage functions. The error
    /// itself has already been returned to the caller.
    pub(crate) fn note_external_error(&self, error: &ExecutorError) {
        if !error.is_stop() {
            self.exec_error.store(true, Ordering::SeqCst);
        }
        self.queue_policy.signal_stop();
    }

    pub fn has_errors(&self) -> bool {
        self.exec_error.load(Ordering::SeqCst)
    }

    pub fn executor_meta(&self) -> ExecutorMetaMap {
        self.stats.snapshot()
    }

    pub fn enable_memory_stats(&self, enable: bool) {
        self.stats.set_enabled(enable);
    }

    /// Enabling after build captures the initial checkpoint right away,
    /// which requires an idle executor.
    pub fn enable_checkpointing(&self, enable: bool) -> Result<()> {
        if enable && self.built.is_some() && !self.checkpointing.load(Ordering::SeqCst) {
            let _idle = self.run_lock.write();
            self.ensure_idle()?;
            self.checkpointing.store(true, Ordering::SeqCst);
            return self.init_checkpointing();
        }
        self.checkpointing.store(enable, Ordering::SeqCst);
        Ok(())
    }

    pub fn checkpointing_enabled(&self) -> bool {
        self.checkpointing.load(Ordering::SeqCst)
    }

    fn init_checkpointing(&self) -> Result<()> {
        let built = self.built()?;
        let iteration = self.output_iteration.load(Ordering::SeqCst);
        let mut checkpoint = Checkpoint::new(iteration);
        for node in built.graph.nodes() {
            let state = node
                .operator()
                .save_state()
                .map_err(|e| operator_error(node, e))?;
            checkpoint.set_op_state(&node.instance_name, state);
        }
        built.iterations.slot(iteration).checkpoint = checkpoint;
        debug!(iteration, "Captured initial checkpoint");
        Ok(())
    }

    /// Operator states consistent with the outputs consumed so far
    pub fn current_checkpoint(&self) -> Result<Checkpoint> {
        if !self.checkpointing.load(Ordering::SeqCst) {
            return Err(ExecutorError::checkpoint("Checkpointing is not enabled"));
        }
        let built = self.built()?;
        let iteration = self.output_iteration.load(Ordering::SeqCst);
        let checkpoint = built.iterations.slot(iteration).checkpoint.clone();
        Ok(checkpoint)
    }

    pub fn restore_state_from_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let built = self.built()?;
        let _idle = self.run_lock.write();
        self.ensure_idle()?;

        for node in built.graph.nodes() {
            if checkpoint.op_state(&node.instance_name).is_none() {
                return Err(ExecutorError::checkpoint(format!(
                    "Checkpoint has no state for operator `{}`",
                    node.instance_name
                )));
            }
        }
        for node in built.graph.nodes() {
            if let Some(state) = checkpoint.op_state(&node.instance_name) {
                node.operator()
                    .restore_state(state)
                    .map_err(|e| operator_error(node, e.context("failed to restore state")))?;
            }
        }

        if self.checkpointing.load(Ordering::SeqCst) {
            let iteration = self.output_iteration.load(Ordering::SeqCst);
            built.iterations.slot(iteration).checkpoint = checkpoint.clone();
        }
        info!(
            checkpoint = %checkpoint.id,
            iteration = checkpoint.iteration,
            "Restored operator states"
        );
        Ok(())
    }

    fn ensure_idle(&self) -> Result<()> {
        let started = self.stage_iterations[OpType::Cpu.index()].load(Ordering::SeqCst);
        let consumed = self.output_iteration.load(Ordering::SeqCst);
        if started != consumed {
            return Err(ExecutorError::Busy(format!(
                "{} iteration(s) in flight",
                started.saturating_sub(consumed)
            )));
        }
        Ok(())
    }

    pub fn has_conditionals(&self) -> bool {
        self.built.as_ref().map(|b| b.has_conditionals).unwrap_or(false)
    }

    /// Number of batches an input operator must have queued before `prefetch`
    pub fn input_feed_count(&self, instance_name: &str) -> Result<usize> {
        let built = self.built()?;
        if built.graph.node_by_name(instance_name).is_none() {
            return Err(ExecutorError::OperatorNotFound(instance_name.to_string()));
        }
        let plan = self.prefetch_plan();
        Ok(plan.full_iterations + plan.cpu_only_iterations)
    }

    /// Iterations started by a stage
    pub fn stage_iterations(&self, stage: OpType) -> u64 {
        self.stage_iterations[stage.index()].load(Ordering::SeqCst)
    }

    pub fn outputs_consumed(&self) -> u64 {
        self.output_iteration.load(Ordering::SeqCst)
    }

    /// Stop handing out slots; blocked stages and consumers wake up
    pub fn shutdown_queue(&self) {
        self.queue_policy.signal_stop();
    }

    pub fn sync_device(&self) -> Result<()> {
        match &self.device {
            Some(device) => device.synchronize(),
            None => Ok(()),
        }
    }

    /// Returns true the first time only
    pub(crate) fn mark_shut_down(&self) -> bool {
        !self.shut_down.swap(true, Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stop the queues and wait for outstanding device work. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        if !self.mark_shut_down() {
            return Ok(());
        }
        self.shutdown_queue();
        self.sync_device()?;
        info!("Executor shut down");
        Ok(())
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("Executor shutdown failed: {}", e);
        }
    }
}

fn operator_error(node: &OpNode, e: anyhow::Error) -> ExecutorError {
    ExecutorError::Operator {
        instance_name: node.instance_name.clone(),
        stage: node.op_type,
        schema: node.spec.schema_name().to_string(),
        message: format!("{:#}", e),
    }
}

/// CPU tensors read past the MIXED stage (by GPU operators or as pipeline
/// outputs) pin their CPU slot until the output is released.
fn holds_cpu_outputs(graph: &OpGraph, pipeline_outputs: &[TensorNodeId]) -> bool {
    graph.tensors().any(|t| {
        t.producer.op_type == OpType::Cpu
            && t.producer.storage_device == StorageDevice::Cpu
            && (pipeline_outputs.contains(&t.id)
                || t.consumers.iter().any(|&c| {
                    graph
                        .node_by_id(c)
                        .map(|n| n.op_type == OpType::Gpu)
                        .unwrap_or(false)
                }))
    })
}
