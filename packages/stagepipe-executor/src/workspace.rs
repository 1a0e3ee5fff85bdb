//! Operator workspaces
//!
//! A workspace binds one operator run to concrete buffers: the input handles
//! come from the producing stages' queue slots, the outputs from the running
//! stage's slot. Workspace policies decide whether these bindings are built
//! ahead of time or per run.

use crate::device::DeviceStream;
use crate::error::{ExecutorError, Result};
use crate::graph::{OpGraph, OpNode, OpNodeId, OpType};
use crate::queue_policy::{QueueIdxs, StageQueues};
use crate::tensor::{TensorHandle, TensorList, TensorStoreQueue};
use parking_lot::{Mutex, RwLockReadGuard, RwLockWriteGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Per-run view handed to `Operator::run`
pub struct Workspace {
    instance_name: String,
    stage: OpType,
    inputs: Vec<TensorHandle>,
    outputs: Vec<TensorHandle>,
    batch_size: usize,
    iteration: u64,
    thread_pool: Arc<rayon::ThreadPool>,
    stream: Option<Arc<dyn DeviceStream>>,
}

impl Workspace {
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn stage(&self) -> OpType {
        self.stage
    }

    pub fn num_input(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_output(&self) -> usize {
        self.outputs.len()
    }

    pub fn input(&self, idx: usize) -> Result<RwLockReadGuard<'_, TensorList>> {
        self.inputs
            .get(idx)
            .map(|h| h.read())
            .ok_or_else(|| self.out_of_range("input", idx, self.inputs.len()))
    }

    pub fn output(&self, idx: usize) -> Result<RwLockWriteGuard<'_, TensorList>> {
        self.outputs
            .get(idx)
            .map(|h| h.write())
            .ok_or_else(|| self.out_of_range("output", idx, self.outputs.len()))
    }

    /// Shared handle to an input, e.g. to read it from device work
    pub fn input_handle(&self, idx: usize) -> Result<TensorHandle> {
        self.inputs
            .get(idx)
            .cloned()
            .ok_or_else(|| self.out_of_range("input", idx, self.inputs.len()))
    }

    /// Shared handle to an output, e.g. to fill it from device work
    pub fn output_handle(&self, idx: usize) -> Result<TensorHandle> {
        self.outputs
            .get(idx)
            .cloned()
            .ok_or_else(|| self.out_of_range("output", idx, self.outputs.len()))
    }

    pub fn outputs(&self) -> &[TensorHandle] {
        &self.outputs
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size;
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn set_iteration(&mut self, iteration: u64) {
        self.iteration = iteration;
    }

    pub fn thread_pool(&self) -> &rayon::ThreadPool {
        &self.thread_pool
    }

    /// Stream of the MIXED or GPU stage when running on a device
    pub fn stream(&self) -> Option<&Arc<dyn DeviceStream>> {
        self.stream.as_ref()
    }

    fn out_of_range(&self, kind: &str, idx: usize, len: usize) -> ExecutorError {
        ExecutorError::Internal(format!(
            "Operator `{}` asked for {} {} but has {}",
            self.instance_name, kind, idx, len
        ))
    }
}

impl std::fmt::Debug for Workspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workspace")
            .field("instance_name", &self.instance_name)
            .field("stage", &self.stage)
            .field("num_input", &self.inputs.len())
            .field("num_output", &self.outputs.len())
            .field("batch_size", &self.batch_size)
            .field("iteration", &self.iteration)
            .field("has_stream", &self.stream.is_some())
            .finish()
    }
}

/// Everything a policy needs to bind workspaces
#[derive(Clone)]
pub struct WorkspaceContext {
    pub graph: Arc<OpGraph>,
    pub storage: Arc<Vec<TensorStoreQueue>>,
    pub depths: StageQueues,
    pub thread_pool: Arc<rayon::ThreadPool>,
    pub mixed_stream: Option<Arc<dyn DeviceStream>>,
    pub gpu_stream: Option<Arc<dyn DeviceStream>>,
}

impl WorkspaceContext {
    pub fn build(&self, stage: OpType, idxs: QueueIdxs, node: &OpNode) -> Result<Workspace> {
        let mut inputs = Vec::with_capacity(node.parent_tensors.len());
        for &tid in &node.parent_tensors {
            let tensor = self.tensor(tid)?;
            let producer_stage = tensor.producer.op_type;
            inputs.push(self.queue(tid)?.slot(idxs[producer_stage]));
        }
        let mut outputs = Vec::with_capacity(node.children_tensors.len());
        for &tid in &node.children_tensors {
            outputs.push(self.queue(tid)?.slot(idxs[stage]));
        }
        let stream = match stage {
            OpType::Cpu => None,
            OpType::Mixed => self.mixed_stream.clone(),
            OpType::Gpu => self.gpu_stream.clone(),
        };
        Ok(Workspace {
            instance_name: node.instance_name.clone(),
            stage,
            inputs,
            outputs,
            batch_size: 0,
            iteration: 0,
            thread_pool: Arc::clone(&self.thread_pool),
            stream,
        })
    }

    fn tensor(&self, tid: usize) -> Result<&crate::graph::TensorNode> {
        self.graph
            .tensor(tid)
            .ok_or_else(|| ExecutorError::Internal(format!("Unknown tensor id {}", tid)))
    }

    fn queue(&self, tid: usize) -> Result<&TensorStoreQueue> {
        self.storage
            .get(tid)
            .ok_or_else(|| ExecutorError::Internal(format!("No storage for tensor {}", tid)))
    }
}

pub trait WorkspacePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn initialize(&mut self, ctx: WorkspaceContext) -> Result<()>;

    fn workspace(&self, stage: OpType, idxs: QueueIdxs, node: &OpNode)
        -> Result<Arc<Mutex<Workspace>>>;
}

type WorkspaceKey = (OpType, QueueIdxs, OpNodeId);

/// Builds every (stage, slot, operator) workspace at initialization
#[derive(Default)]
pub struct AotWorkspacePolicy {
    workspaces: HashMap<WorkspaceKey, Arc<Mutex<Workspace>>>,
}

impl AotWorkspacePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }
}

impl WorkspacePolicy for AotWorkspacePolicy {
    fn name(&self) -> &'static str {
        "aot"
    }

    fn initialize(&mut self, ctx: WorkspaceContext) -> Result<()> {
        self.workspaces.clear();
        let d = ctx.depths;
        for stage in OpType::ALL {
            let cpu_range = 0..d[OpType::Cpu];
            let mixed_range = if stage == OpType::Cpu { 0..1 } else { 0..d[OpType::Mixed] };
            let gpu_range = if stage == OpType::Gpu { 0..d[OpType::Gpu] } else { 0..1 };
            for node in ctx.graph.stage_nodes(stage) {
                for c in cpu_range.clone() {
                    for m in mixed_range.clone() {
                        for g in gpu_range.clone() {
                            let idxs = QueueIdxs::new(c, m, g);
                            let ws = ctx.build(stage, idxs, node)?;
                            self.workspaces
                                .insert((stage, idxs, node.id), Arc::new(Mutex::new(ws)));
                        }
                    }
                }
            }
        }
        debug!(count = self.workspaces.len(), "Pre-built workspaces");
        Ok(())
    }

    fn workspace(
        &self,
        stage: OpType,
        idxs: QueueIdxs,
        node: &OpNode,
    ) -> Result<Arc<Mutex<Workspace>>> {
        self.workspaces
            .get(&(stage, idxs.visible_to(stage), node.id))
            .cloned()
            .ok_or_else(|| {
                ExecutorError::Internal(format!(
                    "No workspace for `{}` in {} stage at {:?}",
                    node.instance_name, stage, idxs
                ))
            })
    }
}

/// Builds a fresh workspace for every run
#[derive(Default)]
pub struct JitWorkspacePolicy {
    ctx: Option<WorkspaceContext>,
}

impl JitWorkspacePolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkspacePolicy for JitWorkspacePolicy {
    fn name(&self) -> &'static str {
        "jit"
    }

    fn initialize(&mut self, ctx: WorkspaceContext) -> Result<()> {
        self.ctx = Some(ctx);
        Ok(())
    }

    fn workspace(
        &self,
        stage: OpType,
        idxs: QueueIdxs,
        node: &OpNode,
    ) -> Result<Arc<Mutex<Workspace>>> {
        let ctx = self
            .ctx
            .as_ref()
            .ok_or_else(|| ExecutorError::NotBuilt("workspace policy not initialized".into()))?;
        Ok(Arc::new(Mutex::new(ctx.build(stage, idxs.visible_to(stage), node)?)))
    }
}
