//! Staged executors
//!
//! - `Executor`: synchronous, the caller drives the stages
//! - `AsyncExecutor`: one worker thread per stage
//! - `build_executor`: picks executor, queue policy and workspace policy from
//!   an `ExecutorConfig`

pub mod async_executor;
pub mod sync_executor;
pub mod worker;

pub use self::async_executor::AsyncExecutor;
pub use self::sync_executor::Executor;
pub use self::worker::WorkerThread;

use crate::checkpoint::Checkpoint;
use crate::config::{ExecutorConfig, ExecutorType};
use crate::device::DeviceRuntime;
use crate::error::Result;
use crate::graph::OpGraph;
use crate::queue_policy::{QueuePolicy, SeparateQueuePolicy, UniformQueuePolicy};
use crate::stats::ExecutorMetaMap;
use crate::tensor::TensorHandle;
use crate::workspace::AotWorkspacePolicy;
use std::sync::Arc;
use tracing::info;

/// Pipeline outputs of one iteration
///
/// Handles point into the executor's queue slots. Their contents are only
/// guaranteed until the outputs are released.
#[derive(Debug, Clone)]
pub struct PipelineOutputs {
    iteration: u64,
    tensors: Vec<(String, TensorHandle)>,
}

impl PipelineOutputs {
    pub fn new(iteration: u64, tensors: Vec<(String, TensorHandle)>) -> Self {
        Self { iteration, tensors }
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&TensorHandle> {
        self.tensors
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, handle)| handle)
    }

    pub fn tensor(&self, idx: usize) -> Option<&TensorHandle> {
        self.tensors.get(idx).map(|(_, handle)| handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorHandle)> {
        self.tensors.iter().map(|(n, h)| (n.as_str(), h))
    }
}

/// Common surface of the synchronous and asynchronous executors
pub trait PipelineExecutor: Send + Sync {
    fn build(&mut self, graph: Arc<OpGraph>, output_names: Vec<String>) -> Result<()>;
    fn prefetch(&self) -> Result<()>;
    fn run(&self) -> Result<()>;
    fn outputs(&self) -> Result<PipelineOutputs>;
    fn share_outputs(&self) -> Result<PipelineOutputs>;
    fn release_outputs(&self);
    fn executor_meta(&self) -> ExecutorMetaMap;
    fn enable_memory_stats(&self, enable: bool);
    fn enable_checkpointing(&self, enable: bool) -> Result<()>;
    fn current_checkpoint(&self) -> Result<Checkpoint>;
    fn restore_state_from_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
    fn has_conditionals(&self) -> bool;
    fn input_feed_count(&self, instance_name: &str) -> Result<usize>;
    fn shutdown(&self) -> Result<()>;
}

macro_rules! forward_pipeline_executor {
    ($ty:ty) => {
        impl PipelineExecutor for $ty {
            fn build(&mut self, graph: Arc<OpGraph>, output_names: Vec<String>) -> Result<()> {
                <$ty>::build(self, graph, output_names)
            }
            fn prefetch(&self) -> Result<()> {
                <$ty>::prefetch(self)
            }
            fn run(&self) -> Result<()> {
                <$ty>::run(self)
            }
            fn outputs(&self) -> Result<PipelineOutputs> {
                <$ty>::outputs(self)
            }
            fn share_outputs(&self) -> Result<PipelineOutputs> {
                <$ty>::share_outputs(self)
            }
            fn release_outputs(&self) {
                <$ty>::release_outputs(self)
            }
            fn executor_meta(&self) -> ExecutorMetaMap {
                <$ty>::executor_meta(self)
            }
            fn enable_memory_stats(&self, enable: bool) {
                <$ty>::enable_memory_stats(self, enable)
            }
            fn enable_checkpointing(&self, enable: bool) -> Result<()> {
                <$ty>::enable_checkpointing(self, enable)
            }
            fn current_checkpoint(&self) -> Result<Checkpoint> {
                <$ty>::current_checkpoint(self)
            }
            fn restore_state_from_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
                <$ty>::restore_state_from_checkpoint(self, checkpoint)
            }
            fn has_conditionals(&self) -> bool {
                <$ty>::has_conditionals(self)
            }
            fn input_feed_count(&self, instance_name: &str) -> Result<usize> {
                <$ty>::input_feed_count(self, instance_name)
            }
            fn shutdown(&self) -> Result<()> {
                <$ty>::shutdown(self)
            }
        }
    };
}

forward_pipeline_executor!(Executor);
forward_pipeline_executor!(AsyncExecutor);

/// Create the executor described by `config`.
///
/// `device` overrides the runtime; otherwise `config.device_id` selects an
/// emulated device and `None` runs CPU-only.
pub fn build_executor(
    config: ExecutorConfig,
    device: Option<Arc<dyn DeviceRuntime>>,
) -> Result<Box<dyn PipelineExecutor>> {
    let executor_type = config.executor_type;
    let queue_policy: Arc<dyn QueuePolicy> = if executor_type.is_separated() {
        Arc::new(SeparateQueuePolicy::new())
    } else {
        Arc::new(UniformQueuePolicy::new())
    };
    let workspace_policy = Box::new(AotWorkspacePolicy::new());

    info!(executor_type = %executor_type, "Creating executor");
    let executor: Box<dyn PipelineExecutor> = match executor_type {
        ExecutorType::AsyncPipelined | ExecutorType::AsyncSeparated => Box::new(
            AsyncExecutor::new(config, queue_policy, workspace_policy, device)?,
        ),
        ExecutorType::Simple | ExecutorType::Pipelined | ExecutorType::Separated => Box::new(
            Executor::new(config, queue_policy, workspace_policy, device)?,
        ),
    };
    Ok(executor)
}
