/*
 * stagepipe-executor
 *
 * Queue-pipelined execution of an operator graph over three stages:
 * CPU (host compute), MIXED (host to device transfer) and GPU (device
 * compute). Consecutive iterations overlap through depth-bounded queues
 * between the stages.
 *
 * Modules:
 * - graph / operator: graph view, operator and capability contract
 * - tensor: per-tensor buffer rings, pinning and presizing
 * - queue_policy: slot hand-off between stages (uniform, separate)
 * - workspace: operator run bindings (ahead-of-time, just-in-time)
 * - device: stream/event runtime, host-emulated device
 * - checkpoint / iteration: operator state snapshots per iteration
 * - stats: per-operator output memory statistics
 * - executor: synchronous and asynchronous staged executors, factory
 * - config / telemetry: configuration and logging setup
 */

pub mod checkpoint;
pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod graph;
pub mod iteration;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod operator;
pub mod queue_policy;
pub mod stats;
pub mod telemetry;
pub mod tensor;
pub mod workspace;

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use config::{ConfigError, ErrorPolicy, ExecutorConfig, ExecutorType, Validatable};
pub use device::{DeviceEvent, DeviceRuntime, DeviceStream, EmulatedDevice, EventList};
pub use error::{ErrorCategory, ExecutorError, Result};
pub use executor::{
    build_executor, AsyncExecutor, Executor, PipelineExecutor, PipelineOutputs, WorkerThread,
};
pub use graph::{GraphBuilder, OpGraph, OpNode, OpSpec, OpType, StorageDevice, TensorNode};
pub use operator::{FnOperator, OpCapabilities, Operator};
pub use queue_policy::{
    Acquire, AcquireOutcome, PrefetchPlan, QueueIdxs, QueuePolicy, QueueSizes,
    SeparateQueuePolicy, StageQueues, UniformQueuePolicy,
};
pub use stats::{ExecutorMetaMap, MemoryStats};
pub use telemetry::{init_logging, Verbosity};
pub use tensor::{TensorHandle, TensorList, TensorStoreQueue};
pub use workspace::{AotWorkspacePolicy, JitWorkspacePolicy, Workspace, WorkspacePolicy};
