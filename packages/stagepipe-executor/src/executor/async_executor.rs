//! Asynchronous staged executor
//!
//! One dedicated thread per stage drives the stage functions of a shared
//! `Executor` in blocking mode. `run_*` only enqueue work; `outputs` blocks
//! until the next iteration is ready, the queues are stopped or a worker
//! reported an error.

use super::worker::WorkerThread;
use super::{Executor, PipelineOutputs};
use crate::checkpoint::Checkpoint;
use crate::config::ExecutorConfig;
use crate::device::DeviceRuntime;
use crate::error::{ExecutorError, Result};
use crate::graph::{OpGraph, OpType};
use crate::queue_policy::QueuePolicy;
use crate::stats::ExecutorMetaMap;
use crate::workspace::WorkspacePolicy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace};

pub struct AsyncExecutor {
    core: Arc<Executor>,
    cpu_thread: WorkerThread,
    mixed_thread: WorkerThread,
    gpu_thread: WorkerThread,
    initialized: AtomicBool,
}

impl AsyncExecutor {
    pub fn new(
        config: ExecutorConfig,
        queue_policy: Arc<dyn QueuePolicy>,
        workspace_policy: Box<dyn WorkspacePolicy>,
        device: Option<Arc<dyn DeviceRuntime>>,
    ) -> Result<Self> {
        let mut core = Executor::new(config, queue_policy, workspace_policy, device)?;
        core.set_blocking();
        let device_id = core.device().map(|d| d.device_id());

        let spawn = move |stage: OpType| {
            WorkerThread::spawn(format!("{} executor", stage), move || {
                debug!(
                    device = ?device_id,
                    "{} stage worker started",
                    stage
                );
                true
            })
        };

        Ok(Self {
            cpu_thread: spawn(OpType::Cpu)?,
            mixed_thread: spawn(OpType::Mixed)?,
            gpu_thread: spawn(OpType::Gpu)?,
            core: Arc::new(core),
            initialized: AtomicBool::new(false),
        })
    }

    pub fn core(&self) -> &Arc<Executor> {
        &self.core
    }

    pub fn build(&mut self, graph: Arc<OpGraph>, output_names: Vec<String>) -> Result<()> {
        Arc::get_mut(&mut self.core)
            .ok_or_else(|| ExecutorError::Busy("stage work is still queued".to_string()))?
            .build(graph, output_names)?;
        self.init()
    }

    /// Wait for every stage worker to finish its initialization
    pub fn init(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        let ok = [&self.cpu_thread, &self.mixed_thread, &self.gpu_thread]
            .iter()
            .all(|worker| worker.wait_for_init());
        if !ok {
            self.cpu_thread.force_stop();
            self.mixed_thread.force_stop();
            self.gpu_thread.force_stop();
            let device = self.core.device().map(|d| d.device_id()).unwrap_or(0);
            return Err(ExecutorError::Device(format!(
                "Failed to init pipeline on device {}",
                device
            )));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn check_for_errors(&self) -> Result<()> {
        self.cpu_thread.check_for_errors()?;
        self.mixed_thread.check_for_errors()?;
        self.gpu_thread.check_for_errors()
    }

    fn enqueue(&self, stage: OpType) -> Result<()> {
        if self.core.is_shut_down() {
            return Err(ExecutorError::StopSignaled);
        }
        let core = Arc::clone(&self.core);
        let worker = match stage {
            OpType::Cpu => &self.cpu_thread,
            OpType::Mixed => &self.mixed_thread,
            OpType::Gpu => &self.gpu_thread,
        };
        worker.do_work(Box::new(move || {
            let result = match stage {
                OpType::Cpu => core.run_cpu(),
                OpType::Mixed => core.run_mixed(),
                OpType::Gpu => core.run_gpu(),
            };
            // failures are recorded by the core and re-raised from outputs
            if let Err(e) = result {
                trace!("{} stage did not complete: {}", stage, e);
            }
            Ok(())
        }))
    }

    pub fn run_cpu(&self) -> Result<()> {
        self.check_for_errors()?;
        self.enqueue(OpType::Cpu)
    }

    pub fn run_mixed(&self) -> Result<()> {
        self.check_for_errors()?;
        self.enqueue(OpType::Mixed)
    }

    pub fn run_gpu(&self) -> Result<()> {
        self.check_for_errors()?;
        self.enqueue(OpType::Gpu)
    }

    pub fn run(&self) -> Result<()> {
        self.run_cpu()?;
        self.run_mixed()?;
        self.run_gpu()
    }

    pub fn prefetch(&self) -> Result<()> {
        let plan = self.core.prefetch_plan();
        for _ in 0..plan.full_iterations {
            self.run()?;
        }
        for _ in 0..plan.cpu_only_iterations {
            self.run_cpu()?;
        }
        Ok(())
    }

    pub fn outputs(&self) -> Result<PipelineOutputs> {
        self.core.release_outputs();
        self.share_outputs()
    }

    pub fn share_outputs(&self) -> Result<PipelineOutputs> {
        let result = self
            .check_for_errors()
            .and_then(|_| self.core.share_outputs());
        if let Err(e) = &result {
            self.core.note_external_error(e);
        }
        result
    }

    pub fn release_outputs(&self) {
        self.core.release_outputs();
    }

    pub fn shutdown(&self) -> Result<()> {
        if !self.core.mark_shut_down() {
            return Ok(());
        }
        self.core.shutdown_queue();
        self.cpu_thread.force_stop();
        self.mixed_thread.force_stop();
        self.gpu_thread.force_stop();
        let synced = self.core.sync_device();
        if let Err(e) = &synced {
            error!("Device synchronization failed during shutdown: {}", e);
        }
        self.cpu_thread.shutdown();
        self.mixed_thread.shutdown();
        self.gpu_thread.shutdown();
        info!("Async executor shut down");
        synced
    }

    pub fn executor_meta(&self) -> ExecutorMetaMap {
        self.core.executor_meta()
    }

    pub fn enable_memory_stats(&self, enable: bool) {
        self.core.enable_memory_stats(enable)
    }

    pub fn enable_checkpointing(&self, enable: bool) -> Result<()> {
        self.core.enable_checkpointing(enable)
    }

    pub fn current_checkpoint(&self) -> Result<Checkpoint> {
        self.core.current_checkpoint()
    }

    pub fn restore_state_from_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.core.restore_state_from_checkpoint(checkpoint)
    }

    pub fn has_conditionals(&self) -> bool {
        self.core.has_conditionals()
    }

    pub fn input_feed_count(&self, instance_name: &str) -> Result<usize> {
        self.core.input_feed_count(instance_name)
    }
}

impl Drop for AsyncExecutor {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Async executor shutdown failed: {}", e);
        }
    }
}
