//! Test operators and graph fixtures for executor tests
//!
//! Samples carry a `u64` (little endian) so tests can tell iterations apart:
//! `Counter` emits its run count, downstream operators transform it.

#![allow(dead_code)]

use anyhow::{bail, Context};
use stagepipe_executor::{
    AotWorkspacePolicy, Executor, ExecutorConfig, GraphBuilder, OpCapabilities, OpGraph, OpSpec,
    OpType, Operator, PipelineOutputs, QueuePolicy, SeparateQueuePolicy, StorageDevice,
    TensorHandle, UniformQueuePolicy, Workspace,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn init_logging() {
    stagepipe_executor::init_logging(stagepipe_executor::Verbosity::Quiet);
}

pub fn encode(value: u64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn decode(sample: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&sample[..8]);
    u64::from_le_bytes(bytes)
}

/// Value of the first sample of a named output
pub fn first_value(outputs: &PipelineOutputs, name: &str) -> u64 {
    let handle = outputs.get(name).expect("missing output");
    let tl = handle.read();
    decode(tl.sample(0).expect("empty output"))
}

pub fn num_samples(outputs: &PipelineOutputs, name: &str) -> usize {
    outputs.get(name).expect("missing output").read().num_samples()
}

/// CPU source emitting its run count in every sample
#[derive(Default)]
pub struct Counter {
    pub count: u64,
    pub runs: Arc<AtomicUsize>,
}

impl Counter {
    pub fn new(runs: Arc<AtomicUsize>) -> Self {
        Self { count: 0, runs }
    }
}

impl Operator for Counter {
    fn run(&mut self, ws: &mut Workspace) -> anyhow::Result<()> {
        self.count += 1;
        self.runs.fetch_add(1, Ordering::SeqCst);
        let samples = (0..ws.batch_size()).map(|_| encode(self.count)).collect();
        ws.output(0)?.set_samples(samples);
        Ok(())
    }

    fn save_state(&self) -> anyhow::Result<Vec<u8>> {
        Ok(encode(self.count))
    }

    fn restore_state(&mut self, state: &[u8]) -> anyhow::Result<()> {
        if state.len() != 8 {
            bail!("counter state must be 8 bytes, got {}", state.len());
        }
        self.count = decode(state);
        Ok(())
    }
}

/// Applies `f` to every sample value. Device work goes through the stage
/// stream when there is one, after an optional delay.
pub struct Map {
    f: fn(u64) -> u64,
    delay: Duration,
}

impl Map {
    pub fn new(f: fn(u64) -> u64) -> Self {
        Self {
            f,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

fn apply(input: &TensorHandle, output: &TensorHandle, f: fn(u64) -> u64) {
    let samples: Vec<Vec<u8>> = input
        .read()
        .samples()
        .iter()
        .map(|s| encode(f(decode(s))))
        .collect();
    output.write().set_samples(samples);
}

impl Operator for Map {
    fn run(&mut self, ws: &mut Workspace) -> anyhow::Result<()> {
        let input = ws.input_handle(0)?;
        let output = ws.output_handle(0)?;
        let f = self.f;
        match ws.stream() {
            Some(stream) => {
                let delay = self.delay;
                stream
                    .enqueue(Box::new(move || {
                        std::thread::sleep(delay);
                        apply(&input, &output, f);
                    }))
                    .context("enqueue device work")?;
            }
            None => {
                std::thread::sleep(self.delay);
                apply(&input, &output, f);
            }
        }
        Ok(())
    }
}

/// Fails on one iteration, passes its input through otherwise
pub struct FailOn {
    pub iteration: u64,
}

impl Operator for FailOn {
    fn run(&mut self, ws: &mut Workspace) -> anyhow::Result<()> {
        if ws.iteration() == self.iteration {
            bail!("injected failure at iteration {}", self.iteration);
        }
        let samples = ws.input(0)?.samples().to_vec();
        ws.output(0)?.set_samples(samples);
        Ok(())
    }
}

/// Batch-size provider fed from a queue of batch sizes
pub struct Feeder {
    pub queued: VecDeque<usize>,
}

impl Feeder {
    pub fn new(sizes: &[usize]) -> Self {
        Self {
            queued: sizes.iter().copied().collect(),
        }
    }
}

impl Operator for Feeder {
    fn run(&mut self, ws: &mut Workspace) -> anyhow::Result<()> {
        let size = self.queued.pop_front().context("feeder ran dry")?;
        if size != ws.batch_size() {
            bail!("batch size {} does not match queued {}", ws.batch_size(), size);
        }
        let samples = (0..size).map(|i| encode(i as u64)).collect();
        ws.output(0)?.set_samples(samples);
        Ok(())
    }

    fn capabilities(&self) -> OpCapabilities {
        OpCapabilities::batch_size_provider()
    }

    fn next_batch_size(&mut self) -> Option<usize> {
        self.queued.front().copied()
    }
}

/// Parallel map over samples on the operator thread pool
pub struct ParallelSquare {
    pub max_threads_seen: Arc<AtomicU64>,
}

impl Operator for ParallelSquare {
    fn run(&mut self, ws: &mut Workspace) -> anyhow::Result<()> {
        use rayon::prelude::*;
        let input: Vec<Vec<u8>> = ws.input(0)?.samples().to_vec();
        let pool_threads = ws.thread_pool().current_num_threads() as u64;
        self.max_threads_seen.fetch_max(pool_threads, Ordering::SeqCst);
        let output: Vec<Vec<u8>> = ws.thread_pool().install(|| {
            input
                .par_iter()
                .map(|s| {
                    let v = decode(s);
                    encode(v * v)
                })
                .collect()
        });
        ws.output(0)?.set_samples(output);
        Ok(())
    }
}

/// counter (CPU) -> "raw", upload (MIXED) -> "dev", double (GPU) -> "out"
pub fn three_stage_graph(runs: Arc<AtomicUsize>, gpu_delay: Duration) -> Arc<OpGraph> {
    let mut b = GraphBuilder::new();
    b.add_op(
        "counter",
        OpType::Cpu,
        OpSpec::new("Counter").output("raw", StorageDevice::Cpu),
        Box::new(Counter::new(runs)),
    )
    .unwrap();
    b.add_op(
        "upload",
        OpType::Mixed,
        OpSpec::new("Upload")
            .input("raw")
            .output("dev", StorageDevice::Gpu),
        Box::new(Map::new(|v| v)),
    )
    .unwrap();
    b.add_op(
        "double",
        OpType::Gpu,
        OpSpec::new("Double")
            .input("dev")
            .output("out", StorageDevice::Gpu),
        Box::new(Map::new(|v| v * 2).with_delay(gpu_delay)),
    )
    .unwrap();
    Arc::new(b.build().unwrap())
}

/// Single CPU counter producing "raw"
pub fn cpu_only_graph(runs: Arc<AtomicUsize>) -> Arc<OpGraph> {
    let mut b = GraphBuilder::new();
    b.add_op(
        "counter",
        OpType::Cpu,
        OpSpec::new("Counter").output("raw", StorageDevice::Cpu),
        Box::new(Counter::new(runs)),
    )
    .unwrap();
    Arc::new(b.build().unwrap())
}

pub fn small_config() -> ExecutorConfig {
    ExecutorConfig::new(4).num_threads(2)
}

/// Synchronous executor with the queue policy matching `config.executor_type`
pub fn sync_executor(config: ExecutorConfig) -> Executor {
    let queue_policy: Arc<dyn QueuePolicy> = if config.executor_type.is_separated() {
        Arc::new(SeparateQueuePolicy::new())
    } else {
        Arc::new(UniformQueuePolicy::new())
    };
    Executor::new(config, queue_policy, Box::new(AotWorkspacePolicy::new()), None)
        .expect("executor")
}

/// Build `graph` into a fresh synchronous executor
pub fn built_sync(config: ExecutorConfig, graph: Arc<OpGraph>, outputs: &[&str]) -> Executor {
    let mut exec = sync_executor(config);
    exec.build(graph, outputs.iter().map(|s| s.to_string()).collect())
        .expect("build");
    exec
}
