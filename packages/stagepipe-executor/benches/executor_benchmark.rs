//! Benchmark for staged execution
//!
//! Measures:
//! - Per-iteration overhead of the synchronous executor (empty operators)
//! - Steady-state throughput of the asynchronous executor by queue depth
//! - Checkpoint serialization

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use stagepipe_executor::{
    build_executor, Checkpoint, ExecutorConfig, ExecutorType, FnOperator, GraphBuilder, OpGraph,
    OpSpec, OpType, PipelineExecutor, StorageDevice,
};
use std::sync::Arc;

fn passthrough_graph() -> Arc<OpGraph> {
    let mut b = GraphBuilder::new();
    b.add_op(
        "source",
        OpType::Cpu,
        OpSpec::new("Source").output("raw", StorageDevice::Cpu),
        Box::new(FnOperator::new(|ws| {
            let samples = (0..ws.batch_size()).map(|i| vec![i as u8; 256]).collect();
            ws.output(0)?.set_samples(samples);
            Ok(())
        })),
    )
    .unwrap();
    b.add_op(
        "upload",
        OpType::Mixed,
        OpSpec::new("Upload")
            .input("raw")
            .output("dev", StorageDevice::Gpu),
        Box::new(FnOperator::new(|ws| {
            let samples = ws.input(0)?.samples().to_vec();
            ws.output(0)?.set_samples(samples);
            Ok(())
        })),
    )
    .unwrap();
    Arc::new(b.build().unwrap())
}

fn built(config: ExecutorConfig) -> Box<dyn PipelineExecutor> {
    let mut exec = build_executor(config, None).unwrap();
    exec.build(passthrough_graph(), vec!["dev".to_string()])
        .unwrap();
    exec.prefetch().unwrap();
    exec
}

fn bench_sync_iteration(c: &mut Criterion) {
    let exec = built(
        ExecutorConfig::new(32)
            .num_threads(1)
            .executor_type(ExecutorType::Pipelined),
    );
    c.bench_function("sync_iteration", |b| {
        b.iter(|| {
            let out = exec.outputs().unwrap();
            black_box(out.len());
            exec.release_outputs();
            exec.run().unwrap();
        })
    });
    exec.shutdown().unwrap();
}

fn bench_async_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("async_iteration");
    for depth in [1usize, 2, 4] {
        let exec = built(
            ExecutorConfig::new(32)
                .num_threads(1)
                .queue_depths(depth, depth)
                .executor_type(ExecutorType::AsyncPipelined),
        );
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                let out = exec.outputs().unwrap();
                black_box(out.len());
                exec.run().unwrap();
            })
        });
        exec.shutdown().unwrap();
    }
    group.finish();
}

fn bench_checkpoint_serialize(c: &mut Criterion) {
    let mut checkpoint = Checkpoint::new(1_000);
    for i in 0..64 {
        checkpoint.set_op_state(&format!("op{}", i), vec![i as u8; 4096]);
    }
    c.bench_function("checkpoint_roundtrip", |b| {
        b.iter(|| {
            let bytes = checkpoint.serialize().unwrap();
            black_box(Checkpoint::deserialize(&bytes).unwrap())
        })
    });
}

criterion_group!(
    benches,
    bench_sync_iteration,
    bench_async_throughput,
    bench_checkpoint_serialize
);
criterion_main!(benches);
