//! Asynchronous executor: blocking hand-off between stage threads,
//! shutdown, failures and device synchronization

mod common;

use common::*;
use stagepipe_executor::{
    build_executor, AotWorkspacePolicy, AsyncExecutor, ErrorCategory, ExecutorError,
    ExecutorType, GraphBuilder, OpSpec, OpType, PipelineExecutor, StorageDevice,
    UniformQueuePolicy,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn async_executor(config: stagepipe_executor::ExecutorConfig) -> AsyncExecutor {
    AsyncExecutor::new(
        config,
        Arc::new(UniformQueuePolicy::new()),
        Box::new(AotWorkspacePolicy::new()),
        None,
    )
    .unwrap()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_outputs_arrive_in_iteration_order() {
    init_logging();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut exec = async_executor(small_config());
    exec.build(three_stage_graph(runs.clone(), Duration::ZERO), vec!["out".into()])
        .unwrap();
    exec.prefetch().unwrap();

    for expected in 1..=8u64 {
        let out = exec.outputs().unwrap();
        assert_eq!(out.iteration(), expected - 1);
        assert_eq!(first_value(&out, "out"), expected * 2);
        exec.run().unwrap();
    }
    exec.shutdown().unwrap();
}

#[test]
fn test_cpu_stage_blocks_on_full_queues() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut exec = async_executor(small_config());
    exec.build(cpu_only_graph(runs.clone()), vec!["raw".into()])
        .unwrap();
    exec.prefetch().unwrap();
    for _ in 0..3 {
        exec.run().unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || runs.load(Ordering::SeqCst) == 2));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // the first outputs call holds slot 0; the second releases it
    assert_eq!(first_value(&exec.outputs().unwrap(), "raw"), 1);
    assert_eq!(first_value(&exec.outputs().unwrap(), "raw"), 2);
    assert!(wait_until(Duration::from_secs(5), || runs.load(Ordering::SeqCst) == 3));

    for expected in 3..=5u64 {
        assert_eq!(first_value(&exec.outputs().unwrap(), "raw"), expected);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 5);
}

#[test]
fn test_shutdown_unblocks_waiting_consumer() {
    let mut exec = async_executor(small_config());
    exec.build(
        cpu_only_graph(Arc::new(AtomicUsize::new(0))),
        vec!["raw".into()],
    )
    .unwrap();
    let exec = Arc::new(exec);

    let stopper = {
        let exec = Arc::clone(&exec);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            exec.shutdown()
        })
    };
    // nothing was scheduled, so this only returns once the executor stops
    let err = exec.outputs().unwrap_err();
    assert_eq!(err, ExecutorError::StopSignaled);
    assert_eq!(err.category(), ErrorCategory::Stopped);
    stopper.join().unwrap().unwrap();

    assert_eq!(exec.run().unwrap_err(), ExecutorError::StopSignaled);
    assert!(!exec.core().has_errors());
}

#[test]
fn test_stage_failure_surfaces_from_outputs() {
    let mut b = GraphBuilder::new();
    b.add_op(
        "counter",
        OpType::Cpu,
        OpSpec::new("Counter").output("raw", StorageDevice::Cpu),
        Box::new(Counter::new(Arc::new(AtomicUsize::new(0)))),
    )
    .unwrap();
    b.add_op(
        "check",
        OpType::Cpu,
        OpSpec::new("FailOn")
            .input("raw")
            .output("checked", StorageDevice::Cpu),
        Box::new(FailOn { iteration: 2 }),
    )
    .unwrap();
    let mut exec = async_executor(small_config());
    exec.build(Arc::new(b.build().unwrap()), vec!["checked".into()])
        .unwrap();
    exec.prefetch().unwrap();

    // both prefetched iterations are handed out before the failing one starts
    let first = exec.outputs().unwrap();
    let second = exec.share_outputs().unwrap();
    assert_eq!(first_value(&first, "checked"), 1);
    assert_eq!(first_value(&second, "checked"), 2);

    exec.run().unwrap();
    exec.release_outputs();
    let err = exec.outputs().unwrap_err();
    match err {
        ExecutorError::Operator {
            instance_name,
            stage,
            ..
        } => {
            assert_eq!(instance_name, "check");
            assert_eq!(stage, OpType::Cpu);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(exec.core().has_errors());
}

#[test]
fn test_device_work_completes_before_outputs_are_handed_out() {
    let config = small_config().device_id(Some(0));
    let mut exec = async_executor(config);
    assert_eq!(exec.core().device().map(|d| d.device_id()), Some(0));
    exec.build(
        three_stage_graph(Arc::new(AtomicUsize::new(0)), Duration::from_millis(20)),
        vec!["out".into()],
    )
    .unwrap();
    exec.prefetch().unwrap();

    for expected in 1..=4u64 {
        let out = exec.outputs().unwrap();
        assert_eq!(first_value(&out, "out"), expected * 2);
        assert_eq!(num_samples(&out, "out"), 4);
        exec.run().unwrap();
    }
    exec.shutdown().unwrap();
}

#[test]
fn test_sync_executor_waits_for_device_work() {
    let config = small_config().device_id(Some(1));
    let exec = built_sync(
        config,
        three_stage_graph(Arc::new(AtomicUsize::new(0)), Duration::from_millis(20)),
        &["out"],
    );
    exec.prefetch().unwrap();
    for expected in 1..=3u64 {
        let out = exec.outputs().unwrap();
        assert_eq!(first_value(&out, "out"), expected * 2);
        exec.release_outputs();
        exec.run().unwrap();
    }
    exec.shutdown().unwrap();
}

#[test]
fn test_factory_builds_every_executor_type() {
    for executor_type in [
        ExecutorType::Simple,
        ExecutorType::Pipelined,
        ExecutorType::Separated,
        ExecutorType::AsyncPipelined,
        ExecutorType::AsyncSeparated,
    ] {
        let config = small_config().executor_type(executor_type);
        let mut exec = build_executor(config, None).unwrap();
        exec.build(
            cpu_only_graph(Arc::new(AtomicUsize::new(0))),
            vec!["raw".to_string()],
        )
        .unwrap();
        exec.prefetch().unwrap();

        for expected in 1..=4u64 {
            let out = exec.outputs().unwrap();
            assert_eq!(
                first_value(&out, "raw"),
                expected,
                "{} executor",
                executor_type
            );
            exec.release_outputs();
            exec.run().unwrap();
        }
        exec.shutdown().unwrap();
    }
}

#[test]
fn test_simple_executor_uses_single_slot() {
    let config = small_config().executor_type(ExecutorType::Simple);
    let mut exec = build_executor(config, None).unwrap();
    exec.build(
        cpu_only_graph(Arc::new(AtomicUsize::new(0))),
        vec!["raw".to_string()],
    )
    .unwrap();
    assert_eq!(exec.input_feed_count("counter").unwrap(), 1);
    exec.run().unwrap();
    assert_eq!(
        exec.run().unwrap_err(),
        ExecutorError::QueueDepthExhausted(OpType::Cpu)
    );
}

#[test]
fn test_drop_without_shutdown() {
    let mut exec = async_executor(small_config());
    exec.build(
        three_stage_graph(Arc::new(AtomicUsize::new(0)), Duration::ZERO),
        vec!["out".into()],
    )
    .unwrap();
    exec.prefetch().unwrap();
    exec.run().unwrap();
    drop(exec);
}

#[test]
fn test_build_twice_is_rejected() {
    let mut exec: Box<dyn PipelineExecutor> = Box::new(async_executor(small_config()));
    exec.build(
        cpu_only_graph(Arc::new(AtomicUsize::new(0))),
        vec!["raw".into()],
    )
    .unwrap();
    let err = exec
        .build(
            cpu_only_graph(Arc::new(AtomicUsize::new(0))),
            vec!["raw".into()],
        )
        .unwrap_err();
    assert!(matches!(err, ExecutorError::Construction(_)));
}
