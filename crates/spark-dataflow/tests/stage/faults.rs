//! 转换故障、外部故障与下游故障。

use std::io;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use spark_dataflow::{DataflowError, LinkOptions, StageOptions, Transform, TransformManyStage};

use crate::support::{CollectingTarget, Mode, within};

#[tokio::test]
async fn transform_error_faults_stage_and_drops_pending_input() {
    let invoked = Arc::new(Mutex::new(Vec::new()));
    let stage = {
        let invoked = Arc::clone(&invoked);
        TransformManyStage::new(
            Transform::sync(move |n: u32| {
                invoked.lock().push(n);
                if n == 3 {
                    return Err(DataflowError::transform(io::Error::other("bad record")));
                }
                Ok(vec![n])
            }),
            StageOptions::new(),
        )
        .expect("stage")
    };

    for n in 1..=10 {
        assert!(stage.post(n));
    }

    let error = within(stage.completion())
        .await
        .expect_err("转换错误必须让阶段以故障结束");
    assert_eq!(*invoked.lock(), vec![1, 2, 3], "故障后排队输入不应再被处理");

    assert!(matches!(error, DataflowError::Transform(_)), "{error:?}");
    let io_error = error
        .cause()
        .and_then(|cause| cause.downcast_ref::<io::Error>())
        .expect("原始错误应保留在错误链中");
    assert_eq!(io_error.to_string(), "bad record");

    assert!(!stage.post(11), "故障后的阶段拒绝新输入");
    assert_eq!(stage.input_count(), 0);
}

#[tokio::test]
async fn fault_discards_buffered_output_and_returns_units() {
    let stage = TransformManyStage::new(
        Transform::sync(|n: u32| Ok(vec![n, n])),
        StageOptions::new().with_bounded_capacity(16),
    )
    .expect("stage");
    for n in 0..3 {
        assert!(stage.post(n));
    }
    within(async {
        while stage.output_count() < 6 {
            tokio::task::yield_now().await;
        }
    })
    .await;
    assert_eq!(stage.bounding_count(), 6);

    stage.fault(DataflowError::faulted_msg("operator abort"));

    let error = within(stage.completion()).await.expect_err("外部故障");
    assert!(matches!(error, DataflowError::Faulted(_)));
    assert_eq!(stage.output_count(), 0);
    assert_eq!(stage.bounding_count(), 0);
    assert_eq!(within(stage.receive()).await, None);
}

#[tokio::test]
async fn first_fault_wins() {
    let stage = TransformManyStage::new(
        Transform::sync(|n: u32| Ok(vec![n])),
        StageOptions::new(),
    )
    .expect("stage");

    stage.fault(DataflowError::faulted_msg("first"));
    stage.fault(DataflowError::transform_msg("second"));
    stage.complete();

    let error = within(stage.completion()).await.expect_err("故障");
    assert_eq!(error.to_string(), "stage faulted: first");
}

#[tokio::test]
async fn failing_downstream_faults_the_stage() {
    let stage = TransformManyStage::new(
        Transform::sync(|n: u32| Ok(vec![n])),
        StageOptions::new(),
    )
    .expect("stage");
    let sink = Arc::new(CollectingTarget::new(Mode::Fail));
    stage.link_to(Arc::clone(&sink), LinkOptions::default());

    assert!(stage.post(1));

    let error = within(stage.completion())
        .await
        .expect_err("下游错误必须让阶段故障");
    assert!(matches!(error, DataflowError::Downstream(_)), "{error:?}");
    assert!(!stage.post(2));
    assert!(sink.received().is_empty());
}

#[tokio::test]
async fn stream_error_midway_faults_the_stage() {
    let stage = TransformManyStage::new(
        Transform::stream(|n: u32| {
            futures::stream::iter(vec![
                Ok(n),
                Err(DataflowError::transform_msg("stream broke")),
                Ok(n + 1),
            ])
        }),
        StageOptions::new(),
    )
    .expect("stage");

    assert!(stage.post(7));

    let error = within(stage.completion()).await.expect_err("流中途出错");
    assert_eq!(error.to_string(), "transform failed: stream broke");
    assert_eq!(stage.output_count(), 0, "故障丢弃已写出的输出");
    assert_eq!(stage.bounding_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_fault_still_settles_every_unit() {
    let stage = TransformManyStage::new(
        Transform::future(|n: u32| async move {
            tokio::time::sleep(std::time::Duration::from_millis(u64::from(n % 5))).await;
            if n == 20 {
                Err(DataflowError::transform_msg("poisoned input"))
            } else {
                Ok(vec![n; 3])
            }
        }),
        StageOptions::new()
            .with_degree_of_parallelism(4)
            .with_bounded_capacity(64),
    )
    .expect("stage");

    for n in 0..40 {
        assert!(within(stage.send(n)).await.is_accepted() || n > 20);
    }

    within(stage.completion()).await.expect_err("故障");
    assert_eq!(stage.bounding_count(), 0);
    assert_eq!(stage.metrics().in_flight, 0);
    assert_eq!(stage.metrics().reorder_pending, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_transform_faults_ordered_parallel_stage() {
    let stage = TransformManyStage::new(
        Transform::sync(|n: u32| {
            assert!(n != 1, "record {n} is corrupt");
            Ok(vec![n])
        }),
        StageOptions::new().with_degree_of_parallelism(2),
    )
    .expect("stage");

    for n in 0..4 {
        stage.post(n);
    }
    stage.complete();

    let error = within(stage.completion())
        .await
        .expect_err("panic 必须让阶段以故障结束");
    assert!(matches!(error, DataflowError::Transform(_)), "{error:?}");
    assert_eq!(error.to_string(), "transform failed: panicked: record 1 is corrupt");

    let metrics = stage.metrics();
    assert_eq!(metrics.in_flight, 0);
    assert_eq!(metrics.reorder_pending, 0);
    assert_eq!(metrics.output_count, 0);
    assert_eq!(stage.bounding_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panic_inside_lazy_iterator_or_stream_is_a_fault() {
    let lazy = TransformManyStage::new(
        Transform::sync(|n: u32| {
            Ok((0..3u32).map(move |k| {
                assert!(k < 2, "iterator broke");
                n + k
            }))
        }),
        StageOptions::new()
            .with_degree_of_parallelism(4)
            .with_ensure_ordered(false),
    )
    .expect("stage");
    let streaming = TransformManyStage::new(
        Transform::stream(|n: u32| {
            futures::stream::iter(0..3u32).map(move |k| {
                assert!(k < 1, "stream broke");
                Ok(n + k)
            })
        }),
        StageOptions::new().with_degree_of_parallelism(4),
    )
    .expect("stage");

    for n in 0..8 {
        lazy.post(n);
        streaming.post(n);
    }

    let lazy_error = within(lazy.completion()).await.expect_err("迭代器 panic");
    assert_eq!(lazy_error.to_string(), "transform failed: panicked: iterator broke");
    let stream_error = within(streaming.completion()).await.expect_err("流 panic");
    assert_eq!(stream_error.to_string(), "transform failed: panicked: stream broke");

    for stage in [&lazy, &streaming] {
        assert_eq!(stage.metrics().in_flight, 0);
        assert_eq!(stage.metrics().reorder_pending, 0);
        assert_eq!(stage.bounding_count(), 0);
    }
}
