//! 协作取消：取消不是故障。

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use spark_dataflow::{
    Admission, CancellationToken, DataflowError, StageOptions, Transform, TransformManyStage,
};

use crate::support::{drain, within};

#[tokio::test]
async fn cancellation_inside_transform_completes_successfully() {
    let token = CancellationToken::new();
    let stage = {
        let options = StageOptions::new().with_cancellation(token.clone());
        let token = token.clone();
        TransformManyStage::new(
            Transform::sync(move |n: u32| {
                if n == 3 {
                    token.cancel();
                    return Err(DataflowError::Cancelled);
                }
                Ok(vec![n])
            }),
            options,
        )
        .expect("stage")
    };

    for n in 1..=5 {
        assert!(stage.post(n));
    }

    assert_eq!(drain(&stage).await, vec![1, 2]);
    within(stage.completion())
        .await
        .expect("协作取消不应表现为故障");
    assert!(!stage.post(6));
    assert_eq!(stage.bounding_count(), 0);
}

#[tokio::test]
async fn cancelled_error_without_cancelled_token_is_a_fault() {
    let stage = TransformManyStage::new(
        Transform::sync(|_: u32| Err::<Vec<u32>, _>(DataflowError::Cancelled)),
        StageOptions::new().with_cancellation(CancellationToken::new()),
    )
    .expect("stage");

    assert!(stage.post(1));

    let error = within(stage.completion())
        .await
        .expect_err("令牌未取消时的取消错误属于故障");
    assert!(error.is_cancellation());
    assert!(stage.completion().is_faulted());
}

#[tokio::test]
async fn pre_cancelled_token_declines_everything() {
    let token = CancellationToken::new();
    token.cancel();
    let invoked = Arc::new(AtomicUsize::new(0));
    let stage = {
        let invoked = Arc::clone(&invoked);
        TransformManyStage::new(
            Transform::sync(move |n: u32| {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(vec![n])
            }),
            StageOptions::new().with_cancellation(token),
        )
        .expect("stage")
    };

    assert_eq!(stage.offer(1), Admission::Declined(1));
    within(stage.completion()).await.expect("取消后立即完成");
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn external_cancellation_drops_queued_input_and_wakes_senders() {
    let token = CancellationToken::new();
    let stage = TransformManyStage::new(
        Transform::future(|n: u32| async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            Ok(vec![n])
        }),
        StageOptions::new()
            .with_bounded_capacity(2)
            .with_cancellation(token.clone()),
    )
    .expect("stage");

    assert!(stage.post(1));
    assert!(stage.post(2));
    let blocked = {
        let stage = stage.clone();
        tokio::spawn(async move { stage.send(3).await })
    };
    tokio::task::yield_now().await;

    token.cancel();

    assert_eq!(
        within(blocked).await.expect("发送任务不应 panic"),
        Admission::Declined(3)
    );
    let outputs = drain(&stage).await;
    assert!(outputs.len() <= 1, "至多保留取消前已在处理的那条: {outputs:?}");
    within(stage.completion()).await.expect("取消不是故障");
    assert_eq!(stage.input_count(), 0);
    assert_eq!(stage.bounding_count(), 0);
}

#[tokio::test]
async fn cancellation_midstream_keeps_items_already_written() {
    let token = CancellationToken::new();
    let stage = {
        let options = StageOptions::new().with_cancellation(token.clone());
        let token = token.clone();
        TransformManyStage::new(
            Transform::stream(move |n: u32| {
                let token = token.clone();
                futures::stream::iter(0..5u32).then(move |k| {
                    let token = token.clone();
                    async move {
                        if k == 2 {
                            token.cancel();
                            return Err(DataflowError::Cancelled);
                        }
                        Ok(n * 10 + k)
                    }
                })
            }),
            options,
        )
        .expect("stage")
    };

    assert!(stage.post(4));

    assert_eq!(drain(&stage).await, vec![40, 41]);
    within(stage.completion()).await.expect("取消不是故障");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ordered_parallel_cancellation_fills_every_reorder_slot() {
    let token = CancellationToken::new();
    let stage = {
        let options = StageOptions::new()
            .with_degree_of_parallelism(4)
            .with_cancellation(token.clone());
        let token = token.clone();
        TransformManyStage::new(
            Transform::future(move |n: u32| {
                let token = token.clone();
                async move {
                    if n == 5 {
                        token.cancel();
                        return Err(DataflowError::Cancelled);
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(u64::from(n % 3))).await;
                    token.check()?;
                    Ok(vec![n])
                }
            }),
            options,
        )
        .expect("stage")
    };

    for n in 0..40 {
        stage.post(n);
    }

    let outputs = drain(&stage).await;
    assert!(
        outputs.windows(2).all(|pair| pair[0] < pair[1]),
        "保序输出必须严格递增: {outputs:?}"
    );
    assert!(!outputs.contains(&5));
    assert!(outputs.iter().all(|&n| n < 9), "取消后派发的消息不应产出: {outputs:?}");
    within(stage.completion()).await.expect("取消不是故障");

    let metrics = stage.metrics();
    assert_eq!(metrics.reorder_pending, 0);
    assert_eq!(metrics.in_flight, 0);
    assert_eq!(stage.bounding_count(), 0);
}
