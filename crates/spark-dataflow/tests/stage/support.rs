use std::future::IntoFuture;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use spark_dataflow::{Admission, DataflowError, Target, TransformManyStage};
use tokio::sync::Notify;

/// 单个等待的超时上限，避免死锁时测试永久挂起。
pub const WAIT: Duration = Duration::from_secs(10);

/// 带超时地等待 Future。
pub async fn within<F: IntoFuture>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("operation timed out")
}

/// 拉取阶段的全部输出，直到阶段完成。
pub async fn drain<I, O>(stage: &TransformManyStage<I, O>) -> Vec<O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    within(async {
        let mut items = Vec::new();
        while let Some(item) = stage.receive().await {
            items.push(item);
        }
        items
    })
    .await
}

/// 收集型目标的行为。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// 全部接收。
    Accept,
    /// 全部拒绝。
    Decline,
    /// 每次投递都返回错误。
    Fail,
    /// 缓冲达到上限后推迟，直到测试调用 `take_all` 腾出空间。
    Bounded(usize),
}

/// 记录收到的消息与完成信号的下游目标。
pub struct CollectingTarget<T> {
    mode: Mode,
    items: Mutex<Vec<T>>,
    taken: Mutex<Vec<T>>,
    completed: AtomicBool,
    fault: Mutex<Option<DataflowError>>,
    changed: Notify,
}

impl<T: Clone + Send> CollectingTarget<T> {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            items: Mutex::new(Vec::new()),
            taken: Mutex::new(Vec::new()),
            completed: AtomicBool::new(false),
            fault: Mutex::new(None),
            changed: Notify::new(),
        }
    }

    /// 曾经收到的全部消息（含已被 `take_all` 取走的部分）。
    pub fn received(&self) -> Vec<T> {
        let mut all = self.taken.lock().clone();
        all.extend(self.items.lock().iter().cloned());
        all
    }

    /// 取走当前缓冲，为 `Bounded` 模式腾出空间。
    pub fn take_all(&self) -> Vec<T> {
        let drained: Vec<T> = self.items.lock().drain(..).collect();
        self.taken.lock().extend(drained.iter().cloned());
        self.changed.notify_waiters();
        drained
    }

    /// 尚未被 `take_all` 取走的消息数。
    pub fn pending(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn recorded_fault(&self) -> Option<DataflowError> {
        self.fault.lock().clone()
    }

    /// 等待直到 `predicate` 成立。
    pub async fn wait_until(&self, predicate: impl Fn(&Self) -> bool) {
        within(async {
            loop {
                let mut changed = pin!(self.changed.notified());
                changed.as_mut().enable();
                if predicate(self) {
                    return;
                }
                changed.await;
            }
        })
        .await
    }

    /// 等待上游传播完成或故障。
    pub async fn wait_finished(&self) {
        self.wait_until(|target| target.is_completed() || target.recorded_fault().is_some())
            .await
    }
}

impl<T: Clone + Send> Target<T> for CollectingTarget<T> {
    fn offer(&self, item: T) -> spark_dataflow::Result<Admission<T>> {
        let admission = match self.mode {
            Mode::Accept => {
                self.items.lock().push(item);
                Admission::Accepted
            }
            Mode::Decline => Admission::Declined(item),
            Mode::Fail => return Err(DataflowError::transform_msg("sink rejected item")),
            Mode::Bounded(limit) => {
                let mut items = self.items.lock();
                if items.len() >= limit {
                    Admission::Postponed(item)
                } else {
                    items.push(item);
                    Admission::Accepted
                }
            }
        };
        self.changed.notify_waiters();
        Ok(admission)
    }

    fn ready(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let Mode::Bounded(limit) = self.mode else {
                return;
            };
            loop {
                let mut changed = pin!(self.changed.notified());
                changed.as_mut().enable();
                if self.items.lock().len() < limit {
                    return;
                }
                changed.await;
            }
        })
    }

    fn complete(&self) {
        self.completed.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    fn fault(&self, error: DataflowError) {
        self.fault.lock().get_or_insert(error);
        self.changed.notify_waiters();
    }
}
