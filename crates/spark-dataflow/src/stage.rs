//! transform-many 流水线阶段。
//!
//! # 教案级说明
//! - **Why**：把输入准入、并行调度、保序重排、输出缓冲与容量记账组合成一个可链接、可等待完成的阶段；
//! - **How**：
//!   - [`TransformManyStage`] 只是 `Arc<StageInner>` 的句柄，内部状态按值持有输入侧、重排缓冲与输出侧；
//!   - 输出侧经 `Weak<dyn SourceObserver>` 回报事件，取消令牌经 `Weak` 回调触发“完成并丢弃”，不存在强引用环；
//!   - 每条消息派发为一个独立任务，任务结束时调用 `signal_one_async_message_completed` 归还并行槽位；
//! - **What**：
//!   - 输入侧完成（成功）→ 输出侧 `complete`；输入侧完成（故障）→ 输出侧记录故障后完成；
//!   - 输出侧下游故障 → 阶段 `fault`；
//!   - 取消不是故障：阶段正常完成，被取消消息不产生输出；
//!   - 每条被取出的消息在所有路径上都恰好结算一次容量单位与一个重排槽位。

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::bounding::BoundingCounter;
use crate::cancellation::{CancellationRegistration, CancellationToken};
use crate::completion::Completion;
use crate::error::{DataflowError, Result};
use crate::link::{LinkFilter, LinkHandle};
use crate::options::{LinkOptions, StageOptions};
use crate::reorder::{FastPath, ReorderEntry, Reordering, ReorderingBuffer};
use crate::scheduler::{TaskScheduler, TokioScheduler};
use crate::source::{SourceCore, SourceObserver};
use crate::target::{Admission, Envelope, Target, TargetCore};
use crate::transform::{GuardedOutputs, Transform, panic_error};

static NEXT_STAGE_ID: AtomicU64 = AtomicU64::new(1);

const DEFAULT_NAME: &str = "TransformManyStage";

/// 阶段运行状态的快照。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageMetrics {
    /// 已准入、尚未开始处理的输入数量。
    pub input_count: usize,
    /// 正在执行转换的消息数量。
    pub in_flight: usize,
    /// 输出侧缓冲的条目数量。
    pub output_count: usize,
    /// 有界容量计数器的当前值。
    pub bounding_count: usize,
    /// 配置的容量上限。
    pub bounded_capacity: Option<usize>,
    /// 重排缓冲中等待前序序号的条目数量。
    pub reorder_pending: usize,
    /// 当前链接的下游目标数量。
    pub links: usize,
    /// 是否已完成（成功或故障）。
    pub completed: bool,
}

/// 有界、异步、可选保序的 transform-many 阶段。
///
/// # 契约说明（What）
/// - 上游：[`offer`](Self::offer)、[`post`](Self::post)、[`send`](Self::send)，或经 [`Target`] 被其他阶段链接；
/// - 下游：[`link_to`](Self::link_to)、[`link_to_filtered`](Self::link_to_filtered)、
///   [`try_receive`](Self::try_receive)、[`try_receive_all`](Self::try_receive_all)、
///   [`receive`](Self::receive)、[`output_available`](Self::output_available)；
/// - 生命周期：[`complete`](Self::complete)、[`fault`](Self::fault)、[`completion`](Self::completion)。
///
/// # 使用示例
/// ```no_run
/// use spark_dataflow::{StageOptions, Transform, TransformManyStage};
///
/// # async fn demo() -> spark_dataflow::Result<()> {
/// let stage = TransformManyStage::new(
///     Transform::sync(|line: String| {
///         Ok(line.split_whitespace().map(str::to_owned).collect::<Vec<_>>())
///     }),
///     StageOptions::new().with_degree_of_parallelism(4),
/// )?;
/// stage.post("hello dataflow".to_owned());
/// stage.complete();
/// while let Some(word) = stage.receive().await {
///     println!("{word}");
/// }
/// stage.completion().await
/// # }
/// ```
pub struct TransformManyStage<I, O> {
    inner: Arc<StageInner<I, O>>,
}

/// 消息处理结束后，其输入单位由谁归还。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UnitOwner {
    /// 工作任务在归还并行槽位后归还。
    Worker,
    /// 输出已交给重排缓冲，放行时按 N−1 规则折算。
    Reorder,
}

struct StageInner<I, O> {
    id: u64,
    name: Arc<str>,
    transform: Transform<I, O>,
    cancellation: CancellationToken,
    scheduler: Arc<dyn TaskScheduler>,
    bounding: Arc<BoundingCounter>,
    capacity: Notify,
    target: TargetCore<I>,
    reordering: Reordering<O>,
    source: Arc<SourceCore<O>>,
    parallel_source_lock: Option<Mutex<()>>,
    registration: Mutex<Option<CancellationRegistration>>,
}

impl<I, O> TransformManyStage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// 构造阶段。
    ///
    /// # 错误
    /// - 选项非法时返回 [`DataflowError::InvalidOptions`]；
    /// - 未提供调度器且当前线程不在 Tokio 运行时内时返回 [`DataflowError::NoRuntime`]。
    pub fn new(transform: Transform<I, O>, options: StageOptions) -> Result<Self> {
        options.validate()?;
        let scheduler: Arc<dyn TaskScheduler> = match options.scheduler.clone() {
            Some(scheduler) => scheduler,
            None => Arc::new(TokioScheduler::current()?),
        };
        let id = NEXT_STAGE_ID.fetch_add(1, Ordering::Relaxed);
        let name: Arc<str> = options.name.as_deref().unwrap_or(DEFAULT_NAME).into();
        let bounding = Arc::new(BoundingCounter::new(options.bounded_capacity));

        let inner = Arc::new_cyclic(|this: &Weak<StageInner<I, O>>| {
            let observer: Weak<dyn SourceObserver> = this.clone();
            let source = SourceCore::new(Arc::clone(&name), observer, Arc::clone(&scheduler));
            let reordering = if options.requires_reordering() {
                let stage = this.clone();
                Reordering::Ordered(ReorderingBuffer::new(move |_, entry| {
                    if let (ReorderEntry::Outputs(items), Some(stage)) = (entry, stage.upgrade()) {
                        stage.publish(items);
                    }
                }))
            } else {
                Reordering::Disabled
            };
            StageInner {
                id,
                name: Arc::clone(&name),
                transform,
                cancellation: options.cancellation.clone(),
                scheduler,
                bounding: Arc::clone(&bounding),
                capacity: Notify::new(),
                target: TargetCore::new(Arc::clone(&bounding), options.degree_of_parallelism),
                reordering,
                source,
                parallel_source_lock: options
                    .requires_parallel_source_lock()
                    .then(|| Mutex::new(())),
                registration: Mutex::new(None),
            }
        });

        debug!(
            stage = %name,
            id,
            transform = inner.transform.kind(),
            degree_of_parallelism = options.degree_of_parallelism,
            bounded_capacity = ?options.bounded_capacity,
            ensure_ordered = options.ensure_ordered,
            "stage created"
        );

        let weak = Arc::downgrade(&inner);
        let registration = options.cancellation.register(move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_cancelled();
            }
        });
        if !inner.target.is_declining() {
            *inner.registration.lock() = Some(registration);
        }

        Ok(Self { inner })
    }

    /// 非阻塞地投递一条消息。
    pub fn offer(&self, item: I) -> Admission<I> {
        self.inner.offer(item)
    }

    /// 非阻塞投递的便捷形式，返回是否被接收。
    pub fn post(&self, item: I) -> bool {
        self.offer(item).is_accepted()
    }

    /// 投递一条消息，容量已满时挂起直到有空位或阶段停止接收。
    pub async fn send(&self, item: I) -> Admission<I> {
        let mut item = item;
        loop {
            let mut capacity = pin!(self.inner.capacity.notified());
            capacity.as_mut().enable();
            match self.inner.offer(item) {
                Admission::Postponed(back) => {
                    item = back;
                    capacity.await;
                }
                admission => return admission,
            }
        }
    }

    /// 停止接收输入；在途消息处理完、输出被取空后阶段完成。
    pub fn complete(&self) {
        debug!(stage = %self.inner.name, "completion requested");
        self.inner.complete_target(None, false);
    }

    /// 以故障终止阶段，丢弃排队输入。
    pub fn fault(&self, error: DataflowError) {
        self.inner.complete_target(Some(error), true);
    }

    /// 阶段完成信号。
    pub fn completion(&self) -> Completion {
        self.inner.source.completion()
    }

    /// 链接下游目标。
    pub fn link_to<T>(&self, target: T, options: LinkOptions) -> LinkHandle
    where
        T: Target<O> + 'static,
    {
        self.inner.source.link_to(Arc::new(target), options, None)
    }

    /// 链接下游目标，只投递满足谓词的输出；不满足的输出视为被该链接拒绝。
    pub fn link_to_filtered<T, F>(&self, target: T, options: LinkOptions, predicate: F) -> LinkHandle
    where
        T: Target<O> + 'static,
        F: Fn(&O) -> bool + Send + Sync + 'static,
    {
        let filter: LinkFilter<O> = Arc::new(predicate);
        self.inner
            .source
            .link_to(Arc::new(target), options, Some(filter))
    }

    /// 拉取队首输出；提供过滤器时仅当队首匹配才取走。
    pub fn try_receive(&self, filter: Option<&dyn Fn(&O) -> bool>) -> Option<O> {
        self.inner.source.try_receive(filter)
    }

    /// 取走全部缓冲输出。
    pub fn try_receive_all(&self) -> Vec<O> {
        self.inner.source.try_receive_all()
    }

    /// 等待下一条输出；阶段完成且无剩余输出时返回 `None`。
    pub async fn receive(&self) -> Option<O> {
        self.inner.source.receive().await
    }

    /// 等待输出可取；阶段完成且无剩余输出时返回 `false`。
    pub async fn output_available(&self) -> bool {
        self.inner.source.output_available().await
    }

    /// 排队等待处理的输入数量。
    pub fn input_count(&self) -> usize {
        self.inner.target.queued()
    }

    /// 缓冲的输出数量。
    pub fn output_count(&self) -> usize {
        self.inner.source.count()
    }

    /// 有界容量计数器的当前值。
    pub fn bounding_count(&self) -> usize {
        self.inner.bounding.count()
    }

    /// 运行状态快照。
    pub fn metrics(&self) -> StageMetrics {
        let inner = &self.inner;
        let (input_count, in_flight) = inner.target.occupancy();
        StageMetrics {
            input_count,
            in_flight,
            output_count: inner.source.count(),
            bounding_count: inner.bounding.count(),
            bounded_capacity: inner.bounding.capacity(),
            reorder_pending: inner
                .reordering
                .buffer()
                .map_or(0, ReorderingBuffer::pending_len),
            links: inner.source.link_count(),
            completed: inner.source.completion().is_completed(),
        }
    }

    /// 阶段名。
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 进程内唯一的阶段编号。
    pub fn id(&self) -> u64 {
        self.inner.id
    }
}

impl<I, O> StageInner<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn offer(self: &Arc<Self>, item: I) -> Admission<I> {
        let (admission, sequence_id) = self.target.offer(item);
        match (&admission, sequence_id) {
            (Admission::Accepted, Some(sequence_id)) => {
                trace!(stage = %self.name, sequence_id, "message admitted");
                self.dispatch();
            }
            (Admission::Postponed(_), _) => {
                trace!(stage = %self.name, bounding = self.bounding.count(), "message postponed");
            }
            _ => {}
        }
        admission
    }

    /// 在并行度允许的范围内为排队消息派发任务。
    fn dispatch(self: &Arc<Self>) {
        while let Some(envelope) = self.target.take_next() {
            trace!(stage = %self.name, sequence_id = envelope.sequence_id, "message dispatched");
            let stage = Arc::clone(self);
            self.scheduler.spawn(Box::pin(async move {
                let owner = stage.process(envelope).await;
                stage.signal_one_async_message_completed(owner);
            }));
        }
    }

    /// 一条消息（成功、故障或取消）处理结束。
    ///
    /// 先归还并行槽位再归还输入单位，保证任意时刻“排队 + 处理中”的输入都各自持有一个单位。
    fn signal_one_async_message_completed(self: &Arc<Self>, owner: UnitOwner) {
        self.target.finish_one();
        if owner == UnitOwner::Worker {
            self.release_units(1);
        }
        self.dispatch();
        self.try_complete_target();
    }

    async fn process(&self, envelope: Envelope<I>) -> UnitOwner {
        let Envelope {
            payload,
            sequence_id,
        } = envelope;
        if self.target.is_faulted() || self.cancellation.is_cancelled() {
            trace!(stage = %self.name, sequence_id, "message skipped");
            self.skip(sequence_id);
            return UnitOwner::Worker;
        }
        match &self.transform {
            Transform::Sync(func) => {
                let produced = panic::catch_unwind(AssertUnwindSafe(|| func(payload)))
                    .unwrap_or_else(|panicked| Err(panic_error(panicked)));
                match produced {
                    Ok(outputs) => self.store_lazy(sequence_id, GuardedOutputs::new(outputs)),
                    Err(error) => self.fail(sequence_id, error),
                }
            }
            Transform::Future(func) => {
                let produced = AssertUnwindSafe(async { func(payload).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panicked| Err(panic_error(panicked)));
                match produced {
                    Ok(outputs) => self.store_materialized(sequence_id, outputs),
                    Err(error) => self.fail(sequence_id, error),
                }
            }
            Transform::Stream(func) => {
                match panic::catch_unwind(AssertUnwindSafe(|| func(payload))) {
                    Ok(outputs) => {
                        let outputs = AssertUnwindSafe(outputs)
                            .catch_unwind()
                            .map(|next| next.unwrap_or_else(|panicked| Err(panic_error(panicked))))
                            .boxed();
                        self.store_stream(sequence_id, outputs).await
                    }
                    Err(panicked) => self.fail(sequence_id, panic_error(panicked)),
                }
            }
        }
    }

    /// 转换没有产出序列：按错误处理并占用重排槽位。
    fn fail(&self, sequence_id: u64, error: DataflowError) -> UnitOwner {
        self.handle_error(sequence_id, error);
        self.skip(sequence_id);
        UnitOwner::Worker
    }

    /// 惰性输出：轮到本序号或无需重排时逐条写出，否则物化后暂存。
    fn store_lazy(&self, sequence_id: u64, outputs: GuardedOutputs<O>) -> UnitOwner {
        match self.reordering.buffer() {
            Some(buffer) if buffer.is_next(sequence_id) => {
                if let Some(error) = self.emit_until_failure(outputs) {
                    self.handle_error(sequence_id, error);
                }
                buffer.add_item(sequence_id, ReorderEntry::Skipped);
                UnitOwner::Worker
            }
            Some(buffer) => match outputs.collect::<Result<Vec<_>>>() {
                Ok(outputs) => {
                    buffer.add_item(sequence_id, ReorderEntry::Outputs(outputs));
                    UnitOwner::Reorder
                }
                Err(error) => self.fail(sequence_id, error),
            },
            None => {
                let failure = {
                    let _serialized = self.parallel_source_lock.as_ref().map(|lock| lock.lock());
                    self.emit_until_failure(outputs)
                };
                if let Some(error) = failure {
                    self.handle_error(sequence_id, error);
                }
                UnitOwner::Worker
            }
        }
    }

    /// 逐条写出，遇到第一条错误即停止并返回它。
    fn emit_until_failure(&self, outputs: GuardedOutputs<O>) -> Option<DataflowError> {
        for next in outputs {
            match next {
                Ok(item) => self.emit(item),
                Err(error) => return Some(error),
            }
        }
        None
    }

    /// 已物化输出：可信且轮到本序号时走快路径。
    fn store_materialized(&self, sequence_id: u64, outputs: Vec<O>) -> UnitOwner {
        let Some(buffer) = self.reordering.buffer() else {
            self.emit_all(outputs);
            return UnitOwner::Worker;
        };
        match buffer.add_item_if_next_and_trusted(sequence_id, outputs, true) {
            FastPath::Released => UnitOwner::Reorder,
            FastPath::Next(outputs) => {
                self.emit_all(outputs);
                buffer.add_item(sequence_id, ReorderEntry::Skipped);
                UnitOwner::Worker
            }
            FastPath::Later(outputs) => {
                buffer.add_item(sequence_id, ReorderEntry::Outputs(outputs));
                UnitOwner::Reorder
            }
        }
    }

    /// 异步流输出：可直接写出时边产出边转发，否则收齐后暂存。
    async fn store_stream(
        &self,
        sequence_id: u64,
        mut outputs: BoxStream<'static, Result<O>>,
    ) -> UnitOwner {
        let buffer = self.reordering.buffer();
        let direct = buffer.is_none_or(|buffer| buffer.is_next(sequence_id));

        if direct {
            let mut failure = None;
            while let Some(next) = outputs.next().await {
                match next {
                    Ok(_) if self.target.is_faulted() => break,
                    Ok(item) => match &self.parallel_source_lock {
                        Some(lock) => {
                            let _serialized = lock.lock();
                            self.emit(item);
                        }
                        None => self.emit(item),
                    },
                    Err(error) => {
                        failure = Some(error);
                        break;
                    }
                }
            }
            if let Some(error) = failure {
                self.handle_error(sequence_id, error);
            }
            if let Some(buffer) = buffer {
                buffer.add_item(sequence_id, ReorderEntry::Skipped);
            }
            return UnitOwner::Worker;
        }

        let mut collected = Vec::new();
        let mut failure = None;
        while let Some(next) = outputs.next().await {
            match next {
                Ok(item) => collected.push(item),
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }
        let swallowed = match failure {
            None => true,
            Some(error) => self.handle_error(sequence_id, error),
        };
        match buffer {
            Some(buffer) if swallowed => {
                buffer.add_item(sequence_id, ReorderEntry::Outputs(collected));
                UnitOwner::Reorder
            }
            _ => {
                self.skip(sequence_id);
                UnitOwner::Worker
            }
        }
    }

    /// 区分协作取消与故障；返回 `true` 表示错误被吞掉。
    fn handle_error(&self, sequence_id: u64, error: DataflowError) -> bool {
        if error.is_cancellation() && self.cancellation.is_cancelled() {
            trace!(stage = %self.name, sequence_id, "transform observed cancellation");
            return true;
        }
        warn!(stage = %self.name, sequence_id, %error, "transform failed");
        self.complete_target(Some(error), true);
        false
    }

    /// 为没有输出的消息占用重排槽位。
    fn skip(&self, sequence_id: u64) {
        if let Some(buffer) = self.reordering.buffer() {
            buffer.add_item(sequence_id, ReorderEntry::Skipped);
        }
    }

    /// 写出一条输出，先为它追加一个单位。
    fn emit(&self, item: O) {
        self.bounding.expand(1);
        self.source.add_message(item);
    }

    fn emit_all(&self, outputs: Vec<O>) {
        if outputs.is_empty() {
            return;
        }
        self.bounding.expand(outputs.len());
        self.source.add_messages(outputs);
    }

    /// 重排缓冲放行一条暂存消息：输入单位按 N−1 规则折算为输出单位。
    fn publish(&self, outputs: Vec<O>) {
        match outputs.len() {
            0 => self.release_units(1),
            produced => {
                self.bounding.settle(produced);
                self.source.add_messages(outputs);
            }
        }
    }

    fn release_units(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.bounding.release(count);
        self.capacity.notify_waiters();
    }

    fn complete_target(&self, reason: Option<DataflowError>, drop_pending: bool) {
        let error = reason.clone();
        let declined = self.target.decline(reason, drop_pending);
        if declined.fault_recorded
            && let Some(error) = error
        {
            warn!(stage = %self.name, %error, dropped = declined.dropped, "stage faulted");
        } else if declined.dropped > 0 {
            debug!(stage = %self.name, dropped = declined.dropped, "pending input dropped");
        }
        self.release_units(declined.dropped);
        self.capacity.notify_waiters();
        self.try_complete_target();
    }

    fn try_complete_target(&self) {
        let Some(outcome) = self.target.try_complete() else {
            return;
        };
        let registration = self.registration.lock().take();
        if let Some(registration) = registration {
            registration.unregister();
        }
        self.capacity.notify_waiters();
        match outcome {
            None => {
                debug!(stage = %self.name, "input side completed");
                self.source.complete();
            }
            Some(error) => self.source.complete_faulted(error),
        }
    }

    fn on_cancelled(&self) {
        debug!(stage = %self.name, "cancellation requested");
        self.complete_target(None, true);
    }
}

impl<I, O> SourceObserver for StageInner<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn items_removed(&self, count: usize) {
        self.release_units(count);
    }

    fn source_faulted(&self, error: DataflowError) {
        self.complete_target(Some(error), true);
    }
}

impl<I, O> Target<I> for TransformManyStage<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn offer(&self, item: I) -> Result<Admission<I>> {
        Ok(self.inner.offer(item))
    }

    fn ready(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            loop {
                let mut capacity = pin!(self.inner.capacity.notified());
                capacity.as_mut().enable();
                if !self.inner.bounding.is_full() || self.inner.target.is_declining() {
                    return;
                }
                capacity.await;
            }
        })
    }

    fn complete(&self) {
        TransformManyStage::complete(self);
    }

    fn fault(&self, error: DataflowError) {
        TransformManyStage::fault(self, error);
    }
}

impl<I, O> Clone for TransformManyStage<I, O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I, O> fmt::Display for TransformManyStage<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Id={}", self.inner.name, self.inner.id)
    }
}

impl<I, O> fmt::Debug for TransformManyStage<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformManyStage")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("transform", &self.inner.transform)
            .field("target", &self.inner.target)
            .field("source", &self.inner.source)
            .finish()
    }
}
