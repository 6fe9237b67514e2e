//! 输入侧：准入、排队与 worker 调度记账。
//!
//! # 教案级说明
//! - **Why**：输入队列、并行槽位与“停止接收”状态必须在同一把锁下变更，否则完成判定会与调度竞争；
//! - **How**：[`TargetCore`] 只做状态机与记账，不持有转换函数，也不直接派生任务，
//!   由阶段根据返回值决定何时派发、何时结算完成；
//! - **What**：
//!   - 序号在准入时分配，从 0 单调递增；
//!   - 完成条件为“已停止接收 ∧ 队列为空 ∧ 无在途消息”，且只会被报告一次；
//!   - 第一次记录的故障胜出，之后的故障被忽略。

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::bounding::BoundingCounter;
use crate::error::{DataflowError, Result};

/// 向目标投递消息的结果。
///
/// 未被接收的消息原样返还给调用方，便于重试或转投其他目标。
#[derive(Debug, PartialEq, Eq)]
pub enum Admission<T> {
    /// 已接收，目标取得所有权。
    Accepted,
    /// 暂时无法接收（容量已满），可等待 [`Target::ready`] 后重试。
    Postponed(T),
    /// 永久拒绝（目标已停止接收或过滤不匹配）。
    Declined(T),
}

impl<T> Admission<T> {
    /// 是否已被接收。
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted)
    }

    /// 取回未被接收的消息。
    pub fn into_inner(self) -> Option<T> {
        match self {
            Admission::Accepted => None,
            Admission::Postponed(item) | Admission::Declined(item) => Some(item),
        }
    }
}

/// 可被链接的下游目标。
///
/// # 设计背景（Why）
/// - 源端推送输出时只依赖此接口，阶段之间、阶段与用户自定义汇点之间因此可以任意串联。
///
/// # 契约说明（What）
/// - `offer` 必须是非阻塞的；返回 `Err` 表示目标自身故障，源端会把它作为下游故障回灌到上游阶段；
/// - 返回 [`Admission::Postponed`] 的实现必须覆盖 [`ready`](Self::ready)，
///   在可能重新接收时才让 Future 就绪，否则源端会反复重试；
/// - `complete`/`fault` 仅在链接开启完成传播时由源端调用。
pub trait Target<T>: Send + Sync {
    /// 尝试接收一条消息。
    fn offer(&self, item: T) -> Result<Admission<T>>;

    /// 等待目标可能重新接收消息。
    fn ready(&self) -> BoxFuture<'_, ()> {
        Box::pin(std::future::ready(()))
    }

    /// 上游已正常完成。
    fn complete(&self);

    /// 上游以故障结束。
    fn fault(&self, error: DataflowError);
}

impl<T, U> Target<T> for Arc<U>
where
    U: Target<T> + ?Sized,
{
    fn offer(&self, item: T) -> Result<Admission<T>> {
        <U as Target<T>>::offer(self, item)
    }

    fn ready(&self) -> BoxFuture<'_, ()> {
        <U as Target<T>>::ready(self)
    }

    fn complete(&self) {
        <U as Target<T>>::complete(self)
    }

    fn fault(&self, error: DataflowError) {
        <U as Target<T>>::fault(self, error)
    }
}

/// 带序号的输入消息。
#[derive(Debug)]
pub(crate) struct Envelope<I> {
    pub(crate) payload: I,
    pub(crate) sequence_id: u64,
}

/// [`TargetCore::decline`] 的结算结果。
#[derive(Debug, Default)]
pub(crate) struct Declined {
    /// 被丢弃的排队消息数量，每条对应一个容量单位。
    pub(crate) dropped: usize,
    /// 本次调用是否首次记录了故障。
    pub(crate) fault_recorded: bool,
}

struct TargetState<I> {
    queue: VecDeque<Envelope<I>>,
    next_sequence_id: u64,
    in_flight: usize,
    declining: bool,
    completed: bool,
    fault: Option<DataflowError>,
}

/// 输入侧核心状态机。
pub(crate) struct TargetCore<I> {
    state: Mutex<TargetState<I>>,
    bounding: Arc<BoundingCounter>,
    degree_of_parallelism: usize,
}

impl<I> TargetCore<I> {
    pub(crate) fn new(bounding: Arc<BoundingCounter>, degree_of_parallelism: usize) -> Self {
        Self {
            state: Mutex::new(TargetState {
                queue: VecDeque::new(),
                next_sequence_id: 0,
                in_flight: 0,
                declining: false,
                completed: false,
                fault: None,
            }),
            bounding,
            degree_of_parallelism,
        }
    }

    /// 准入一条消息：停止接收时拒绝，容量已满时推迟，否则分配序号入队。
    pub(crate) fn offer(&self, payload: I) -> (Admission<I>, Option<u64>) {
        let mut state = self.state.lock();
        if state.declining {
            return (Admission::Declined(payload), None);
        }
        if !self.bounding.try_reserve().is_granted() {
            return (Admission::Postponed(payload), None);
        }
        let sequence_id = state.next_sequence_id;
        state.next_sequence_id += 1;
        state.queue.push_back(Envelope {
            payload,
            sequence_id,
        });
        (Admission::Accepted, Some(sequence_id))
    }

    /// 在并行度允许时取出队首消息，并占用一个并行槽位。
    pub(crate) fn take_next(&self) -> Option<Envelope<I>> {
        let mut state = self.state.lock();
        if state.in_flight >= self.degree_of_parallelism || state.fault.is_some() {
            return None;
        }
        let envelope = state.queue.pop_front()?;
        state.in_flight += 1;
        Some(envelope)
    }

    /// 归还一个并行槽位。
    pub(crate) fn finish_one(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.in_flight > 0, "finish_one without a matching take_next");
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// 停止接收新消息，可选地记录故障并丢弃排队消息。
    ///
    /// 携带故障时总是丢弃排队消息；被丢弃的消息不会调用转换函数。
    pub(crate) fn decline(&self, reason: Option<DataflowError>, drop_pending: bool) -> Declined {
        let mut state = self.state.lock();
        state.declining = true;
        let mut outcome = Declined::default();
        let faulting = reason.is_some();
        if let Some(error) = reason
            && state.fault.is_none()
            && !state.completed
        {
            state.fault = Some(error);
            outcome.fault_recorded = true;
        }
        if drop_pending || faulting {
            outcome.dropped = state.queue.len();
            state.queue.clear();
        }
        outcome
    }

    /// 若满足完成条件且尚未报告，返回完成结果（`None` 表示成功）。
    pub(crate) fn try_complete(&self) -> Option<Option<DataflowError>> {
        let mut state = self.state.lock();
        if state.completed || !state.declining || !state.queue.is_empty() || state.in_flight > 0 {
            return None;
        }
        state.completed = true;
        Some(state.fault.clone())
    }

    pub(crate) fn is_declining(&self) -> bool {
        self.state.lock().declining
    }

    pub(crate) fn is_faulted(&self) -> bool {
        self.state.lock().fault.is_some()
    }

    pub(crate) fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// 同一时刻的（排队数, 在途数）快照。
    pub(crate) fn occupancy(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.queue.len(), state.in_flight)
    }
}

impl<I> fmt::Debug for TargetCore<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TargetCore")
            .field("queued", &state.queue.len())
            .field("in_flight", &state.in_flight)
            .field("declining", &state.declining)
            .field("completed", &state.completed)
            .field("faulted", &state.fault.is_some())
            .finish()
    }
}
