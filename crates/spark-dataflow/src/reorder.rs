//! 保序重排缓冲。
//!
//! # 教案级说明
//! - **Why**：并行 worker 的完成顺序与准入顺序无关；要求保序时，必须把乱序完成的结果按序号重新排队；
//! - **How**：以 `BTreeMap` 暂存已就绪但未轮到的条目，`next_id` 指向下一个可释放的序号；
//!   每次写入后从 `next_id` 开始连续释放，直到遇到空洞；
//! - **What**：
//!   - 释放严格按序号递增，不跳号；
//!   - 释放回调在缓冲锁内执行，因此并发的级联释放不会交错；
//!   - [`ReorderEntry::Skipped`] 也占用序号，每条被取出的消息都必须恰好写入一次，否则后续序号永久阻塞。

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;

/// 重排缓冲中的条目。
#[derive(Debug, PartialEq, Eq)]
pub enum ReorderEntry<O> {
    /// 已物化的输出，释放时整体写入输出端。
    Outputs(Vec<O>),
    /// 不携带输出的占位：消息被取消、故障，或输出已由 worker 直接写出。
    Skipped,
}

impl<O> ReorderEntry<O> {
    /// 条目携带的输出数量。
    pub fn len(&self) -> usize {
        match self {
            ReorderEntry::Outputs(items) => items.len(),
            ReorderEntry::Skipped => 0,
        }
    }

    /// 是否不携带任何输出。
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`ReorderingBuffer::add_item_if_next_and_trusted`] 的结果。
#[derive(Debug, PartialEq, Eq)]
pub enum FastPath<O> {
    /// 已在缓冲锁内释放。
    Released,
    /// 恰好轮到该序号，但输出不可信；调用方需自行写出，随后以 [`ReorderEntry::Skipped`] 结算。
    Next(Vec<O>),
    /// 尚未轮到，调用方需以 [`ReorderEntry::Outputs`] 写入缓冲。
    Later(Vec<O>),
}

type ReleaseSink<O> = Box<dyn Fn(u64, ReorderEntry<O>) + Send + Sync>;

struct ReorderState<O> {
    next_id: u64,
    pending: BTreeMap<u64, ReorderEntry<O>>,
}

/// 按序号释放条目的重排缓冲。
pub struct ReorderingBuffer<O> {
    state: Mutex<ReorderState<O>>,
    sink: ReleaseSink<O>,
}

impl<O> ReorderingBuffer<O> {
    /// 以释放回调构造缓冲，序号从 0 开始。
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(u64, ReorderEntry<O>) + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(ReorderState {
                next_id: 0,
                pending: BTreeMap::new(),
            }),
            sink: Box::new(sink),
        }
    }

    /// 写入一个已就绪的条目，并释放所有已连续就绪的条目。
    pub fn add_item(&self, id: u64, entry: ReorderEntry<O>) {
        let mut state = self.state.lock();
        if id == state.next_id {
            self.release_from(&mut state, id, entry);
        } else {
            debug_assert!(id > state.next_id, "sequence id {id} was already released");
            state.pending.insert(id, entry);
        }
    }

    /// `id` 是否为下一个可释放的序号。
    ///
    /// 返回 `true` 后结果保持有效，直到该序号被写入缓冲。
    pub fn is_next(&self, id: u64) -> bool {
        self.state.lock().next_id == id
    }

    /// 快路径：可信输出且恰好轮到时，直接在锁内释放，跳过暂存。
    pub fn add_item_if_next_and_trusted(&self, id: u64, items: Vec<O>, trusted: bool) -> FastPath<O> {
        let mut state = self.state.lock();
        if state.next_id != id {
            return FastPath::Later(items);
        }
        if !trusted {
            return FastPath::Next(items);
        }
        self.release_from(&mut state, id, ReorderEntry::Outputs(items));
        FastPath::Released
    }

    /// 已就绪但仍在等待前序序号的条目数量。
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    fn release_from(&self, state: &mut ReorderState<O>, id: u64, entry: ReorderEntry<O>) {
        (self.sink)(id, entry);
        state.next_id = id + 1;
        while let Some(entry) = state.pending.remove(&state.next_id) {
            (self.sink)(state.next_id, entry);
            state.next_id += 1;
        }
    }
}

impl<O> fmt::Debug for ReorderingBuffer<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ReorderingBuffer")
            .field("next_id", &state.next_id)
            .field("pending", &state.pending.len())
            .finish()
    }
}

/// 阶段的重排配置：不保序时为直通。
pub(crate) enum Reordering<O> {
    Disabled,
    Ordered(ReorderingBuffer<O>),
}

impl<O> Reordering<O> {
    pub(crate) fn buffer(&self) -> Option<&ReorderingBuffer<O>> {
        match self {
            Reordering::Disabled => None,
            Reordering::Ordered(buffer) => Some(buffer),
        }
    }
}
