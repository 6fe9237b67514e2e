//! 输出侧：缓冲、推送与拉取。
//!
//! # 教案级说明
//! - **Why**：输出既可能被链接的下游目标推走，也可能被调用方主动拉取；两条路径必须共享同一个 FIFO 队列，
//!   并在每次移除后把容量单位归还给输入侧；
//! - **How**：
//!   - 队列、链接表与完成状态放在同一把 `parking_lot` 锁下；
//!   - `outgoing` 锁串行化“取出队首 → 投递 → 失败放回”与拉取操作，保证队首不会被并发拿走；
//!   - 同一时刻至多一个投递任务运行，遇到推迟的目标时等待其 [`Target::ready`] 或链接表变化；
//! - **What**：
//!   - 每次移除 k 条输出都会调用 [`SourceObserver::items_removed`]`(k)`，故障时丢弃的缓冲输出同样计入；
//!   - 完成条件为“已标记完成 ∧ 队列为空 ∧ 没有正在投递的条目”；
//!   - 下游 `offer` 返回错误时记录 [`DataflowError::Downstream`] 并通过 [`SourceObserver::source_faulted`] 回灌。

use std::collections::VecDeque;
use std::fmt;
use std::pin::pin;
use std::sync::{Arc, Weak};

use futures::future::{self, Either};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::completion::{Completion, CompletionSignal};
use crate::error::{DataflowError, Result};
use crate::link::{LinkEntry, LinkFilter, LinkHandle, LinkRegistry};
use crate::options::LinkOptions;
use crate::scheduler::TaskScheduler;
use crate::target::{Admission, Target};

/// 源端向所属阶段回报事件的观察者接口。
pub(crate) trait SourceObserver: Send + Sync {
    /// 有 `count` 条输出离开了源端（被消费或被丢弃）。
    fn items_removed(&self, count: usize);

    /// 投递路径上发生了下游故障。
    fn source_faulted(&self, error: DataflowError);
}

struct SourceState<O> {
    queue: VecDeque<O>,
    links: Vec<LinkEntry<O>>,
    next_link_id: u64,
    link_generation: u64,
    completing: bool,
    fault: Option<DataflowError>,
    delivering: bool,
    offering: bool,
    resolved: Option<Result<()>>,
}

/// 一轮投递的结果。
enum Step<O> {
    Delivered,
    Postponed(Vec<Arc<dyn Target<O>>>),
    Faulted(DataflowError),
    Idle,
}

type LinkSnapshot<O> = Vec<(u64, Arc<dyn Target<O>>, Option<LinkFilter<O>>)>;

/// 输出侧核心。
pub(crate) struct SourceCore<O> {
    name: Arc<str>,
    state: Mutex<SourceState<O>>,
    outgoing: Mutex<()>,
    available: Notify,
    links_changed: Notify,
    observer: Weak<dyn SourceObserver>,
    scheduler: Arc<dyn TaskScheduler>,
    completion: CompletionSignal,
    this: Weak<SourceCore<O>>,
}

impl<O> SourceCore<O>
where
    O: Send + 'static,
{
    pub(crate) fn new(
        name: Arc<str>,
        observer: Weak<dyn SourceObserver>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name,
            state: Mutex::new(SourceState {
                queue: VecDeque::new(),
                links: Vec::new(),
                next_link_id: 0,
                link_generation: 0,
                completing: false,
                fault: None,
                delivering: false,
                offering: false,
                resolved: None,
            }),
            outgoing: Mutex::new(()),
            available: Notify::new(),
            links_changed: Notify::new(),
            observer,
            scheduler,
            completion: CompletionSignal::new(),
            this: this.clone(),
        })
    }

    /// 追加一条输出。
    pub(crate) fn add_message(&self, item: O) {
        self.add_messages(std::iter::once(item));
    }

    /// 按顺序追加多条输出。
    ///
    /// 源端已故障时输出被直接丢弃，其容量单位立即归还。
    pub(crate) fn add_messages<It>(&self, items: It)
    where
        It: IntoIterator<Item = O>,
    {
        let mut state = self.state.lock();
        if state.fault.is_some() {
            drop(state);
            let discarded = items.into_iter().count();
            self.notify_removed(discarded);
            return;
        }
        let before = state.queue.len();
        state.queue.extend(items);
        if state.queue.len() == before {
            return;
        }
        let spawn = !state.links.is_empty() && !state.delivering;
        if spawn {
            state.delivering = true;
        }
        drop(state);
        self.available.notify_waiters();
        if spawn {
            self.spawn_delivery();
        }
    }

    /// 拉取队首条目；提供过滤器时只有队首匹配才会被取走。
    pub(crate) fn try_receive(&self, filter: Option<&dyn Fn(&O) -> bool>) -> Option<O> {
        let _outgoing = self.outgoing.lock();
        let item = {
            let mut state = self.state.lock();
            let head_matches = state
                .queue
                .front()
                .is_some_and(|head| filter.is_none_or(|filter| filter(head)));
            if head_matches {
                state.queue.pop_front()
            } else {
                None
            }
        };
        if item.is_some() {
            self.notify_removed(1);
            self.check_completion();
        }
        item
    }

    /// 一次性取走全部缓冲输出。
    pub(crate) fn try_receive_all(&self) -> Vec<O> {
        let _outgoing = self.outgoing.lock();
        let items: Vec<O> = self.state.lock().queue.drain(..).collect();
        if !items.is_empty() {
            self.notify_removed(items.len());
            self.check_completion();
        }
        items
    }

    /// 等待并取走下一条输出；源端完成且队列为空时返回 `None`。
    pub(crate) async fn receive(&self) -> Option<O> {
        loop {
            let mut notified = pin!(self.available.notified());
            notified.as_mut().enable();
            if let Some(item) = self.try_receive(None) {
                return Some(item);
            }
            if self.completion.is_resolved() {
                return None;
            }
            notified.await;
        }
    }

    /// 等待直到有输出可取（`true`）或源端已完成（`false`）。
    pub(crate) async fn output_available(&self) -> bool {
        loop {
            let mut notified = pin!(self.available.notified());
            notified.as_mut().enable();
            if !self.state.lock().queue.is_empty() {
                return true;
            }
            if self.completion.is_resolved() {
                return false;
            }
            notified.await;
        }
    }

    /// 注册下游目标。
    pub(crate) fn link_to(
        &self,
        target: Arc<dyn Target<O>>,
        options: LinkOptions,
        filter: Option<LinkFilter<O>>,
    ) -> LinkHandle {
        let mut state = self.state.lock();
        let id = state.next_link_id;
        state.next_link_id += 1;
        let entry = LinkEntry::new(id, Arc::clone(&target), filter, &options);
        if options.append {
            state.links.push(entry);
        } else {
            state.links.insert(0, entry);
        }
        state.link_generation += 1;
        let spawn = !state.delivering && !state.queue.is_empty();
        if spawn {
            state.delivering = true;
        }
        let already_resolved = state.resolved.clone();
        drop(state);

        debug!(stage = %self.name, link = id, append = options.append, "target linked");
        self.links_changed.notify_waiters();
        if spawn {
            self.spawn_delivery();
        }
        if options.propagate_completion
            && let Some(outcome) = already_resolved
        {
            propagate(&*target, &outcome);
        }

        let registry: Weak<dyn LinkRegistry> = self.this.clone();
        LinkHandle::new(registry, id)
    }

    /// 标记不会再有新输出。
    pub(crate) fn complete(&self) {
        self.state.lock().completing = true;
        self.check_completion();
    }

    /// 记录故障并标记完成，缓冲输出被丢弃。
    pub(crate) fn complete_faulted(&self, error: DataflowError) {
        self.record_fault(error);
        self.state.lock().completing = true;
        self.check_completion();
    }

    pub(crate) fn completion(&self) -> Completion {
        self.completion.completion()
    }

    pub(crate) fn count(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub(crate) fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }

    /// 记录故障（第一次胜出）并丢弃缓冲输出；返回本次是否首次记录。
    fn record_fault(&self, error: DataflowError) -> bool {
        let (recorded, discarded) = {
            let mut state = self.state.lock();
            if state.fault.is_some() {
                (false, 0)
            } else {
                state.fault = Some(error);
                let discarded = state.queue.len();
                state.queue.clear();
                (true, discarded)
            }
        };
        if discarded > 0 {
            debug!(stage = %self.name, discarded, "buffered output dropped after fault");
            self.notify_removed(discarded);
        }
        if recorded {
            self.links_changed.notify_waiters();
            self.available.notify_waiters();
        }
        recorded
    }

    fn check_completion(&self) {
        let (outcome, targets) = {
            let mut state = self.state.lock();
            if state.resolved.is_some()
                || !state.completing
                || !state.queue.is_empty()
                || state.offering
            {
                return;
            }
            let outcome = match &state.fault {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            };
            state.resolved = Some(outcome.clone());
            let targets: Vec<_> = state
                .links
                .iter()
                .filter(|link| link.propagate_completion)
                .map(|link| Arc::clone(&link.target))
                .collect();
            (outcome, targets)
        };

        match &outcome {
            Ok(()) => debug!(stage = %self.name, "stage completed"),
            Err(error) => warn!(stage = %self.name, %error, "stage completed with fault"),
        }
        self.completion.resolve(outcome.clone());
        self.available.notify_waiters();
        self.links_changed.notify_waiters();
        for target in targets {
            propagate(&*target, &outcome);
        }
    }

    fn notify_removed(&self, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(observer) = self.observer.upgrade() {
            observer.items_removed(count);
        }
    }

    fn spawn_delivery(&self) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        self.scheduler.spawn(Box::pin(async move { this.deliver().await }));
    }

    async fn deliver(self: Arc<Self>) {
        loop {
            let mut changed = pin!(self.links_changed.notified());
            changed.as_mut().enable();
            match self.offer_head() {
                Step::Delivered => continue,
                Step::Idle => return,
                Step::Faulted(error) => {
                    if let Some(observer) = self.observer.upgrade() {
                        observer.source_faulted(error);
                    }
                    return;
                }
                Step::Postponed(targets) => {
                    trace!(stage = %self.name, postponed = targets.len(), "waiting for downstream capacity");
                    let ready = future::select_all(targets.iter().map(|target| target.ready()));
                    if let Either::Right(_) = future::select(ready, changed).await {
                        trace!(stage = %self.name, "links changed while waiting");
                    }
                }
            }
        }
    }

    /// 把队首条目依次提供给链接的目标。
    fn offer_head(&self) -> Step<O> {
        let outgoing = self.outgoing.lock();
        let (head, snapshot, generation) = {
            let mut state = self.state.lock();
            if state.fault.is_some() || state.links.is_empty() {
                state.delivering = false;
                return Step::Idle;
            }
            let Some(head) = state.queue.pop_front() else {
                state.delivering = false;
                drop(state);
                drop(outgoing);
                self.check_completion();
                return Step::Idle;
            };
            state.offering = true;
            let snapshot: LinkSnapshot<O> = state
                .links
                .iter()
                .map(|link| (link.id, Arc::clone(&link.target), link.filter.clone()))
                .collect();
            (head, snapshot, state.link_generation)
        };

        let mut slot = Some(head);
        let mut accepted_by = None;
        let mut failure = None;
        let mut postponed = Vec::new();
        for (id, target, filter) in &snapshot {
            let Some(item) = slot.take() else {
                break;
            };
            if let Some(filter) = filter
                && !filter(&item)
            {
                slot = Some(item);
                continue;
            }
            match target.offer(item) {
                Ok(Admission::Accepted) => {
                    accepted_by = Some(*id);
                    break;
                }
                Ok(Admission::Postponed(item)) => {
                    postponed.push(Arc::clone(target));
                    slot = Some(item);
                }
                Ok(Admission::Declined(item)) => slot = Some(item),
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            }
        }

        let mut state = self.state.lock();
        state.offering = false;
        let step = if let Some(id) = accepted_by {
            if let Some(position) = state.links.iter().position(|link| link.id == id)
                && state.links[position].record_delivery()
            {
                state.links.remove(position);
                state.link_generation += 1;
                debug!(stage = %self.name, link = id, "link reached max_messages and was removed");
            }
            drop(state);
            self.notify_removed(1);
            Step::Delivered
        } else if let Some(error) = failure {
            drop(state);
            self.notify_removed(1);
            let error = DataflowError::downstream(error);
            warn!(stage = %self.name, %error, "downstream target failed");
            self.record_fault(error.clone());
            Step::Faulted(error)
        } else if state.fault.is_some() {
            state.delivering = false;
            drop(state);
            drop(slot);
            self.notify_removed(1);
            Step::Idle
        } else {
            if let Some(item) = slot {
                state.queue.push_front(item);
            }
            let step = if !postponed.is_empty() {
                Step::Postponed(postponed)
            } else if state.link_generation != generation {
                Step::Delivered
            } else {
                state.delivering = false;
                Step::Idle
            };
            drop(state);
            step
        };
        drop(outgoing);
        self.check_completion();
        step
    }
}

impl<O> LinkRegistry for SourceCore<O>
where
    O: Send + 'static,
{
    fn unlink(&self, id: u64) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let before = state.links.len();
            state.links.retain(|link| link.id != id);
            let removed = state.links.len() != before;
            if removed {
                state.link_generation += 1;
            }
            removed
        };
        if removed {
            debug!(stage = %self.name, link = id, "target unlinked");
            self.links_changed.notify_waiters();
        }
        removed
    }
}

impl<O> fmt::Debug for SourceCore<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SourceCore")
            .field("name", &self.name)
            .field("queued", &state.queue.len())
            .field("links", &state.links.len())
            .field("completing", &state.completing)
            .field("faulted", &state.fault.is_some())
            .finish()
    }
}

fn propagate<O>(target: &dyn Target<O>, outcome: &Result<()>) {
    match outcome {
        Ok(()) => target.complete(),
        Err(error) => target.fault(error.clone()),
    }
}
