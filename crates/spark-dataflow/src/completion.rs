//! 一次性、多等待者的完成信号。
//!
//! # 教案级说明
//! - **Why**：`Completion` 会被调用方、下游链接以及测试同时等待，必须可克隆且只解析一次；
//! - **How**：以 `tokio::sync::watch` 保存 `Option<Result<()>>`，写端 [`CompletionSignal`] 仅接受第一次解析，
//!   读端 [`Completion`] 通过 `wait_for` 等待值变为 `Some`；
//! - **What**：写端在解析前被释放时，等待者得到 [`DataflowError::StageDropped`] 而不是永久挂起。

use std::fmt;
use std::future::IntoFuture;

use futures::future::BoxFuture;
use tokio::sync::watch;

use crate::error::{DataflowError, Result};

type Slot = Option<Result<()>>;

/// 完成信号的写端，由阶段内部持有。
pub(crate) struct CompletionSignal {
    sender: watch::Sender<Slot>,
}

impl CompletionSignal {
    pub(crate) fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }

    /// 解析完成信号；返回 `false` 表示此前已被解析，本次结果被丢弃。
    pub(crate) fn resolve(&self, outcome: Result<()>) -> bool {
        let mut outcome = Some(outcome);
        self.sender.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = outcome.take();
            true
        })
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.sender.borrow().is_some()
    }

    pub(crate) fn completion(&self) -> Completion {
        Completion {
            receiver: self.sender.subscribe(),
        }
    }
}

/// 阶段完成的只读视图。
///
/// # 契约说明（What）
/// - 可任意克隆，每个克隆都观察到同一个结果；
/// - 成功时得到 `Ok(())`，故障时得到第一条被记录的错误，原始错误经 `source()` 保留；
/// - 直接 `.await` 即可等待，也可以用 [`try_result`](Self::try_result) 非阻塞查询。
#[derive(Clone)]
pub struct Completion {
    receiver: watch::Receiver<Slot>,
}

impl Completion {
    /// 等待完成并返回结果。
    pub async fn wait(mut self) -> Result<()> {
        let outcome = match self.receiver.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(DataflowError::StageDropped))
    }

    /// 是否已经完成（成功或故障）。
    pub fn is_completed(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// 非阻塞地读取结果，尚未完成时返回 `None`。
    pub fn try_result(&self) -> Option<Result<()>> {
        self.receiver.borrow().clone()
    }

    /// 是否以故障结束。
    pub fn is_faulted(&self) -> bool {
        matches!(&*self.receiver.borrow(), Some(Err(_)))
    }
}

impl IntoFuture for Completion {
    type Output = Result<()>;
    type IntoFuture = BoxFuture<'static, Result<()>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.receiver.borrow() {
            None => "pending",
            Some(Ok(())) => "completed",
            Some(Err(_)) => "faulted",
        };
        f.debug_struct("Completion").field("state", &state).finish()
    }
}
