use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{DataflowError, Result};

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// 协作取消令牌，统一表达阶段内外的可中断性契约。
///
/// # 设计背景（Why）
/// - 阶段的取消语义是“完成并丢弃排队输入”，而非故障；令牌既要被转换函数轮询，
///   也要在取消瞬间回调阶段，触发 `Target::complete(None, drop_pending = true)`。
///
/// # 逻辑解析（How）
/// - 内部使用 [`AtomicBool`] 表达取消状态，并通过 [`Arc`] 支持多方共享；
/// - `cancel` 在首次成功设置取消位时返回 `true`，并在锁外依次执行已注册回调；
/// - `register` 在令牌已取消时立即同步执行回调，保证不会漏掉通知。
///
/// # 契约说明（What）
/// - **前置条件**：构造时无需额外参数，默认处于“未取消”状态；
/// - **后置条件**：`cancel` 成功后，`is_cancelled` 全局可见，所有注册回调恰好执行一次。
///
/// # 设计取舍与风险（Trade-offs）
/// - 回调在调用 `cancel` 的线程上同步执行，回调内部应避免长时间阻塞；
/// - 框架不会强制终止正在执行的 Future，转换函数需自行检查 `is_cancelled` 或等待 [`cancelled`](Self::cancelled)。
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenState>,
}

struct TokenState {
    flag: AtomicBool,
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
    notify: Notify,
}

impl CancellationToken {
    /// 创建处于“未取消”状态的令牌。
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenState {
                flag: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                callbacks: Mutex::new(Vec::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// 查询当前是否已被标记取消。
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 将令牌标记为取消。
    ///
    /// 返回 `true` 表示本次调用首次触发取消；返回 `false` 表示之前已被取消。
    pub fn cancel(&self) -> bool {
        if self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
        for (_, callback) in callbacks {
            callback();
        }
        self.inner.notify.notify_waiters();
        true
    }

    /// 返回共享同一取消位与回调表的别名句柄。
    ///
    /// 这不是层级令牌：通过任一句柄取消都会取消全部句柄并执行所有已注册回调。
    pub fn child(&self) -> Self {
        self.clone()
    }

    /// 若已取消则返回 [`DataflowError::Cancelled`]，便于在转换函数中直接 `?`。
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DataflowError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// 等待取消发生。
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// 注册取消回调。
    ///
    /// # 契约说明（What）
    /// - 令牌尚未取消：回调被保存，`cancel` 时执行，返回的 [`CancellationRegistration`] 可用于撤销；
    /// - 令牌已经取消：回调在本线程立即执行，返回的注册句柄为空操作。
    pub fn register<F>(&self, callback: F) -> CancellationRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut callbacks = self.inner.callbacks.lock();
            if !self.is_cancelled() {
                callbacks.push((id, Box::new(callback)));
                return CancellationRegistration {
                    token: Some(self.clone()),
                    id,
                };
            }
        }
        callback();
        CancellationRegistration { token: None, id }
    }

    fn unregister(&self, id: u64) {
        self.inner.callbacks.lock().retain(|(entry, _)| *entry != id);
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// 取消回调的注册句柄。
///
/// 调用 [`unregister`](Self::unregister) 撤销尚未触发的回调；直接丢弃句柄则保留回调。
#[derive(Debug)]
pub struct CancellationRegistration {
    token: Option<CancellationToken>,
    id: u64,
}

impl CancellationRegistration {
    /// 撤销回调；若回调已执行则为空操作。
    pub fn unregister(self) {
        if let Some(token) = self.token {
            token.unregister(self.id);
        }
    }
}
