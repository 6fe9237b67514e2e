//! # 任务调度契约
//!
//! ## 契约声明
//! * **外部注入：** 阶段自身不持有线程池，所有 worker 与投递任务都通过 [`TaskScheduler`] 提交到调用方提供的执行器；
//! * **对象安全：** `spawn` 仅接收类型擦除后的 `BoxFuture<'static, ()>`，便于以 `Arc<dyn TaskScheduler>` 在配置中传递；
//! * **默认实现：** [`TokioScheduler`] 绑定一个 Tokio 运行时句柄，未显式配置时由阶段在构造期从当前线程捕获。
//!
//! ## 并发语义
//! * 提交的任务可能在任意 worker 线程上并行执行，实现者不得假设单线程调度；
//! * 任务结果不回传，阶段通过自身的完成信号感知任务结束。

use std::fmt;

use futures::future::BoxFuture;
use tokio::runtime::Handle;

use crate::error::{DataflowError, Result};

/// `TaskScheduler` 定义阶段提交后台任务的执行器接口。
///
/// # 设计背景（Why）
/// - 与宿主运行时解耦：测试可以注入自定义调度器统计提交次数，生产环境复用已有的 Tokio 运行时；
///
/// # 契约说明（What）
/// - **前置条件**：实现必须保证提交的 Future 最终被轮询至完成，否则阶段的完成信号永远不会触发；
/// - **后置条件**：`spawn` 立即返回，不得在调用线程上同步执行任务体。
pub trait TaskScheduler: Send + Sync + 'static {
    /// 提交一个后台任务。
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

/// 基于 Tokio 运行时句柄的默认调度器。
#[derive(Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// 绑定指定的运行时句柄。
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// 捕获当前线程所在的 Tokio 运行时。
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|_| DataflowError::NoRuntime)
    }
}

impl TaskScheduler for TokioScheduler {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        drop(self.handle.spawn(task));
    }
}

impl fmt::Debug for TokioScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioScheduler")
            .field("runtime", &self.handle.runtime_flavor())
            .finish()
    }
}
