//! 用户转换函数的三种形态。
//!
//! # 教案级说明
//! - **Why**：同一个阶段既要支持“同步返回序列”，也要支持“异步返回序列”与“异步逐条产出”，
//!   但内部只维护一条分发路径；
//! - **How**：在构造期把闭包擦除为 [`Transform`] 的三个变体之一，worker 在运行期只做一次 `match`；
//! - **What**：三种形态共享同一套完成、重排与容量结算逻辑，差异仅在于输出如何被枚举；
//!   用户代码中的 panic 被捕获并转换为 [`DataflowError::Transform`]，与返回错误走同一条故障路径。

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};

use crate::error::{DataflowError, Result};

pub(crate) type OutputIter<O> = Box<dyn Iterator<Item = O> + Send>;

type SyncFn<I, O> = dyn Fn(I) -> Result<OutputIter<O>> + Send + Sync;
type FutureFn<I, O> = dyn Fn(I) -> BoxFuture<'static, Result<Vec<O>>> + Send + Sync;
type StreamFn<I, O> = dyn Fn(I) -> BoxStream<'static, Result<O>> + Send + Sync;

/// 阶段的转换函数。
///
/// # 契约说明（What）
/// - [`Transform::sync`]：返回任意 `IntoIterator`，迭代器被惰性枚举，逐条写入输出；
/// - [`Transform::future`]：返回 Future，结果在 await 后物化为 `Vec`，可走重排快路径；
/// - [`Transform::stream`]：返回异步流，每产出一条就转发一条，不等待整体结束；
/// - 返回 [`DataflowError::Cancelled`](crate::DataflowError::Cancelled) 且阶段令牌已取消时，
///   该消息视为“无输出”；其他错误使阶段进入故障态。
pub enum Transform<I, O> {
    Sync(Arc<SyncFn<I, O>>),
    Future(Arc<FutureFn<I, O>>),
    Stream(Arc<StreamFn<I, O>>),
}

impl<I, O> Transform<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// 同步形态：`I -> Result<impl IntoIterator<Item = O>>`。
    pub fn sync<F, It>(func: F) -> Self
    where
        F: Fn(I) -> Result<It> + Send + Sync + 'static,
        It: IntoIterator<Item = O>,
        It::IntoIter: Send + 'static,
    {
        Transform::Sync(Arc::new(move |input| {
            func(input).map(|items| Box::new(items.into_iter()) as OutputIter<O>)
        }))
    }

    /// 异步形态：`I -> Future<Output = Result<impl IntoIterator<Item = O>>>`。
    pub fn future<F, Fut, It>(func: F) -> Self
    where
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<It>> + Send + 'static,
        It: IntoIterator<Item = O>,
    {
        Transform::Future(Arc::new(move |input| {
            let pending = func(input);
            Box::pin(async move {
                pending
                    .await
                    .map(|items| items.into_iter().collect::<Vec<O>>())
            })
        }))
    }

    /// 异步流形态：`I -> Stream<Item = Result<O>>`。
    pub fn stream<F, S>(func: F) -> Self
    where
        F: Fn(I) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<O>> + Send + 'static,
    {
        Transform::Stream(Arc::new(move |input| func(input).boxed()))
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Transform::Sync(_) => "sync",
            Transform::Future(_) => "future",
            Transform::Stream(_) => "stream",
        }
    }
}

/// 把 panic 载荷转换为转换错误，保留 `&str`/`String` 形式的 panic 信息。
pub(crate) fn panic_error(payload: Box<dyn Any + Send>) -> DataflowError {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned());
    DataflowError::transform_msg(format!("panicked: {detail}"))
}

/// 逐条捕获 panic 的同步输出迭代器。
///
/// 用户迭代器在 `next` 中 panic 时产出一次 `Err`，随后丢弃内部迭代器并结束。
pub(crate) struct GuardedOutputs<O> {
    inner: Option<OutputIter<O>>,
}

impl<O> GuardedOutputs<O> {
    pub(crate) fn new(inner: OutputIter<O>) -> Self {
        Self { inner: Some(inner) }
    }
}

impl<O> Iterator for GuardedOutputs<O> {
    type Item = Result<O>;

    fn next(&mut self) -> Option<Self::Item> {
        let inner = self.inner.as_mut()?;
        match panic::catch_unwind(AssertUnwindSafe(|| inner.next())) {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.inner = None;
                None
            }
            Err(payload) => {
                self.inner = None;
                Some(Err(panic_error(payload)))
            }
        }
    }
}

impl<I, O> Clone for Transform<I, O> {
    fn clone(&self) -> Self {
        match self {
            Transform::Sync(func) => Transform::Sync(Arc::clone(func)),
            Transform::Future(func) => Transform::Future(Arc::clone(func)),
            Transform::Stream(func) => Transform::Stream(Arc::clone(func)),
        }
    }
}

impl<I, O> fmt::Debug for Transform<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Transform::Sync(_) => "Sync",
            Transform::Future(_) => "Future",
            Transform::Stream(_) => "Stream",
        };
        f.debug_tuple("Transform").field(&kind).finish()
    }
}
