//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义流水线阶段对外暴露的错误语义：协作取消、转换失败、下游失败、外部故障注入与构造期配置错误；
//! - `Completion` 需要被多个等待者同时观察，因此错误值必须可廉价克隆，底层原因以 [`Arc`] 共享。
//!
//! ## 设计要求（What）
//! - 所有错误类型派生 `thiserror::Error`，保留 `source()` 链，调用方拿到的是原始错误而非泛化文案；
//! - 区分“可在本地恢复”的 [`DataflowError::Cancelled`] 与终止性故障，阶段据此决定吞掉还是上报。

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// 跨线程共享的底层错误原因。
pub type SharedError = Arc<dyn StdError + Send + Sync + 'static>;

/// 阶段内统一使用的结果别名。
pub type Result<T, E = DataflowError> = core::result::Result<T, E>;

/// 流水线阶段的错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把“取消不是故障、其余一切都是故障”这条策略落实为类型，
///   让转换函数、下游目标与生命周期接口共享同一套错误表达；
/// - **契约 (What)**：
///   - 所有变体均为 `Clone + Send + Sync + 'static`，可安全放入 `Completion` 并被多方读取；
///   - `Transform`/`Downstream`/`Faulted` 通过 `source()` 暴露原始错误；
/// - **设计权衡 (Trade-offs)**：以 `Arc<dyn Error>` 保存原因会丢失具体类型的所有权，
///   需要具体类型时请对 [`cause`](Self::cause) 做 `downcast_ref`。
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum DataflowError {
    /// 转换函数观察到协作取消后主动退出。
    #[error("operation cancelled")]
    Cancelled,

    /// 转换函数（同步、Future 或异步流）返回的非取消错误。
    #[error("transform failed: {0}")]
    Transform(#[source] SharedError),

    /// 向下游目标投递时失败，故障会回灌到整个阶段。
    #[error("downstream target failed: {0}")]
    Downstream(#[source] SharedError),

    /// 通过 `fault` 外部注入的故障。
    #[error("stage faulted: {0}")]
    Faulted(#[source] SharedError),

    /// 构造参数不合法。
    #[error("invalid stage option `{field}`: {reason}")]
    InvalidOptions {
        field: &'static str,
        reason: String,
    },

    /// 未显式提供调度器，且当前线程不在 Tokio 运行时内。
    #[error("no task scheduler configured and no tokio runtime is active")]
    NoRuntime,

    /// 阶段的全部持有者在完成前被释放。
    #[error("stage dropped before completion")]
    StageDropped,
}

impl DataflowError {
    /// 把任意错误包装为转换失败。
    pub fn transform<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        DataflowError::Transform(Arc::new(error))
    }

    /// 把任意错误包装为下游失败。
    pub fn downstream<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        DataflowError::Downstream(Arc::new(error))
    }

    /// 把任意错误包装为外部注入的故障。
    pub fn faulted<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        DataflowError::Faulted(Arc::new(error))
    }

    /// 以文本消息构造转换失败，便于在闭包里直接返回。
    pub fn transform_msg(message: impl Into<String>) -> Self {
        DataflowError::Transform(Arc::new(Message(message.into())))
    }

    /// 以文本消息构造外部故障。
    pub fn faulted_msg(message: impl Into<String>) -> Self {
        DataflowError::Faulted(Arc::new(Message(message.into())))
    }

    /// 底层原因，可直接 `downcast_ref` 到原始错误类型。
    ///
    /// `source()` 返回的是共享外壳，其 `Display` 与 `source()` 均委托给原始错误，但无法向下转型。
    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            DataflowError::Transform(cause)
            | DataflowError::Downstream(cause)
            | DataflowError::Faulted(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }

    /// 是否为协作取消。
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DataflowError::Cancelled)
    }

    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        DataflowError::InvalidOptions {
            field,
            reason: reason.into(),
        }
    }
}

/// 纯文本错误载体，仅用于 `*_msg` 构造函数。
#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Message {}

/// TOML 配置解析与校验阶段的错误。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// TOML 文本无法解析或字段类型不匹配。
    #[error("failed to parse stage settings: {0}")]
    Parse(#[from] toml::de::Error),

    /// 字段取值越界。
    #[error("stage setting `{field}` is out of range: {reason}")]
    OutOfRange {
        field: &'static str,
        reason: String,
    },
}
