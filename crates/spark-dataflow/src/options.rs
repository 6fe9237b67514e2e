//! 阶段与链接的构造选项。
//!
//! # 教案级说明
//! - **Why**：并行度、有界容量、保序与取消令牌决定了阶段的全部调度行为，必须在构造期一次性确定；
//! - **How**：[`StageOptions`] 以链式方法构建，[`StageSettings`] 则承载可从 TOML 读取的纯数据部分，
//!   两者通过 [`StageSettings::into_options`] 合流；
//! - **What**：所有入口都会经过 [`StageOptions::validate`]，非法取值在构造期报错而不是运行期静默修正。

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::cancellation::CancellationToken;
use crate::error::{ConfigError, DataflowError, Result};
use crate::scheduler::TaskScheduler;

/// 流水线阶段的运行选项。
///
/// # 契约说明（What）
/// - `degree_of_parallelism`：同时执行的转换调用上限，默认 1，必须 ≥ 1；
/// - `bounded_capacity`：阶段内条目上限，`None` 表示不限，`Some(0)` 非法；
/// - `ensure_ordered`：并行度 > 1 时是否按入队顺序输出，默认 `true`；
/// - `cancellation`：协作取消令牌，取消即“完成并丢弃排队输入”；
/// - `scheduler`：任务执行器，`None` 时在构造期捕获当前 Tokio 运行时；
/// - `name`：日志与 `Display` 中使用的阶段名。
#[derive(Clone)]
pub struct StageOptions {
    pub degree_of_parallelism: usize,
    pub bounded_capacity: Option<usize>,
    pub ensure_ordered: bool,
    pub cancellation: CancellationToken,
    pub scheduler: Option<Arc<dyn TaskScheduler>>,
    pub name: Option<String>,
}

impl StageOptions {
    /// 以默认值构造选项。
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置并行度。
    pub fn with_degree_of_parallelism(mut self, degree: usize) -> Self {
        self.degree_of_parallelism = degree;
        self
    }

    /// 设置有界容量。
    pub fn with_bounded_capacity(mut self, capacity: usize) -> Self {
        self.bounded_capacity = Some(capacity);
        self
    }

    /// 设置是否保序。
    pub fn with_ensure_ordered(mut self, ensure_ordered: bool) -> Self {
        self.ensure_ordered = ensure_ordered;
        self
    }

    /// 绑定取消令牌。
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// 指定任务执行器。
    pub fn with_scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// 设置阶段名。
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// 校验取值范围。
    pub fn validate(&self) -> Result<()> {
        if self.degree_of_parallelism == 0 {
            return Err(DataflowError::invalid(
                "degree_of_parallelism",
                "must be at least 1",
            ));
        }
        if self.bounded_capacity == Some(0) {
            return Err(DataflowError::invalid(
                "bounded_capacity",
                "must be at least 1 when set",
            ));
        }
        Ok(())
    }

    /// 是否需要重排缓冲：仅在并行且要求保序时启用。
    pub(crate) fn requires_reordering(&self) -> bool {
        self.ensure_ordered && self.degree_of_parallelism > 1
    }

    /// 多个 worker 并发写入输出且不保序时，需要串行化每条消息的输出枚举。
    pub(crate) fn requires_parallel_source_lock(&self) -> bool {
        !self.ensure_ordered && self.degree_of_parallelism > 1
    }
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            degree_of_parallelism: 1,
            bounded_capacity: None,
            ensure_ordered: true,
            cancellation: CancellationToken::new(),
            scheduler: None,
            name: None,
        }
    }
}

impl fmt::Debug for StageOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageOptions")
            .field("degree_of_parallelism", &self.degree_of_parallelism)
            .field("bounded_capacity", &self.bounded_capacity)
            .field("ensure_ordered", &self.ensure_ordered)
            .field("cancellation", &self.cancellation)
            .field("scheduler", &self.scheduler.as_ref().map(|_| "custom"))
            .field("name", &self.name)
            .finish()
    }
}

/// 可从配置文件读取的阶段设置。
///
/// # 设计背景（Why）
/// - 取消令牌与调度器是运行期对象，无法写进配置；其余纯数据字段交由运维在 TOML 中调整。
///
/// # 契约说明（What）
/// - 未出现的字段取 [`StageOptions::default`] 中的默认值；
/// - 未知字段直接报错，避免拼写错误被静默忽略。
///
/// ```toml
/// name = "enrich"
/// degree_of_parallelism = 4
/// bounded_capacity = 128
/// ensure_ordered = true
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StageSettings {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub degree_of_parallelism: Option<usize>,
    #[serde(default)]
    pub bounded_capacity: Option<usize>,
    #[serde(default)]
    pub ensure_ordered: Option<bool>,
}

impl StageSettings {
    /// 解析 TOML 文本并校验取值范围。
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: StageSettings = toml::from_str(text)?;
        if settings.degree_of_parallelism == Some(0) {
            return Err(ConfigError::OutOfRange {
                field: "degree_of_parallelism",
                reason: "must be at least 1".to_owned(),
            });
        }
        if settings.bounded_capacity == Some(0) {
            return Err(ConfigError::OutOfRange {
                field: "bounded_capacity",
                reason: "must be at least 1; omit the key for an unbounded stage".to_owned(),
            });
        }
        Ok(settings)
    }

    /// 把设置叠加到一组基础选项上，保留其中的取消令牌与调度器。
    pub fn apply_to(&self, mut base: StageOptions) -> StageOptions {
        if let Some(name) = &self.name {
            base.name = Some(name.clone());
        }
        if let Some(degree) = self.degree_of_parallelism {
            base.degree_of_parallelism = degree;
        }
        if let Some(capacity) = self.bounded_capacity {
            base.bounded_capacity = Some(capacity);
        }
        if let Some(ordered) = self.ensure_ordered {
            base.ensure_ordered = ordered;
        }
        base
    }

    /// 以默认选项为基础生成 [`StageOptions`]。
    pub fn into_options(self) -> StageOptions {
        self.apply_to(StageOptions::default())
    }
}

/// 链接选项，对应下游目标注册时的投递策略。
///
/// - `propagate_completion`：源完成或故障时同步调用目标的 `complete`/`fault`；
/// - `max_messages`：投递指定条数后自动解除链接，`None` 表示不限；
/// - `append`：`true` 追加到链接表尾部，`false` 插入头部优先投递。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkOptions {
    pub propagate_completion: bool,
    pub max_messages: Option<usize>,
    pub append: bool,
}

impl LinkOptions {
    /// 传播完成信号的常用配置。
    pub fn propagate() -> Self {
        Self {
            propagate_completion: true,
            ..Self::default()
        }
    }

    /// 设置最大投递条数。
    pub fn with_max_messages(mut self, max: usize) -> Self {
        self.max_messages = Some(max);
        self
    }

    /// 插入链接表头部。
    pub fn prepend(mut self) -> Self {
        self.append = false;
        self
    }
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            propagate_completion: false,
            max_messages: None,
            append: true,
        }
    }
}
