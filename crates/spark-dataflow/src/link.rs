//! 源端到下游目标的链接登记。

use std::fmt;
use std::sync::{Arc, Weak};

use crate::options::LinkOptions;
use crate::target::Target;

pub(crate) type LinkFilter<O> = Arc<dyn Fn(&O) -> bool + Send + Sync>;

/// 链接表中的一项。
pub(crate) struct LinkEntry<O> {
    pub(crate) id: u64,
    pub(crate) target: Arc<dyn Target<O>>,
    pub(crate) filter: Option<LinkFilter<O>>,
    pub(crate) remaining: Option<usize>,
    pub(crate) propagate_completion: bool,
}

impl<O> LinkEntry<O> {
    pub(crate) fn new(
        id: u64,
        target: Arc<dyn Target<O>>,
        filter: Option<LinkFilter<O>>,
        options: &LinkOptions,
    ) -> Self {
        Self {
            id,
            target,
            filter,
            remaining: options.max_messages,
            propagate_completion: options.propagate_completion,
        }
    }

    /// 记录一次成功投递，返回链接是否已达到投递上限。
    pub(crate) fn record_delivery(&mut self) -> bool {
        match self.remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        }
    }
}

/// 由源端实现，供 [`LinkHandle`] 在不感知输出类型的前提下解除链接。
pub(crate) trait LinkRegistry: Send + Sync {
    fn unlink(&self, id: u64) -> bool;
}

/// `link_to` 返回的链接句柄。
///
/// # 契约说明（What）
/// - 调用 [`unlink`](Self::unlink) 显式解除链接，之后的新输出不再投递到该目标；
/// - 丢弃句柄不会解除链接；
/// - 源端已释放或链接已因 `max_messages` 自动解除时，`unlink` 返回 `false`。
pub struct LinkHandle {
    registry: Weak<dyn LinkRegistry>,
    id: u64,
}

impl LinkHandle {
    pub(crate) fn new(registry: Weak<dyn LinkRegistry>, id: u64) -> Self {
        Self { registry, id }
    }

    /// 解除链接。
    pub fn unlink(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.unlink(self.id))
    }
}

impl fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkHandle").field("id", &self.id).finish()
    }
}
