//! 有界容量记账。
//!
//! # 教案级说明
//! - **Why**：Target 与 Source 共享同一个“阶段内条目数”计数器，入队时预占、输出被取走时归还，
//!   上游背压因此随下游消费而释放；
//! - **How**：计数器仅是一个原子整数，预占走 CAS 循环，归还走 `fetch_sub`，不引入额外锁；
//! - **What**：计数器在任何可观察时刻都不为负；一个输入的单个预占单位在完成时被换算为 N 个输出单位
//!   （差值 N−1，N 为 0 时整体归还 1）。

#[cfg(not(spark_loom))]
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(spark_loom)]
use loom::sync::atomic::{AtomicUsize, Ordering};

/// 预占结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundingDecision {
    /// 预占成功，携带预占后的计数。
    Granted { count: usize },
    /// 已达上限，携带当前计数。
    Full { count: usize },
}

impl BoundingDecision {
    /// 是否预占成功。
    pub fn is_granted(&self) -> bool {
        matches!(self, BoundingDecision::Granted { .. })
    }
}

/// 阶段共享的有界容量计数器。
///
/// # 契约说明（What）
/// - `capacity == None` 表示不限容量，`try_reserve` 恒成功但仍然计数，便于指标观测；
/// - `release` 的总量永远不超过此前 `try_reserve` 与 `expand` 的总量，违反时在调试构建中断言失败。
///
/// # 风险提示（Trade-offs）
/// - `expand` 不检查上限：输出扩张可能让计数暂时超过容量，此时入口持续返回 `Full`，
///   直到下游消费把计数降回容量以下。
#[derive(Debug)]
pub struct BoundingCounter {
    count: AtomicUsize,
    capacity: Option<usize>,
}

impl BoundingCounter {
    /// 以给定容量创建计数器。
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            count: AtomicUsize::new(0),
            capacity,
        }
    }

    /// 配置的容量上限。
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// 当前计数。
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// 是否已达到上限。
    pub fn is_full(&self) -> bool {
        match self.capacity {
            Some(capacity) => self.count() >= capacity,
            None => false,
        }
    }

    /// 尝试为一条输入消息预占一个单位。
    pub fn try_reserve(&self) -> BoundingDecision {
        let mut current = self.count.load(Ordering::Acquire);
        loop {
            if let Some(capacity) = self.capacity
                && current >= capacity
            {
                return BoundingDecision::Full { count: current };
            }
            match self.count.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return BoundingDecision::Granted { count: current + 1 },
                Err(actual) => current = actual,
            }
        }
    }

    /// 追加 `amount` 个单位，用于一条输入扩张为多条输出。
    pub fn expand(&self, amount: usize) {
        if amount > 0 {
            self.count.fetch_add(amount, Ordering::AcqRel);
        }
    }

    /// 归还 `amount` 个单位，返回归还后的计数。
    pub fn release(&self, amount: usize) -> usize {
        if amount == 0 {
            return self.count();
        }
        let previous = self.count.fetch_sub(amount, Ordering::AcqRel);
        debug_assert!(
            previous >= amount,
            "bounding count underflow: releasing {amount} from {previous}"
        );
        previous - amount
    }

    /// 按“输入 1 单位 → 输出 `produced` 单位”的规则结算一条已完成的消息。
    ///
    /// - `produced == 0`：归还输入占用的单位；
    /// - `produced >= 1`：第一条输出沿用输入的单位，其余 `produced - 1` 条追加。
    pub fn settle(&self, produced: usize) {
        match produced {
            0 => {
                self.release(1);
            }
            n => self.expand(n - 1),
        }
    }
}
