#![deny(unsafe_code)]
#![doc = "spark-dataflow: 有界、异步、可选保序的 transform-many 流水线阶段。"]
#![doc = ""]
#![doc = "== 教案式说明 =="]
#![doc = "- 意图 (Why): 为数据处理管线提供一个可背压、可并行、可保序的基础阶段，"]
#![doc = "  上游通过 `offer`/`send` 投递，下游通过链接推送或主动拉取。"]
#![doc = "- 逻辑 (How): 输入侧负责准入与并行调度，重排缓冲恢复准入顺序，输出侧负责缓冲与投递；"]
#![doc = "  三者共享一个原子容量计数器，输出被移除时归还单位，从而把下游消费速度传导回上游。"]
#![doc = "- 契约 (What): 取消不是故障；其余任何转换错误或下游错误都使阶段进入故障态，"]
#![doc = "  排队输入被丢弃，`Completion` 以第一个故障结束。"]

mod bounding;
mod cancellation;
mod completion;
mod error;
mod link;
mod options;
mod reorder;
mod scheduler;
mod source;
mod stage;
mod target;
mod transform;

pub use bounding::{BoundingCounter, BoundingDecision};
pub use cancellation::{CancellationRegistration, CancellationToken};
pub use completion::Completion;
pub use error::{ConfigError, DataflowError, Result, SharedError};
pub use link::LinkHandle;
pub use options::{LinkOptions, StageOptions, StageSettings};
pub use reorder::{FastPath, ReorderEntry, ReorderingBuffer};
pub use scheduler::{TaskScheduler, TokioScheduler};
pub use stage::{StageMetrics, TransformManyStage};
pub use target::{Admission, Target};
pub use transform::Transform;
