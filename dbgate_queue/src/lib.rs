//! dbgate 优先级请求队列
//!
//! 连接池饱和时请求在这里排队，拿到执行容量后按优先级和到达顺序逐个执行，
//! 并在出队时检查排队截止时间。

pub mod gate;
pub mod queue;
pub mod request;

// 导出主要类型到 crate root
pub use crate::gate::{CapacityGate, Unbounded};
pub use crate::queue::{ClearReason, QueueStats, QueueTicket, RequestQueue};
pub use crate::request::QueuedRequest;

// 预导出
pub mod prelude {
    pub use crate::gate::CapacityGate;
    pub use crate::queue::{ClearReason, RequestQueue};
}
