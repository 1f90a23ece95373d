//! dbgate 核心类型
//!
//! 提供错误分类、时钟抽象和请求状态机，供其余 crate 共享使用。

pub mod clock;
pub mod error;
pub mod state;

// 导出主要类型到 crate root
pub use crate::clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use crate::error::{AdmissionError, AdmissionErrorKind, BoxError, ErrorContext, Result};
pub use crate::state::RequestState;

// 预导出
pub mod prelude {
    pub use crate::clock::{Clock, SharedClock};
    pub use crate::error::{AdmissionError, AdmissionErrorKind, Result};
    pub use crate::state::RequestState;
}
