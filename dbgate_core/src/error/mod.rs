//! 准入控制层统一错误处理
//!
//! 所有排队、超时、停机相关的失败都以类型化错误返回给调用方，
//! 后端驱动的原始错误不会越过准入层。

pub mod context;
pub mod framework;

// 重新导出主要类型
pub use context::ErrorContext;
pub use framework::{AdmissionError, AdmissionErrorKind};

/// dbgate 统一 Result 类型
pub type Result<T> = std::result::Result<T, AdmissionError>;

/// 后端返回的装箱错误
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
