//! # dbgate - 数据库访问的有界准入控制层
//!
//! dbgate 位于聊天后端的请求处理与数据库之间，约束同时占用的后端连接数。
//! 连接池饱和时请求按优先级排队，超过截止时间的请求直接拒绝；每个请求的
//! 结果都会记入指标，并在越过阈值时触发告警。
//!
//! ## 特性
//!
//! - 有界连接池：建连重试、空闲回收、获取超时
//! - 优先级请求队列：容量上限、排队超时、逐个执行
//! - 滑动窗口指标：错误率、P95/P99、吞吐量
//! - 按类型冷却的阈值告警
//! - 分级健康检查
//! - 优雅停机
//!
//! ## 快速开始
//!
//! ```rust,no_run,ignore
//! use dbgate::{AdmissionBuilder, QueryOptions};
//!
//! #[tokio::main]
//! async fn main() -> dbgate::Result<()> {
//!     let controller = AdmissionBuilder::from_config_file("dbgate.toml")?
//!         .build(MyFactory::new())?;
//!     controller.start().await;
//!
//!     let rows = controller
//!         .query("SELECT * FROM messages WHERE room = $1", vec![room.into()], QueryOptions::new().priority(5))
//!         .await?;
//!
//!     controller.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## 模块组织
//!
//! ### 配置模块
//! - AdmissionConfig - 准入控制总配置
//!
//! ### 核心模块
//! - AdmissionError - 错误分类
//! - Clock - 时间源抽象
//!
//! ### 连接池模块
//! - ConnectionPool - 有界连接池
//! - ConnectionFactory - 连接工厂
//!
//! ### 队列模块
//! - RequestQueue - 优先级请求队列
//!
//! ### 监控模块
//! - PerformanceMonitor - 指标与告警
//! - HealthReporter - 健康检查

pub mod admission;

pub use crate::admission::{
    AdmissionBuilder, AdmissionController, FactoryProbe, LifecycleState, PoolGate, QueryOptions,
    ShutdownCoordinator, ShutdownReport,
};

// ============================================================================
// Crate Re-exports (for advanced users)
// ============================================================================

pub use dbgate_config;
pub use dbgate_core;
pub use dbgate_monitor;
pub use dbgate_pool;
pub use dbgate_queue;

pub use dbgate_config::AdmissionConfig;
pub use dbgate_core::{AdmissionError, AdmissionErrorKind};

// ============================================================================
// Prelude Module
// ============================================================================

/// 预导出常用类型
///
/// 通过 `use dbgate::prelude::*;` 导入所有常用类型
pub mod prelude {
    pub use dbgate_config::{AdmissionConfig, ConfigError};
    pub use dbgate_core::prelude::*;
    pub use dbgate_monitor::prelude::*;
    pub use dbgate_pool::prelude::*;

    pub use crate::admission::{
        AdmissionBuilder, AdmissionController, LifecycleState, QueryOptions, ShutdownReport,
    };
}

// ============================================================================
// Error Types
// ============================================================================

/// dbgate 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;

/// dbgate 统一错误枚举
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// 准入错误
    #[error(transparent)]
    Admission(#[from] dbgate_core::AdmissionError),

    /// 配置错误
    #[error(transparent)]
    Config(#[from] dbgate_config::ConfigError),

    /// 自定义错误
    #[error("{0}")]
    Custom(String),
}

impl Error {
    /// 映射到 HTTP 状态码
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Admission(err) => err.http_status(),
            Error::Config(_) | Error::Custom(_) => 500,
        }
    }
}

// ============================================================================
// Version Information
// ============================================================================

/// dbgate 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// dbgate 包名
pub const NAME: &str = env!("CARGO_PKG_NAME");
