//! dbgate 监控
//!
//! 请求指标、阈值告警和健康检查。

pub mod alerts;
pub mod health;
pub mod metrics;
pub mod monitor;

// 导出主要类型到 crate root
pub use crate::alerts::{
    Alert, AlertEngine, AlertListener, AlertSeverity, AlertThresholdsUpdate, AlertType,
    SubscriptionId,
};
pub use crate::health::{
    HealthInputs, HealthProbe, HealthReporter, HealthSnapshot, HealthStatus, PoolHealth,
};
pub use crate::metrics::{
    LabelMetrics, Metadata, MetricsRecorder, PoolSnapshot, RequestMetric, WindowMetrics,
    percentile,
};
pub use crate::monitor::PerformanceMonitor;

// 预导出
pub mod prelude {
    pub use crate::alerts::{Alert, AlertThresholdsUpdate, AlertType};
    pub use crate::health::{HealthProbe, HealthStatus};
    pub use crate::monitor::PerformanceMonitor;
}
