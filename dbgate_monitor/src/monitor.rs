//! 性能监控
//!
//! 组合指标记录器与告警引擎：先记录，再同步评估。启动时创建一份，
//! 通过 `Arc` 在各处共享。

use crate::alerts::{Alert, AlertEngine};
use crate::metrics::{Metadata, MetricsRecorder, PoolSnapshot, WindowMetrics};
use dbgate_config::MonitorConfig;
use dbgate_core::SharedClock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 性能监控器
#[derive(Debug)]
pub struct PerformanceMonitor {
    recorder: Arc<MetricsRecorder>,
    alerts: AlertEngine,
    evaluation_window_ms: u64,
    cleanup_interval_ms: u64,
}

impl PerformanceMonitor {
    /// 创建监控器
    pub fn new(config: &MonitorConfig, clock: SharedClock) -> Self {
        Self {
            recorder: Arc::new(MetricsRecorder::new(config, Arc::clone(&clock))),
            alerts: AlertEngine::new(config, clock),
            evaluation_window_ms: config.evaluation_window_ms,
            cleanup_interval_ms: config.cleanup_interval_ms,
        }
    }

    /// 指标记录器
    pub fn recorder(&self) -> &Arc<MetricsRecorder> {
        &self.recorder
    }

    /// 告警引擎
    pub fn alerts(&self) -> &AlertEngine {
        &self.alerts
    }

    /// 告警评估窗口
    pub fn evaluation_window_ms(&self) -> u64 {
        self.evaluation_window_ms
    }

    /// 记录请求并评估请求类告警
    pub fn record_request(
        &self,
        label: impl Into<String>,
        duration_ms: f64,
        success: bool,
        metadata: Metadata,
    ) -> Vec<Alert> {
        let metric = self
            .recorder
            .record_request(label, duration_ms, success, metadata);
        let window = self.recorder.get_metrics(self.evaluation_window_ms);
        self.alerts.evaluate_request(&metric, &window)
    }

    /// 更新连接池快照并评估连接池类告警
    pub fn update_connection_pool_metrics(&self, snapshot: PoolSnapshot) -> Vec<Alert> {
        self.recorder.update_connection_pool_metrics(snapshot);
        self.alerts.evaluate_pool(&snapshot)
    }

    /// 窗口聚合
    pub fn get_metrics(&self, window_ms: u64) -> WindowMetrics {
        self.recorder.get_metrics(window_ms)
    }

    /// 评估窗口内的聚合
    pub fn evaluation_metrics(&self) -> WindowMetrics {
        self.recorder.get_metrics(self.evaluation_window_ms)
    }

    /// 启动过期指标清理任务
    pub fn spawn_cleanup_task(&self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let interval = Duration::from_millis(self.cleanup_interval_ms.max(1));
        self.recorder.spawn_cleanup_task(interval, token)
    }
}
