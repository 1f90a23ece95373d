//! 健康检查
//!
//! 把后端可达性探测、连接池计数、排队数和近期错误率合成为一个健康状态。
//! 判定按固定的升级顺序进行，第一个命中的条件决定结果。

use crate::metrics::{PoolSnapshot, WindowMetrics};
use async_trait::async_trait;
use dbgate_config::HealthConfig;
use dbgate_core::SharedClock;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// 后端可达性探测
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// 探测成功返回 `Ok(())`，否则返回失败原因
    async fn check(&self) -> Result<(), String>;
}

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Critical => "critical",
        }
    }

    /// 是否仍可接收流量
    pub fn is_serving(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 健康快照中的连接池部分
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub waiting: usize,
    pub queue_size: usize,
}

impl From<PoolSnapshot> for PoolHealth {
    fn from(snapshot: PoolSnapshot) -> Self {
        Self {
            total: snapshot.total,
            idle: snapshot.idle,
            active: snapshot.active,
            waiting: snapshot.waiting,
            queue_size: snapshot.queued,
        }
    }
}

/// 健康快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    /// 状态
    pub status: HealthStatus,
    /// 非健康状态的原因
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// 后端是否可达
    pub database_reachable: bool,
    /// 探测耗时
    pub probe_latency_ms: u64,
    /// 连接池与队列
    pub pool: PoolHealth,
    /// 评估窗口内的请求指标
    pub metrics: WindowMetrics,
    /// 生成时间（毫秒）
    pub timestamp_ms: u64,
}

impl HealthSnapshot {
    /// 转换为 JSON
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({ "status": self.status.as_str(), "error": e.to_string() })
        })
    }

    /// 对应的 HTTP 状态码：健康与降级为 200，其余为 503
    pub fn http_status(&self) -> u16 {
        if self.status.is_serving() { 200 } else { 503 }
    }
}

/// 健康判定所需的输入
#[derive(Debug, Clone, Default)]
pub struct HealthInputs {
    /// 连接池与队列
    pub pool: PoolSnapshot,
    /// 评估窗口内的请求指标
    pub metrics: WindowMetrics,
    /// 错误率阈值
    pub max_error_rate: f64,
}

/// 健康检查器
pub struct HealthReporter {
    config: HealthConfig,
    max_queue_size: usize,
    probe: Arc<dyn HealthProbe>,
    clock: SharedClock,
}

impl HealthReporter {
    /// 创建健康检查器
    pub fn new(
        config: HealthConfig,
        max_queue_size: usize,
        probe: Arc<dyn HealthProbe>,
        clock: SharedClock,
    ) -> Self {
        Self {
            config,
            max_queue_size,
            probe,
            clock,
        }
    }

    /// 队列达到该长度即判定为严重
    pub fn critical_queue_size(&self) -> usize {
        ((self.config.critical_queue_ratio * self.max_queue_size as f64).ceil() as usize).max(1)
    }

    /// 探测后端并生成快照
    pub async fn check(&self, inputs: HealthInputs) -> HealthSnapshot {
        let started = Instant::now();
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);

        let probe_error = match tokio::time::timeout(timeout, self.probe.check()).await {
            Ok(Ok(())) => None,
            Ok(Err(reason)) => Some(reason),
            Err(_) => Some(format!("探测超时 ({}ms)", self.config.probe_timeout_ms)),
        };
        let probe_latency_ms = started.elapsed().as_millis() as u64;

        let (status, reason) = self.classify(probe_error.as_deref(), &inputs);
        match status {
            HealthStatus::Healthy => debug!(probe_latency_ms, "健康检查通过"),
            _ => warn!(%status, reason = reason.as_deref().unwrap_or_default(), "健康检查未通过"),
        }

        HealthSnapshot {
            status,
            reason,
            database_reachable: probe_error.is_none(),
            probe_latency_ms,
            pool: inputs.pool.into(),
            metrics: inputs.metrics,
            timestamp_ms: self.clock.now_ms(),
        }
    }

    /// 按升级顺序判定状态
    pub fn classify(
        &self,
        probe_error: Option<&str>,
        inputs: &HealthInputs,
    ) -> (HealthStatus, Option<String>) {
        if let Some(error) = probe_error {
            return (HealthStatus::Unhealthy, Some(format!("数据库不可达: {}", error)));
        }

        let critical = self.critical_queue_size();
        if inputs.pool.queued >= critical {
            return (
                HealthStatus::Critical,
                Some(format!(
                    "排队请求 {} 达到临界值 {} (上限 {})",
                    inputs.pool.queued, critical, self.max_queue_size
                )),
            );
        }

        if inputs.metrics.error_rate > inputs.max_error_rate {
            return (
                HealthStatus::Unhealthy,
                Some(format!(
                    "错误率 {:.1}% 超过阈值 {:.1}%",
                    inputs.metrics.error_rate * 100.0,
                    inputs.max_error_rate * 100.0
                )),
            );
        }

        if inputs.pool.waiting >= self.config.degraded_waiting_clients {
            return (
                HealthStatus::Degraded,
                Some(format!(
                    "{} 个调用方正在等待连接",
                    inputs.pool.waiting
                )),
            );
        }

        (HealthStatus::Healthy, None)
    }
}

impl fmt::Debug for HealthReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthReporter")
            .field("config", &self.config)
            .field("max_queue_size", &self.max_queue_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbgate_core::ManualClock;

    struct StaticProbe(Result<(), String>);

    #[async_trait]
    impl HealthProbe for StaticProbe {
        async fn check(&self) -> Result<(), String> {
            self.0.clone()
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl HealthProbe for HangingProbe {
        async fn check(&self) -> Result<(), String> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn reporter(probe: Arc<dyn HealthProbe>) -> HealthReporter {
        HealthReporter::new(
            HealthConfig::default(),
            100,
            probe,
            Arc::new(ManualClock::new(42)),
        )
    }

    fn healthy_probe() -> Arc<dyn HealthProbe> {
        Arc::new(StaticProbe(Ok(())))
    }

    fn inputs(queued: usize, waiting: usize, error_rate: f64) -> HealthInputs {
        HealthInputs {
            pool: PoolSnapshot {
                active: 4,
                idle: 1,
                total: 5,
                waiting,
                queued,
            },
            metrics: WindowMetrics {
                count: 100,
                error_rate,
                ..Default::default()
            },
            max_error_rate: 0.05,
        }
    }

    #[test]
    fn test_critical_queue_size() {
        assert_eq!(reporter(healthy_probe()).critical_queue_size(), 90);
    }

    #[test]
    fn test_escalation_order() {
        let reporter = reporter(healthy_probe());

        // 不可达优先于一切
        let (status, reason) = reporter.classify(Some("connection refused"), &inputs(95, 10, 0.5));
        assert_eq!(status, HealthStatus::Unhealthy);
        assert!(reason.unwrap().contains("connection refused"));

        // 队列临界优先于错误率
        let (status, _) = reporter.classify(None, &inputs(90, 10, 0.5));
        assert_eq!(status, HealthStatus::Critical);

        let (status, _) = reporter.classify(None, &inputs(89, 10, 0.5));
        assert_eq!(status, HealthStatus::Unhealthy);

        let (status, reason) = reporter.classify(None, &inputs(0, 5, 0.05));
        assert_eq!(status, HealthStatus::Degraded);
        assert!(reason.is_some());

        let (status, reason) = reporter.classify(None, &inputs(0, 4, 0.0));
        assert_eq!(status, HealthStatus::Healthy);
        assert!(reason.is_none());
    }

    #[tokio::test]
    async fn test_check_healthy_snapshot() {
        let snapshot = reporter(healthy_probe()).check(inputs(0, 0, 0.0)).await;

        assert_eq!(snapshot.status, HealthStatus::Healthy);
        assert!(snapshot.database_reachable);
        assert_eq!(snapshot.http_status(), 200);
        assert_eq!(snapshot.pool.total, 5);
        assert_eq!(snapshot.timestamp_ms, 42);

        let json = snapshot.to_json();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["pool"]["queue_size"], 0);
        assert!(json.get("reason").is_none());
    }

    #[tokio::test]
    async fn test_probe_failure_is_unhealthy() {
        let probe: Arc<dyn HealthProbe> = Arc::new(StaticProbe(Err("auth failed".to_string())));
        let snapshot = reporter(probe).check(inputs(0, 0, 0.0)).await;

        assert_eq!(snapshot.status, HealthStatus::Unhealthy);
        assert!(!snapshot.database_reachable);
        assert_eq!(snapshot.http_status(), 503);
        assert_eq!(snapshot.to_json()["status"], "unhealthy");
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_is_unhealthy() {
        let snapshot = reporter(Arc::new(HangingProbe)).check(inputs(0, 0, 0.0)).await;

        assert_eq!(snapshot.status, HealthStatus::Unhealthy);
        assert!(snapshot.reason.unwrap().contains("5000ms"));
        assert_eq!(snapshot.probe_latency_ms, 5_000);
    }

    #[tokio::test]
    async fn test_degraded_still_serves() {
        let snapshot = reporter(healthy_probe()).check(inputs(0, 7, 0.0)).await;
        assert_eq!(snapshot.status, HealthStatus::Degraded);
        assert_eq!(snapshot.http_status(), 200);
    }
}
