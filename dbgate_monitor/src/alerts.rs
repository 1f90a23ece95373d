//! 阈值告警
//!
//! 每次记录请求或更新连接池快照时同步评估规则。每种告警类型有独立的冷却期，
//! 冷却期内的重复告警只计数不发送。

use crate::metrics::{PoolSnapshot, RequestMetric, WindowMetrics};
use dbgate_config::{AlertThresholds, MonitorConfig};
use dbgate_core::SharedClock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, warn};

/// 告警类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// 错误率过高
    HighErrorRate,
    /// 响应过慢
    SlowResponse,
    /// 活跃连接过多
    ConnectionSaturation,
    /// 排队请求过多
    QueueBacklog,
    /// 吞吐量过低
    LowThroughput,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::HighErrorRate => "high_error_rate",
            AlertType::SlowResponse => "slow_response",
            AlertType::ConnectionSaturation => "connection_saturation",
            AlertType::QueueBacklog => "queue_backlog",
            AlertType::LowThroughput => "low_throughput",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 告警级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// 告警
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    /// 告警类型
    pub alert_type: AlertType,
    /// 级别
    pub severity: AlertSeverity,
    /// 描述
    pub message: String,
    /// 触发时的观测值
    pub current_value: f64,
    /// 阈值
    pub threshold_value: f64,
    /// 触发时间（毫秒）
    pub timestamp_ms: u64,
}

/// 阈值的部分更新，未设置的字段保持原值
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholdsUpdate {
    pub max_error_rate: Option<f64>,
    pub max_response_time_ms: Option<f64>,
    pub max_active_connections: Option<usize>,
    pub max_queued_requests: Option<usize>,
    pub min_throughput: Option<f64>,
}

impl AlertThresholdsUpdate {
    /// 合并到已有阈值
    pub fn apply_to(&self, thresholds: &mut AlertThresholds) {
        if let Some(value) = self.max_error_rate {
            thresholds.max_error_rate = value;
        }
        if let Some(value) = self.max_response_time_ms {
            thresholds.max_response_time_ms = value;
        }
        if let Some(value) = self.max_active_connections {
            thresholds.max_active_connections = value;
        }
        if let Some(value) = self.max_queued_requests {
            thresholds.max_queued_requests = value;
        }
        if let Some(value) = self.min_throughput {
            thresholds.min_throughput = value;
        }
    }
}

/// 订阅 ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionId(u64);

/// 告警监听器
pub type AlertListener = Arc<dyn Fn(&Alert) + Send + Sync>;

/// 告警引擎
pub struct AlertEngine {
    clock: SharedClock,
    cooldown_ms: u64,
    history_limit: usize,
    retention_ms: u64,
    thresholds: RwLock<AlertThresholds>,
    last_fired: Mutex<HashMap<AlertType, u64>>,
    history: Mutex<VecDeque<Alert>>,
    listeners: RwLock<Vec<(SubscriptionId, AlertListener)>>,
    next_subscription: AtomicU64,
    suppressed: AtomicU64,
}

impl AlertEngine {
    /// 创建告警引擎
    pub fn new(config: &MonitorConfig, clock: SharedClock) -> Self {
        Self {
            clock,
            cooldown_ms: config.alert_cooldown_ms,
            history_limit: config.alert_history_limit,
            retention_ms: config.retention_ms,
            thresholds: RwLock::new(config.thresholds.clone()),
            last_fired: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            listeners: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            suppressed: AtomicU64::new(0),
        }
    }

    /// 当前阈值
    pub fn thresholds(&self) -> AlertThresholds {
        self.thresholds
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 合并部分阈值，返回合并后的结果
    pub fn set_thresholds(&self, update: &AlertThresholdsUpdate) -> AlertThresholds {
        let mut thresholds = self.thresholds.write().unwrap_or_else(PoisonError::into_inner);
        update.apply_to(&mut thresholds);
        debug!(?thresholds, "告警阈值已更新");
        thresholds.clone()
    }

    /// 评估请求类规则：错误率、响应时间、吞吐量
    pub fn evaluate_request(&self, metric: &RequestMetric, window: &WindowMetrics) -> Vec<Alert> {
        let thresholds = self.thresholds();
        let mut fired = Vec::new();

        if window.count > 0 && window.error_rate > thresholds.max_error_rate {
            fired.extend(self.emit(
                AlertType::HighErrorRate,
                AlertSeverity::Critical,
                format!(
                    "错误率 {:.1}% 超过阈值 {:.1}%",
                    window.error_rate * 100.0,
                    thresholds.max_error_rate * 100.0
                ),
                window.error_rate,
                thresholds.max_error_rate,
            ));
        }

        let slowest = metric.duration_ms.max(window.average_duration_ms);
        if slowest > thresholds.max_response_time_ms {
            fired.extend(self.emit(
                AlertType::SlowResponse,
                AlertSeverity::Warning,
                format!(
                    "{} 耗时 {:.0}ms 超过阈值 {:.0}ms",
                    metric.label, slowest, thresholds.max_response_time_ms
                ),
                slowest,
                thresholds.max_response_time_ms,
            ));
        }

        if thresholds.min_throughput > 0.0 && window.throughput < thresholds.min_throughput {
            fired.extend(self.emit(
                AlertType::LowThroughput,
                AlertSeverity::Warning,
                format!(
                    "吞吐量 {:.2}/s 低于阈值 {:.2}/s",
                    window.throughput, thresholds.min_throughput
                ),
                window.throughput,
                thresholds.min_throughput,
            ));
        }

        fired
    }

    /// 评估连接池类规则：活跃连接数、排队数
    pub fn evaluate_pool(&self, snapshot: &PoolSnapshot) -> Vec<Alert> {
        let thresholds = self.thresholds();
        let mut fired = Vec::new();

        if snapshot.active > thresholds.max_active_connections {
            fired.extend(self.emit(
                AlertType::ConnectionSaturation,
                AlertSeverity::Critical,
                format!(
                    "活跃连接 {} 超过阈值 {}",
                    snapshot.active, thresholds.max_active_connections
                ),
                snapshot.active as f64,
                thresholds.max_active_connections as f64,
            ));
        }

        if snapshot.queued > thresholds.max_queued_requests {
            fired.extend(self.emit(
                AlertType::QueueBacklog,
                AlertSeverity::Critical,
                format!(
                    "排队请求 {} 超过阈值 {}",
                    snapshot.queued, thresholds.max_queued_requests
                ),
                snapshot.queued as f64,
                thresholds.max_queued_requests as f64,
            ));
        }

        fired
    }

    fn emit(
        &self,
        alert_type: AlertType,
        severity: AlertSeverity,
        message: String,
        current_value: f64,
        threshold_value: f64,
    ) -> Option<Alert> {
        let now = self.clock.now_ms();

        {
            let mut last_fired = self.last_fired.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(&last) = last_fired.get(&alert_type)
                && now.saturating_sub(last) < self.cooldown_ms
            {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                debug!(%alert_type, "告警处于冷却期，已抑制");
                return None;
            }
            last_fired.insert(alert_type, now);
        }

        let alert = Alert {
            alert_type,
            severity,
            message,
            current_value,
            threshold_value,
            timestamp_ms: now,
        };
        warn!(
            %alert_type,
            ?severity,
            current_value,
            threshold_value,
            "{}",
            alert.message
        );

        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            history.push_back(alert.clone());
            let cutoff = now.saturating_sub(self.retention_ms);
            while history.len() > self.history_limit
                || history.front().is_some_and(|a| a.timestamp_ms < cutoff)
            {
                history.pop_front();
            }
        }

        // 先复制监听器列表，监听器内可以再订阅或退订
        let listeners: Vec<AlertListener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&alert);
        }

        Some(alert)
    }

    /// 订阅告警
    pub fn subscribe<L>(&self, listener: L) -> SubscriptionId
    where
        L: Fn(&Alert) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// 取消订阅，返回是否存在该订阅
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// 最近 `window_ms` 内触发的告警
    pub fn recent_alerts(&self, window_ms: u64) -> Vec<Alert> {
        let start = self.clock.now_ms().saturating_sub(window_ms);
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|a| a.timestamp_ms >= start)
            .cloned()
            .collect()
    }

    /// 因冷却被抑制的告警数量
    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for AlertEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertEngine")
            .field("cooldown_ms", &self.cooldown_ms)
            .field("thresholds", &self.thresholds())
            .field("suppressed", &self.suppressed_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metadata;
    use dbgate_core::ManualClock;

    fn engine(cooldown_ms: u64) -> (AlertEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = MonitorConfig {
            alert_cooldown_ms: cooldown_ms,
            alert_history_limit: 10,
            ..Default::default()
        };
        (AlertEngine::new(&config, clock.clone()), clock)
    }

    fn metric(duration_ms: f64, success: bool) -> RequestMetric {
        RequestMetric {
            label: "messages.list".to_string(),
            duration_ms,
            success,
            timestamp_ms: 1_000_000,
            metadata: Metadata::new(),
        }
    }

    fn window(count: usize, error_rate: f64) -> WindowMetrics {
        WindowMetrics {
            window_ms: 60_000,
            count,
            error_rate,
            average_duration_ms: 5.0,
            throughput: count as f64 / 60.0,
            ..Default::default()
        }
    }

    fn saturated() -> PoolSnapshot {
        PoolSnapshot {
            active: 25,
            total: 25,
            ..Default::default()
        }
    }

    #[test]
    fn test_error_rate_rule() {
        let (engine, _clock) = engine(300_000);
        assert!(engine.evaluate_request(&metric(5.0, true), &window(10, 0.05)).is_empty());

        let fired = engine.evaluate_request(&metric(5.0, false), &window(10, 0.2));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].alert_type, AlertType::HighErrorRate);
        assert_eq!(fired[0].severity, AlertSeverity::Critical);
        assert_eq!(fired[0].current_value, 0.2);
    }

    #[test]
    fn test_slow_response_rule() {
        let (engine, _clock) = engine(300_000);
        let fired = engine.evaluate_request(&metric(1_500.0, true), &window(1, 0.0));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].alert_type, AlertType::SlowResponse);
        assert_eq!(fired[0].severity, AlertSeverity::Warning);
        assert_eq!(fired[0].threshold_value, 1_000.0);
    }

    #[test]
    fn test_pool_rules() {
        let (engine, _clock) = engine(300_000);
        let fired = engine.evaluate_pool(&PoolSnapshot {
            active: 19,
            queued: 51,
            ..Default::default()
        });
        let types: Vec<AlertType> = fired.iter().map(|a| a.alert_type).collect();
        assert_eq!(
            types,
            vec![AlertType::ConnectionSaturation, AlertType::QueueBacklog]
        );

        // 等于阈值不触发
        let (engine, _clock) = self::engine(300_000);
        assert!(
            engine
                .evaluate_pool(&PoolSnapshot {
                    active: 18,
                    queued: 50,
                    ..Default::default()
                })
                .is_empty()
        );
    }

    #[test]
    fn test_throughput_rule_disabled_by_zero() {
        let (engine, _clock) = engine(300_000);
        assert!(engine.evaluate_request(&metric(1.0, true), &window(0, 0.0)).is_empty());

        engine.set_thresholds(&AlertThresholdsUpdate {
            min_throughput: Some(1.0),
            ..Default::default()
        });
        let fired = engine.evaluate_request(&metric(1.0, true), &window(6, 0.0));
        assert_eq!(fired[0].alert_type, AlertType::LowThroughput);
    }

    #[test]
    fn test_cooldown_per_type() {
        let (engine, clock) = engine(300_000);

        let mut emitted = 0;
        for _ in 0..100 {
            emitted += engine.evaluate_pool(&saturated()).len();
        }
        assert_eq!(emitted, 1);
        assert_eq!(engine.suppressed_count(), 99);

        // 其他类型不受影响
        let fired = engine.evaluate_request(&metric(5.0, false), &window(1, 1.0));
        assert_eq!(fired.len(), 1);

        clock.advance(299_999);
        assert!(engine.evaluate_pool(&saturated()).is_empty());
        clock.advance(1);
        assert_eq!(engine.evaluate_pool(&saturated()).len(), 1);
    }

    #[test]
    fn test_threshold_merge() {
        let (engine, _clock) = engine(300_000);
        let merged = engine.set_thresholds(&AlertThresholdsUpdate {
            max_error_rate: Some(0.1),
            ..Default::default()
        });

        assert_eq!(merged.max_error_rate, 0.1);
        assert_eq!(merged.max_response_time_ms, 1_000.0);
        assert_eq!(merged.max_active_connections, 18);
        assert_eq!(merged.max_queued_requests, 50);
        assert_eq!(engine.thresholds(), merged);
    }

    #[test]
    fn test_threshold_update_from_json() {
        let update: AlertThresholdsUpdate =
            serde_json::from_str(r#"{"max_queued_requests": 5}"#).unwrap();
        assert_eq!(update.max_queued_requests, Some(5));
        assert_eq!(update.max_error_rate, None);
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let (engine, clock) = engine(1_000);
        let received = Arc::new(Mutex::new(Vec::new()));

        let id = {
            let received = Arc::clone(&received);
            engine.subscribe(move |alert: &Alert| {
                received.lock().unwrap().push(alert.alert_type);
            })
        };

        engine.evaluate_pool(&saturated());
        assert_eq!(*received.lock().unwrap(), vec![AlertType::ConnectionSaturation]);

        assert!(engine.unsubscribe(id));
        assert!(!engine.unsubscribe(id));

        clock.advance(1_000);
        assert_eq!(engine.evaluate_pool(&saturated()).len(), 1);
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_recent_alerts_and_history_limit() {
        let (engine, clock) = engine(0);
        for _ in 0..15 {
            engine.evaluate_pool(&saturated());
            clock.advance(10);
        }

        assert_eq!(engine.recent_alerts(1_000_000).len(), 10);
        assert_eq!(engine.recent_alerts(25).len(), 2);
    }
}
