//! 请求指标记录
//!
//! 按时间顺序保存每次请求的耗时与结果，按窗口聚合出错误率、分位数和吞吐量。
//! 连接池构成只保留最新一份快照。

use dbgate_config::MonitorConfig;
use dbgate_core::SharedClock;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 请求元数据
pub type Metadata = BTreeMap<String, Value>;

/// 单次请求指标
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestMetric {
    /// 操作标签
    pub label: String,
    /// 耗时（毫秒）
    pub duration_ms: f64,
    /// 是否成功
    pub success: bool,
    /// 记录时间（毫秒）
    pub timestamp_ms: u64,
    /// 附加信息，例如优先级、是否排队、错误类型
    pub metadata: Metadata,
}

/// 连接池构成快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    /// 借出连接数
    pub active: usize,
    /// 空闲连接数
    pub idle: usize,
    /// 存活连接数
    pub total: usize,
    /// 等待连接的调用方
    pub waiting: usize,
    /// 排队请求数
    pub queued: usize,
}

/// 单个标签的窗口统计
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LabelMetrics {
    pub count: usize,
    pub failure_count: usize,
    pub average_duration_ms: f64,
}

/// 窗口聚合结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowMetrics {
    /// 窗口长度（毫秒）
    pub window_ms: u64,
    /// 请求数
    pub count: usize,
    /// 成功数
    pub success_count: usize,
    /// 失败数
    pub failure_count: usize,
    /// 错误率，窗口内无请求时为 0
    pub error_rate: f64,
    /// 平均耗时
    pub average_duration_ms: f64,
    /// 最短耗时
    pub min_duration_ms: f64,
    /// 最长耗时
    pub max_duration_ms: f64,
    /// P95 耗时
    pub p95_ms: f64,
    /// P99 耗时
    pub p99_ms: f64,
    /// 每秒请求数
    pub throughput: f64,
    /// 按标签拆分
    pub labels: BTreeMap<String, LabelMetrics>,
}

/// 最近秩百分位数
///
/// `sorted` 必须升序；空输入返回 0。
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = ((p / 100.0) * n as f64).ceil() as usize;
    sorted[rank.clamp(1, n) - 1]
}

/// 请求指标记录器
#[derive(Debug)]
pub struct MetricsRecorder {
    clock: SharedClock,
    retention_ms: u64,
    history: Mutex<VecDeque<RequestMetric>>,
    pool: Mutex<PoolSnapshot>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
}

impl MetricsRecorder {
    /// 创建记录器
    pub fn new(config: &MonitorConfig, clock: SharedClock) -> Self {
        Self {
            clock,
            retention_ms: config.retention_ms,
            history: Mutex::new(VecDeque::new()),
            pool: Mutex::new(PoolSnapshot::default()),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
        }
    }

    fn lock_history(&self) -> MutexGuard<'_, VecDeque<RequestMetric>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 当前时间
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// 记录一次请求
    pub fn record_request(
        &self,
        label: impl Into<String>,
        duration_ms: f64,
        success: bool,
        metadata: Metadata,
    ) -> RequestMetric {
        let now = self.clock.now_ms();
        let metric = RequestMetric {
            label: label.into(),
            duration_ms,
            success,
            timestamp_ms: now,
            metadata,
        };

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.total_failures.fetch_add(1, Ordering::Relaxed);
        }

        let mut history = self.lock_history();
        Self::prune_locked(&mut history, now, self.retention_ms);
        history.push_back(metric.clone());
        metric
    }

    fn prune_locked(history: &mut VecDeque<RequestMetric>, now: u64, retention_ms: u64) -> usize {
        let cutoff = now.saturating_sub(retention_ms);
        let before = history.len();
        while history.front().is_some_and(|m| m.timestamp_ms < cutoff) {
            history.pop_front();
        }
        before - history.len()
    }

    /// 清除超过保留期的记录，返回清除数量
    pub fn prune(&self) -> usize {
        let now = self.clock.now_ms();
        Self::prune_locked(&mut self.lock_history(), now, self.retention_ms)
    }

    /// 聚合 `[now - window_ms, now]` 内的请求
    pub fn get_metrics(&self, window_ms: u64) -> WindowMetrics {
        let now = self.clock.now_ms();
        let start = now.saturating_sub(window_ms);

        let in_window: Vec<RequestMetric> = self
            .lock_history()
            .iter()
            .filter(|m| m.timestamp_ms >= start && m.timestamp_ms <= now)
            .cloned()
            .collect();

        let count = in_window.len();
        let mut result = WindowMetrics {
            window_ms,
            count,
            ..Default::default()
        };
        if count == 0 {
            return result;
        }

        let mut durations: Vec<f64> = in_window.iter().map(|m| m.duration_ms).collect();
        durations.sort_by(|a, b| a.total_cmp(b));

        result.success_count = in_window.iter().filter(|m| m.success).count();
        result.failure_count = count - result.success_count;
        result.error_rate = result.failure_count as f64 / count as f64;
        result.average_duration_ms = durations.iter().sum::<f64>() / count as f64;
        result.min_duration_ms = durations[0];
        result.max_duration_ms = durations[count - 1];
        result.p95_ms = percentile(&durations, 95.0);
        result.p99_ms = percentile(&durations, 99.0);
        if window_ms > 0 {
            result.throughput = count as f64 / (window_ms as f64 / 1000.0);
        }

        let mut sums: BTreeMap<String, f64> = BTreeMap::new();
        for metric in &in_window {
            let entry = result.labels.entry(metric.label.clone()).or_default();
            entry.count += 1;
            if !metric.success {
                entry.failure_count += 1;
            }
            *sums.entry(metric.label.clone()).or_default() += metric.duration_ms;
        }
        for (label, entry) in result.labels.iter_mut() {
            entry.average_duration_ms = sums.get(label).copied().unwrap_or(0.0) / entry.count as f64;
        }

        result
    }

    /// 覆盖连接池构成快照
    pub fn update_connection_pool_metrics(&self, snapshot: PoolSnapshot) {
        *self.pool.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    /// 最新的连接池构成
    pub fn pool_snapshot(&self) -> PoolSnapshot {
        *self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 累计请求数与失败数
    pub fn totals(&self) -> (u64, u64) {
        (
            self.total_requests.load(Ordering::Relaxed),
            self.total_failures.load(Ordering::Relaxed),
        )
    }

    /// 当前保存的记录数
    pub fn history_len(&self) -> usize {
        self.lock_history().len()
    }

    /// 启动定期清理任务，`token` 取消后退出
    pub fn spawn_cleanup_task(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let recorder = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval_timer.tick() => {
                        let count = recorder.prune();
                        if count > 0 {
                            debug!(count, "清理了过期的请求指标");
                        }
                    }
                }
            }
        })
    }
}
