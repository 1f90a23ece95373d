//! 配置管理系统
//!
//! 准入控制层的全部可调参数：连接池、请求队列、指标与告警、健康检查和停机。
//! 支持 TOML 文件加载和 `DBGATE_*` 环境变量覆盖。

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// 配置错误类型
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 解析错误
    #[error("解析配置文件失败: {0}")]
    Parse(String),

    /// 验证错误
    #[error("配置验证失败: {0}")]
    Validation(String),

    /// 环境变量错误
    #[error("环境变量解析失败: {0}")]
    EnvVar(String),
}

/// 配置 Result 类型
pub type Result<T> = std::result::Result<T, ConfigError>;

/// 准入控制总配置
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// 连接池配置
    #[serde(default)]
    pub pool: PoolConfig,

    /// 请求队列配置
    #[serde(default)]
    pub queue: QueueConfig,

    /// 指标与告警配置
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// 健康检查配置
    #[serde(default)]
    pub health: HealthConfig,

    /// 停机配置
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// 连接池配置
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// 最大连接数
    #[serde(default = "default_pool_max")]
    pub max: usize,

    /// 最小保持连接数
    #[serde(default = "default_pool_min")]
    pub min: usize,

    /// 获取连接的最长等待时间（毫秒）
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,

    /// 单次建立连接的超时时间（毫秒）
    #[serde(default = "default_create_timeout")]
    pub create_timeout_ms: u64,

    /// 空闲连接回收阈值（毫秒）
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// 建连失败后的重试间隔（毫秒）
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    /// 建连最大尝试次数，超过后向调用方报告 `ConnectionCreate`
    #[serde(default = "default_max_create_retries")]
    pub max_create_retries: u32,

    /// 建连失败是否立即向调用方传播
    #[serde(default)]
    pub propagate_create_error: bool,

    /// 单条语句执行超时（毫秒）
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_ms: u64,

    /// 空闲连接清理任务的执行间隔（毫秒）
    #[serde(default = "default_reap_interval")]
    pub reap_interval_ms: u64,
}

/// 请求队列配置
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// 队列最大长度
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// 未显式指定时的排队超时（毫秒）
    #[serde(default = "default_queue_timeout")]
    pub default_timeout_ms: u64,
}

/// 指标与告警配置
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// 同类告警的冷却时间（毫秒）
    #[serde(default = "default_alert_cooldown")]
    pub alert_cooldown_ms: u64,

    /// 请求指标保留时长（毫秒）
    #[serde(default = "default_retention")]
    pub retention_ms: u64,

    /// 过期指标清理间隔（毫秒）
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_ms: u64,

    /// 告警评估使用的滑动窗口（毫秒）
    #[serde(default = "default_evaluation_window")]
    pub evaluation_window_ms: u64,

    /// 内存中保留的告警条数上限
    #[serde(default = "default_alert_history_limit")]
    pub alert_history_limit: usize,

    /// 告警阈值
    #[serde(default)]
    pub thresholds: AlertThresholds,
}

/// 告警阈值
///
/// 运行期通过部分更新合并修改，未指定的字段保持原值。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// 最大错误率（0.0 - 1.0）
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,

    /// 最大响应时间（毫秒）
    #[serde(default = "default_max_response_time")]
    pub max_response_time_ms: f64,

    /// 最大活跃连接数
    #[serde(default = "default_max_active_connections")]
    pub max_active_connections: usize,

    /// 最大排队请求数
    #[serde(default = "default_max_queued_requests")]
    pub max_queued_requests: usize,

    /// 最小吞吐量（请求/秒），0 表示不检查
    #[serde(default)]
    pub min_throughput: f64,
}

/// 健康检查配置
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthConfig {
    /// 队列占用达到该比例时判定为 critical
    #[serde(default = "default_critical_queue_ratio")]
    pub critical_queue_ratio: f64,

    /// 等待连接的客户端达到该数量时判定为 degraded
    #[serde(default = "default_degraded_waiting_clients")]
    pub degraded_waiting_clients: usize,

    /// 可达性探测超时（毫秒）
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

/// 停机配置
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// 等待活跃连接归还的最长时间（毫秒）
    #[serde(default = "default_shutdown_timeout")]
    pub timeout_ms: u64,

    /// 轮询活跃连接的间隔（毫秒）
    #[serde(default = "default_shutdown_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: default_pool_max(),
            min: default_pool_min(),
            acquire_timeout_ms: default_acquire_timeout(),
            create_timeout_ms: default_create_timeout(),
            idle_timeout_ms: default_idle_timeout(),
            retry_interval_ms: default_retry_interval(),
            max_create_retries: default_max_create_retries(),
            propagate_create_error: false,
            statement_timeout_ms: default_statement_timeout(),
            reap_interval_ms: default_reap_interval(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            default_timeout_ms: default_queue_timeout(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            alert_cooldown_ms: default_alert_cooldown(),
            retention_ms: default_retention(),
            cleanup_interval_ms: default_cleanup_interval(),
            evaluation_window_ms: default_evaluation_window(),
            alert_history_limit: default_alert_history_limit(),
            thresholds: AlertThresholds::default(),
        }
    }
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            max_error_rate: default_max_error_rate(),
            max_response_time_ms: default_max_response_time(),
            max_active_connections: default_max_active_connections(),
            max_queued_requests: default_max_queued_requests(),
            min_throughput: 0.0,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            critical_queue_ratio: default_critical_queue_ratio(),
            degraded_waiting_clients: default_degraded_waiting_clients(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_shutdown_timeout(),
            poll_interval_ms: default_shutdown_poll_interval(),
        }
    }
}

impl AdmissionConfig {
    /// 从 TOML 文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("读取配置文件失败: {}", e)))?;

        Self::from_toml_str(&content)
    }

    /// 从 TOML 字符串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(format!("解析配置文件失败: {}", e)))
    }

    /// 从环境变量加载配置并覆盖
    ///
    /// 支持的环境变量：
    /// - DBGATE_POOL_MAX / DBGATE_POOL_MIN: 连接池上下限
    /// - DBGATE_ACQUIRE_TIMEOUT_MS: 获取连接超时
    /// - DBGATE_CREATE_TIMEOUT_MS: 建连超时
    /// - DBGATE_IDLE_TIMEOUT_MS: 空闲回收阈值
    /// - DBGATE_RETRY_INTERVAL_MS: 建连重试间隔
    /// - DBGATE_STATEMENT_TIMEOUT_MS: 语句超时
    /// - DBGATE_MAX_QUEUE_SIZE: 队列长度上限
    /// - DBGATE_ALERT_COOLDOWN_MS: 告警冷却时间
    /// - DBGATE_METRICS_RETENTION_MS: 指标保留时长
    /// - DBGATE_SHUTDOWN_TIMEOUT_MS: 停机等待时间
    pub fn load_with_env_override(mut self) -> Result<Self> {
        env_override("DBGATE_POOL_MAX", &mut self.pool.max)?;
        env_override("DBGATE_POOL_MIN", &mut self.pool.min)?;
        env_override("DBGATE_ACQUIRE_TIMEOUT_MS", &mut self.pool.acquire_timeout_ms)?;
        env_override("DBGATE_CREATE_TIMEOUT_MS", &mut self.pool.create_timeout_ms)?;
        env_override("DBGATE_IDLE_TIMEOUT_MS", &mut self.pool.idle_timeout_ms)?;
        env_override("DBGATE_RETRY_INTERVAL_MS", &mut self.pool.retry_interval_ms)?;
        env_override("DBGATE_STATEMENT_TIMEOUT_MS", &mut self.pool.statement_timeout_ms)?;
        env_override("DBGATE_MAX_QUEUE_SIZE", &mut self.queue.max_queue_size)?;
        env_override("DBGATE_ALERT_COOLDOWN_MS", &mut self.monitor.alert_cooldown_ms)?;
        env_override("DBGATE_METRICS_RETENTION_MS", &mut self.monitor.retention_ms)?;
        env_override("DBGATE_SHUTDOWN_TIMEOUT_MS", &mut self.shutdown.timeout_ms)?;

        Ok(self)
    }

    /// 从文件加载并应用环境变量覆盖
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_file(path)?.load_with_env_override()
    }

    /// 验证配置是否有效
    pub fn validate(&self) -> Result<()> {
        let pool = &self.pool;

        if pool.max == 0 {
            return Err(ConfigError::Validation("最大连接数不能为 0".to_string()));
        }

        if pool.min > pool.max {
            return Err(ConfigError::Validation(format!(
                "最小连接数 ({}) 不能大于最大连接数 ({})",
                pool.min, pool.max
            )));
        }

        if pool.acquire_timeout_ms == 0 || pool.create_timeout_ms == 0 {
            return Err(ConfigError::Validation("连接超时时间不能为 0".to_string()));
        }

        if pool.statement_timeout_ms == 0 {
            return Err(ConfigError::Validation("语句超时时间不能为 0".to_string()));
        }

        if pool.max_create_retries == 0 {
            return Err(ConfigError::Validation("建连尝试次数不能为 0".to_string()));
        }

        if self.queue.max_queue_size == 0 {
            return Err(ConfigError::Validation("队列长度上限不能为 0".to_string()));
        }

        if self.monitor.evaluation_window_ms == 0 {
            return Err(ConfigError::Validation("告警评估窗口不能为 0".to_string()));
        }

        let rate = self.monitor.thresholds.max_error_rate;
        if !(0.0..=1.0).contains(&rate) {
            return Err(ConfigError::Validation(format!(
                "错误率阈值必须在 0 到 1 之间: {}",
                rate
            )));
        }

        let ratio = self.health.critical_queue_ratio;
        if ratio <= 0.0 || ratio > 1.0 {
            return Err(ConfigError::Validation(format!(
                "队列危险比例必须在 (0, 1] 之间: {}",
                ratio
            )));
        }

        if self.shutdown.poll_interval_ms == 0 {
            return Err(ConfigError::Validation("停机轮询间隔不能为 0".to_string()));
        }

        Ok(())
    }

    /// 获取配置摘要信息
    pub fn summary(&self) -> String {
        format!(
            "dbgate 准入配置:\n  连接池: {}-{}\n  获取超时: {}ms\n  队列上限: {}\n  告警冷却: {}ms",
            self.pool.min,
            self.pool.max,
            self.pool.acquire_timeout_ms,
            self.queue.max_queue_size,
            self.monitor.alert_cooldown_ms
        )
    }
}

fn env_override<T: std::str::FromStr>(key: &str, target: &mut T) -> Result<()> {
    if let Ok(value) = std::env::var(key) {
        *target = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::EnvVar(format!("{} 必须是有效的数字", key)))?;
    }
    Ok(())
}

// 默认值函数
fn default_pool_max() -> usize {
    (num_cpus::get() * 2).clamp(4, 32)
}

fn default_pool_min() -> usize {
    2
}

fn default_acquire_timeout() -> u64 {
    30_000
}

fn default_create_timeout() -> u64 {
    30_000
}

fn default_idle_timeout() -> u64 {
    30_000
}

fn default_retry_interval() -> u64 {
    200
}

fn default_max_create_retries() -> u32 {
    5
}

fn default_statement_timeout() -> u64 {
    30_000
}

fn default_reap_interval() -> u64 {
    1_000
}

fn default_max_queue_size() -> usize {
    100
}

fn default_queue_timeout() -> u64 {
    30_000
}

fn default_alert_cooldown() -> u64 {
    300_000
}

fn default_retention() -> u64 {
    3_600_000
}

fn default_cleanup_interval() -> u64 {
    300_000
}

fn default_evaluation_window() -> u64 {
    60_000
}

fn default_alert_history_limit() -> usize {
    1_000
}

fn default_max_error_rate() -> f64 {
    0.05
}

fn default_max_response_time() -> f64 {
    1_000.0
}

fn default_max_active_connections() -> usize {
    18
}

fn default_max_queued_requests() -> usize {
    50
}

fn default_critical_queue_ratio() -> f64 {
    0.9
}

fn default_degraded_waiting_clients() -> usize {
    5
}

fn default_probe_timeout() -> u64 {
    5_000
}

fn default_shutdown_timeout() -> u64 {
    30_000
}

fn default_shutdown_poll_interval() -> u64 {
    100
}
