//! 准入控制错误类型
//!
//! 定义连接池、请求队列和停机流程对外暴露的全部错误。

use super::context::ErrorContext;
use thiserror::Error;

/// 准入控制错误类型
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// 建连重试耗尽
    #[error("建立连接失败 (已尝试 {attempts} 次): {message}")]
    ConnectionCreate { attempts: u32, message: String },

    /// 获取连接超时
    #[error("获取连接超时 ({timeout_ms}ms)")]
    AcquireTimeout { timeout_ms: u64 },

    /// 操作执行超时
    #[error("操作执行超时 ({timeout_ms}ms)")]
    OperationTimeout { timeout_ms: u64 },

    /// 队列已满
    #[error("请求队列已满 (上限 {max_size})")]
    QueueFull { max_size: usize },

    /// 排队超过截止时间
    #[error("请求排队超时 (已等待 {waited_ms}ms, 上限 {timeout_ms}ms)")]
    QueueTimeout { waited_ms: u64, timeout_ms: u64 },

    /// 正在停机
    #[error("服务正在停机，拒绝新的请求")]
    ShutdownInProgress,

    /// 队列被管理操作清空
    #[error("请求队列已被清空")]
    QueueCleared,

    /// 连接池已关闭
    #[error("连接池已关闭")]
    PoolClosed,

    /// 后端操作失败（只保留错误描述）
    #[error("操作失败: {0}")]
    OperationFailed(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 带上下文的错误
    #[error("{0} ({1})")]
    WithContext(#[source] Box<AdmissionError>, ErrorContext),
}

impl AdmissionError {
    /// 获取错误类型（穿透上下文包装）
    pub fn kind(&self) -> AdmissionErrorKind {
        match self {
            AdmissionError::ConnectionCreate { .. } => AdmissionErrorKind::ConnectionCreate,
            AdmissionError::AcquireTimeout { .. } => AdmissionErrorKind::AcquireTimeout,
            AdmissionError::OperationTimeout { .. } => AdmissionErrorKind::OperationTimeout,
            AdmissionError::QueueFull { .. } => AdmissionErrorKind::QueueFull,
            AdmissionError::QueueTimeout { .. } => AdmissionErrorKind::QueueTimeout,
            AdmissionError::ShutdownInProgress => AdmissionErrorKind::ShutdownInProgress,
            AdmissionError::QueueCleared => AdmissionErrorKind::QueueCleared,
            AdmissionError::PoolClosed => AdmissionErrorKind::PoolClosed,
            AdmissionError::OperationFailed(_) => AdmissionErrorKind::OperationFailed,
            AdmissionError::Config(_) => AdmissionErrorKind::Config,
            AdmissionError::WithContext(inner, _) => inner.kind(),
        }
    }

    /// 添加上下文信息
    pub fn with_context<C>(self, context: C) -> Self
    where
        C: Into<ErrorContext>,
    {
        AdmissionError::WithContext(Box::new(self), context.into())
    }

    /// 调用方稍后重试是否可能成功
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// 映射到 HTTP 状态码
    pub fn http_status(&self) -> u16 {
        self.kind().http_status()
    }

    /// 创建后端操作错误
    pub fn operation(msg: impl Into<String>) -> Self {
        AdmissionError::OperationFailed(msg.into())
    }

    /// 创建配置错误
    pub fn config(msg: impl Into<String>) -> Self {
        AdmissionError::Config(msg.into())
    }
}

impl From<dbgate_config::ConfigError> for AdmissionError {
    fn from(err: dbgate_config::ConfigError) -> Self {
        AdmissionError::Config(err.to_string())
    }
}

/// 错误类型分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdmissionErrorKind {
    /// 建连失败
    ConnectionCreate,
    /// 获取连接超时
    AcquireTimeout,
    /// 操作超时
    OperationTimeout,
    /// 队列已满
    QueueFull,
    /// 排队超时
    QueueTimeout,
    /// 停机中
    ShutdownInProgress,
    /// 队列被清空
    QueueCleared,
    /// 连接池已关闭
    PoolClosed,
    /// 后端操作失败
    OperationFailed,
    /// 配置错误
    Config,
}

impl AdmissionErrorKind {
    /// 稳定的小写名称，用于指标元数据和日志
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionErrorKind::ConnectionCreate => "connection_create",
            AdmissionErrorKind::AcquireTimeout => "acquire_timeout",
            AdmissionErrorKind::OperationTimeout => "operation_timeout",
            AdmissionErrorKind::QueueFull => "queue_full",
            AdmissionErrorKind::QueueTimeout => "queue_timeout",
            AdmissionErrorKind::ShutdownInProgress => "shutdown_in_progress",
            AdmissionErrorKind::QueueCleared => "queue_cleared",
            AdmissionErrorKind::PoolClosed => "pool_closed",
            AdmissionErrorKind::OperationFailed => "operation_failed",
            AdmissionErrorKind::Config => "config",
        }
    }

    /// 是否属于可重试的容量/超时类错误
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AdmissionErrorKind::OperationFailed | AdmissionErrorKind::Config
        )
    }

    /// 映射到 HTTP 状态码
    ///
    /// 超时类为 504，容量与停机类为 503，其余为 500。
    pub fn http_status(&self) -> u16 {
        match self {
            AdmissionErrorKind::AcquireTimeout
            | AdmissionErrorKind::OperationTimeout
            | AdmissionErrorKind::QueueTimeout => 504,
            AdmissionErrorKind::ConnectionCreate
            | AdmissionErrorKind::QueueFull
            | AdmissionErrorKind::ShutdownInProgress
            | AdmissionErrorKind::QueueCleared
            | AdmissionErrorKind::PoolClosed => 503,
            AdmissionErrorKind::OperationFailed | AdmissionErrorKind::Config => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            AdmissionError::QueueFull { max_size: 3 }.kind(),
            AdmissionErrorKind::QueueFull
        );
        assert_eq!(
            AdmissionError::ShutdownInProgress.kind(),
            AdmissionErrorKind::ShutdownInProgress
        );
        assert_eq!(
            AdmissionError::operation("boom").kind(),
            AdmissionErrorKind::OperationFailed
        );
    }

    #[test]
    fn test_error_with_context() {
        let err = AdmissionError::AcquireTimeout { timeout_ms: 100 }
            .with_context(("label", "messages.list"));
        assert!(matches!(err, AdmissionError::WithContext(_, _)));
        assert_eq!(err.kind(), AdmissionErrorKind::AcquireTimeout);
        assert_eq!(err.to_string(), "获取连接超时 (100ms) (label: messages.list)");
    }

    #[test]
    fn test_http_mapping() {
        assert_eq!(AdmissionError::AcquireTimeout { timeout_ms: 1 }.http_status(), 504);
        assert_eq!(
            AdmissionError::QueueTimeout {
                waited_ms: 10,
                timeout_ms: 5
            }
            .http_status(),
            504
        );
        assert_eq!(AdmissionError::QueueFull { max_size: 1 }.http_status(), 503);
        assert_eq!(AdmissionError::ShutdownInProgress.http_status(), 503);
        assert_eq!(AdmissionError::operation("syntax").http_status(), 500);
    }

    #[test]
    fn test_retryable() {
        assert!(AdmissionError::QueueFull { max_size: 1 }.is_retryable());
        assert!(AdmissionError::PoolClosed.is_retryable());
        assert!(!AdmissionError::operation("constraint violated").is_retryable());
    }

    #[test]
    fn test_from_config_error() {
        let err: AdmissionError =
            dbgate_config::ConfigError::Validation("最大连接数不能为 0".to_string()).into();
        assert_eq!(err.kind(), AdmissionErrorKind::Config);
    }
}
