//! 准入控制器
//!
//! 队列空闲时请求先尝试立即拿到连接；否则进入优先级队列，由处理循环拿到连接后
//! 按优先级逐个执行。
//! 每个请求的最终结果（包括被拒绝）都记入监控，准入状态变化后推送连接池快照。

use super::gate::PoolGate;
use super::options::QueryOptions;
use super::shutdown::{LifecycleState, ShutdownCoordinator, ShutdownReport};
use dbgate_config::{AdmissionConfig, AlertThresholds};
use dbgate_core::{AdmissionError, AdmissionErrorKind, BoxError, Result};
use dbgate_monitor::{
    Alert, AlertThresholdsUpdate, HealthInputs, HealthReporter, HealthSnapshot, Metadata,
    PerformanceMonitor, PoolSnapshot, SubscriptionId, WindowMetrics,
};
use dbgate_pool::{Connection, ConnectionFactory, ConnectionPool, PoolStats, PooledConnection, QueryResult};
use dbgate_queue::{QueueStats, RequestQueue};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) struct ControllerInner<F: ConnectionFactory> {
    pub(crate) config: AdmissionConfig,
    pub(crate) pool: ConnectionPool<F>,
    pub(crate) queue: RequestQueue<PoolGate<F>>,
    pub(crate) monitor: Arc<PerformanceMonitor>,
    pub(crate) health: HealthReporter,
    pub(crate) shutdown: ShutdownCoordinator<F>,
    pub(crate) background: CancellationToken,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// 准入控制器
///
/// 内部为 `Arc`，克隆开销很小，可以在各个处理任务之间共享。
pub struct AdmissionController<F: ConnectionFactory> {
    inner: Arc<ControllerInner<F>>,
}

impl<F: ConnectionFactory> Clone for AdmissionController<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn backend_error(err: BoxError) -> AdmissionError {
    AdmissionError::operation(err.to_string())
}

/// 在借出的连接上执行操作，超过语句超时则丢弃连接
async fn run_leased<F, T, Op>(
    mut lease: PooledConnection<F>,
    op: Op,
    statement_timeout: Duration,
) -> Result<T>
where
    F: ConnectionFactory,
    Op: for<'c> FnOnce(&'c mut F::Connection) -> BoxFuture<'c, Result<T>>,
{
    let outcome = tokio::time::timeout(statement_timeout, op(&mut *lease)).await;

    match outcome {
        Ok(result) => result,
        Err(_) => {
            let timeout_ms = statement_timeout.as_millis() as u64;
            warn!(connection_id = %lease.id(), timeout_ms, "语句执行超时，丢弃连接");
            lease.discard();
            Err(AdmissionError::OperationTimeout { timeout_ms })
        }
    }
}

impl<F: ConnectionFactory> AdmissionController<F> {
    pub(crate) fn from_inner(inner: ControllerInner<F>) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// 预热连接池并启动后台任务（空闲连接回收、过期指标清理）
    ///
    /// 返回预热新建的连接数。
    pub async fn start(&self) -> usize {
        let warmed = self.inner.pool.warm_up().await;

        let mut tasks = self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(self.inner.pool.spawn_reaper());
        tasks.push(
            self.inner
                .monitor
                .spawn_cleanup_task(self.inner.background.child_token()),
        );
        drop(tasks);

        self.publish_pool_snapshot();
        info!(warmed, "准入控制已启动");
        warmed
    }

    /// 在一个连接上执行任意操作
    ///
    /// `op` 拿到连接的可变引用，超过 `pool.statement_timeout_ms` 时该连接被丢弃，
    /// 返回 `OperationTimeout`。
    pub async fn execute<T, Op>(&self, options: QueryOptions, op: Op) -> Result<T>
    where
        T: Send + 'static,
        Op: for<'c> FnOnce(&'c mut F::Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
    {
        let label = options.label_or("execute");
        self.admit_and_record(&label, &options, op).await
    }

    async fn admit_and_record<T, Op>(&self, label: &str, options: &QueryOptions, op: Op) -> Result<T>
    where
        T: Send + 'static,
        Op: for<'c> FnOnce(&'c mut F::Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
    {
        let started = Instant::now();
        let (result, queued) = self.admit(options, op).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut metadata = Metadata::new();
        metadata.insert("priority".to_string(), Value::from(options.priority));
        metadata.insert("queued".to_string(), Value::from(queued));

        match &result {
            Ok(_) => {
                debug!(label, duration_ms, queued, "请求完成");
            }
            Err(err) => {
                metadata.insert("error".to_string(), Value::from(err.kind().as_str()));
                debug!(label, duration_ms, queued, error = %err, "请求失败");
            }
        }

        self.inner
            .monitor
            .record_request(label, duration_ms, result.is_ok(), metadata);
        self.publish_pool_snapshot();

        // 后端失败附带请求标签，准入类错误保持原样
        result.map_err(|err| match err.kind() {
            AdmissionErrorKind::OperationFailed => err.with_context(("label", label)),
            _ => err,
        })
    }

    /// 准入：返回结果和是否经过排队
    async fn admit<T, Op>(&self, options: &QueryOptions, op: Op) -> (Result<T>, bool)
    where
        T: Send + 'static,
        Op: for<'c> FnOnce(&'c mut F::Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
    {
        if !self.inner.shutdown.is_running() {
            return (Err(AdmissionError::ShutdownInProgress), false);
        }

        let statement_timeout = Duration::from_millis(self.inner.config.pool.statement_timeout_ms);

        // 已有请求在排队时不抢先占用空闲连接
        let queue_busy = !self.inner.queue.is_empty() || self.inner.queue.is_processing();
        if !queue_busy {
            match self.inner.pool.try_acquire().await {
                Ok(Some(lease)) => {
                    self.publish_pool_snapshot();
                    return (run_leased(lease, op, statement_timeout).await, false);
                }
                Ok(None) => {}
                Err(err) => return (Err(err), false),
            }
        }

        let timeout = Duration::from_millis(
            options
                .timeout_ms
                .unwrap_or(self.inner.config.queue.default_timeout_ms),
        );
        let submitted = self.inner.queue.submit(
            move |lease: PooledConnection<F>| run_leased(lease, op, statement_timeout),
            options.priority,
            timeout,
        );

        match submitted {
            Ok(ticket) => {
                self.publish_pool_snapshot();
                (ticket.await, true)
            }
            Err(err) => (Err(err), false),
        }
    }

    /// 推送当前连接池构成，触发连接池类告警评估
    pub fn publish_pool_snapshot(&self) -> Vec<Alert> {
        self.inner
            .monitor
            .update_connection_pool_metrics(self.pool_snapshot())
    }

    fn pool_snapshot(&self) -> PoolSnapshot {
        let stats = self.inner.pool.stats();
        PoolSnapshot {
            active: stats.active,
            idle: stats.idle,
            total: stats.total,
            waiting: stats.waiting,
            queued: self.inner.queue.len(),
        }
    }

    /// 健康检查
    pub async fn health(&self) -> HealthSnapshot {
        let inputs = HealthInputs {
            pool: self.pool_snapshot(),
            metrics: self.inner.monitor.evaluation_metrics(),
            max_error_rate: self.inner.monitor.alerts().thresholds().max_error_rate,
        };
        self.inner.health.check(inputs).await
    }

    /// 窗口内的请求指标
    pub fn metrics(&self, window_ms: u64) -> WindowMetrics {
        self.inner.monitor.get_metrics(window_ms)
    }

    /// 窗口内触发的告警
    pub fn recent_alerts(&self, window_ms: u64) -> Vec<Alert> {
        self.inner.monitor.alerts().recent_alerts(window_ms)
    }

    /// 当前告警阈值
    pub fn alert_thresholds(&self) -> AlertThresholds {
        self.inner.monitor.alerts().thresholds()
    }

    /// 合并部分告警阈值
    pub fn set_alert_thresholds(&self, update: &AlertThresholdsUpdate) -> AlertThresholds {
        self.inner.monitor.alerts().set_thresholds(update)
    }

    /// 订阅告警
    pub fn subscribe_alerts<L>(&self, listener: L) -> SubscriptionId
    where
        L: Fn(&Alert) + Send + Sync + 'static,
    {
        self.inner.monitor.alerts().subscribe(listener)
    }

    /// 取消告警订阅
    pub fn unsubscribe_alerts(&self, id: SubscriptionId) -> bool {
        self.inner.monitor.alerts().unsubscribe(id)
    }

    /// 连接池状态
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    /// 当前排队数
    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    /// 队列状态
    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    /// 清空队列，被清空的请求收到 `QueueCleared`
    pub fn reset_queue(&self) -> usize {
        let count = self.inner.queue.clear(dbgate_queue::ClearReason::Reset);
        self.publish_pool_snapshot();
        count
    }

    /// 生命周期状态
    pub fn state(&self) -> LifecycleState {
        self.inner.shutdown.state()
    }

    /// 订阅生命周期状态变化
    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.inner.shutdown.subscribe()
    }

    /// 停机，可重复调用
    pub async fn shutdown(&self) -> ShutdownReport {
        let report = self.inner.shutdown.shutdown().await;

        let tasks: Vec<JoinHandle<()>> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "后台任务异常退出");
            }
        }

        report
    }

    /// 监控器
    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.inner.monitor
    }

    /// 连接池
    pub fn pool(&self) -> &ConnectionPool<F> {
        &self.inner.pool
    }

    /// 配置
    pub fn config(&self) -> &AdmissionConfig {
        &self.inner.config
    }
}

impl<F> AdmissionController<F>
where
    F: ConnectionFactory,
    F::Connection: Connection,
{
    /// 执行单条语句
    pub async fn query(
        &self,
        statement: impl Into<String>,
        params: Vec<Value>,
        options: QueryOptions,
    ) -> Result<QueryResult> {
        let statement = statement.into();
        let label = options.label_or("query");

        self.admit_and_record(&label, &options, move |conn: &mut F::Connection| {
            async move { conn.query(&statement, &params).await.map_err(backend_error) }.boxed()
        })
        .await
    }

    /// 在事务中执行操作
    ///
    /// 成功时提交，返回错误时回滚；语句超时的事务直接丢弃连接。
    pub async fn transaction<T, Op>(&self, options: QueryOptions, op: Op) -> Result<T>
    where
        T: Send + 'static,
        Op: for<'c> FnOnce(&'c mut F::Connection) -> BoxFuture<'c, Result<T>> + Send + 'static,
    {
        let label = options.label_or("transaction");

        self.admit_and_record(&label, &options, move |conn: &mut F::Connection| {
            async move {
                conn.execute("BEGIN").await.map_err(backend_error)?;

                match op(&mut *conn).await {
                    Ok(value) => {
                        conn.execute("COMMIT").await.map_err(backend_error)?;
                        Ok(value)
                    }
                    Err(err) => {
                        if let Err(rollback) = conn.execute("ROLLBACK").await {
                            warn!(error = %rollback, "事务回滚失败");
                        }
                        Err(err)
                    }
                }
            }
            .boxed()
        })
        .await
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for AdmissionController<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("state", &self.state())
            .field("pool", &self.inner.pool.stats())
            .field("queue_len", &self.inner.queue.len())
            .finish()
    }
}
