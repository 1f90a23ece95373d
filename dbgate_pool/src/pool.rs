//! 连接池
//!
//! 用 `max` 个信号量许可约束同时借出的连接数。空闲连接按最近归还优先复用，
//! 超过 `idle_timeout_ms` 的空闲连接由后台任务回收。建连失败按
//! `retry_interval_ms` 重试，不会直接打断已经被准入的请求。

use crate::connection::{ConnectionId, ConnectionIdGenerator};
use crate::event::PoolEvent;
use crate::factory::ConnectionFactory;
use crate::lease::PooledConnection;
use crate::metrics::{PoolCounters, PoolStats, WaitingGuard};
use dbgate_config::PoolConfig;
use dbgate_core::{AdmissionError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 事件通道容量
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// 空闲连接
struct IdleConnection<C> {
    id: ConnectionId,
    connection: C,
    created_at: Instant,
    idle_since: Instant,
}

/// 连接池共享状态
pub(crate) struct PoolInner<F: ConnectionFactory> {
    config: PoolConfig,
    factory: F,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<IdleConnection<F::Connection>>>,
    counters: PoolCounters,
    id_generator: ConnectionIdGenerator,
    events: broadcast::Sender<PoolEvent>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn lock_idle(&self) -> MutexGuard<'_, VecDeque<IdleConnection<F::Connection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PoolEvent) {
        // 没有订阅者时发送失败，忽略即可
        let _ = self.events.send(event);
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.config.idle_timeout_ms)
    }

    /// 租约释放时调用
    pub(crate) fn return_connection(
        self: &Arc<Self>,
        id: ConnectionId,
        connection: F::Connection,
        created_at: Instant,
        discard: bool,
    ) {
        self.counters.record_returned();

        if discard || self.closed.load(Ordering::Acquire) {
            let reason = if discard { "discarded" } else { "pool closed" };
            self.retire_detached(id, connection, reason);
            return;
        }

        self.lock_idle().push_back(IdleConnection {
            id,
            connection,
            created_at,
            idle_since: Instant::now(),
        });
        self.emit(PoolEvent::Released { id });
        debug!(connection_id = %id, "连接已归还");
    }

    /// 移除并异步销毁连接
    async fn retire(&self, id: ConnectionId, connection: F::Connection, reason: &'static str) {
        self.counters.record_destroyed();
        self.emit(PoolEvent::Removed { id, reason });
        debug!(connection_id = %id, reason, "连接已移除");
        self.factory.destroy(connection).await;
    }

    /// 在同步上下文中移除连接，销毁交给运行时后台执行
    fn retire_detached(self: &Arc<Self>, id: ConnectionId, connection: F::Connection, reason: &'static str) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move {
                    inner.retire(id, connection, reason).await;
                });
            }
            Err(_) => {
                self.counters.record_destroyed();
                self.emit(PoolEvent::Removed { id, reason });
                drop(connection);
            }
        }
    }
}

/// 连接池
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// 创建新的连接池
    ///
    /// 不会立即建连，需要预热时调用 [`ConnectionPool::warm_up`]。
    pub fn new(config: PoolConfig, factory: F) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(PoolInner {
                semaphore: Arc::new(Semaphore::new(config.max)),
                config,
                factory,
                idle: Mutex::new(VecDeque::new()),
                counters: PoolCounters::new(),
                id_generator: ConnectionIdGenerator::new(),
                events,
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// 连接池配置
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// 连接工厂
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// 订阅生命周期事件
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// 是否已关闭
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(AdmissionError::PoolClosed);
        }
        Ok(())
    }

    /// 获取连接
    ///
    /// 连接池已满时挂起，最多等待 `acquire_timeout_ms`。
    pub async fn acquire(&self) -> Result<PooledConnection<F>> {
        self.ensure_open()?;

        let timeout_ms = self.inner.config.acquire_timeout_ms;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        let permit = {
            let _waiting = WaitingGuard::new(&self.inner.counters);
            let acquire = Arc::clone(&self.inner.semaphore).acquire_owned();

            match tokio::time::timeout_at(deadline, acquire).await {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(AdmissionError::PoolClosed),
                Err(_) => return Err(self.acquire_timed_out()),
            }
        };

        self.checkout(permit, deadline).await
    }

    /// 立即准入
    ///
    /// 没有空余许可时返回 `Ok(None)`，不会等待。
    pub async fn try_acquire(&self) -> Result<Option<PooledConnection<F>>> {
        self.ensure_open()?;

        let permit = match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Ok(None),
            Err(TryAcquireError::Closed) => return Err(AdmissionError::PoolClosed),
        };

        let deadline = Instant::now() + Duration::from_millis(self.inner.config.acquire_timeout_ms);
        self.checkout(permit, deadline).await.map(Some)
    }

    fn acquire_timed_out(&self) -> AdmissionError {
        let timeout_ms = self.inner.config.acquire_timeout_ms;
        self.inner.counters.record_acquire_timeout();
        self.inner.emit(PoolEvent::AcquireTimedOut { timeout_ms });
        warn!(timeout_ms, waiting = self.inner.counters.waiting(), "获取连接超时");
        AdmissionError::AcquireTimeout { timeout_ms }
    }

    /// 持有许可后取出空闲连接或新建连接
    async fn checkout(
        &self,
        permit: OwnedSemaphorePermit,
        deadline: Instant,
    ) -> Result<PooledConnection<F>> {
        let idle_timeout = self.inner.idle_timeout();

        loop {
            let entry = self.inner.lock_idle().pop_back();
            let Some(mut entry) = entry else {
                break;
            };

            if entry.idle_since.elapsed() > idle_timeout {
                self.inner.retire(entry.id, entry.connection, "idle timeout").await;
                continue;
            }

            if !self.inner.factory.is_valid(&mut entry.connection).await {
                self.inner.retire(entry.id, entry.connection, "validation failed").await;
                continue;
            }

            return Ok(self.lease(entry.id, entry.connection, entry.created_at, permit));
        }

        let (id, connection, created_at) = self.create_connection(deadline).await?;
        Ok(self.lease(id, connection, created_at, permit))
    }

    fn lease(
        &self,
        id: ConnectionId,
        connection: F::Connection,
        created_at: Instant,
        permit: OwnedSemaphorePermit,
    ) -> PooledConnection<F> {
        self.inner.counters.record_acquired();
        self.inner.emit(PoolEvent::Acquired { id });
        PooledConnection::new(connection, id, created_at, Arc::clone(&self.inner), permit)
    }

    /// 建立新连接，失败时按间隔重试
    async fn create_connection(
        &self,
        deadline: Instant,
    ) -> Result<(ConnectionId, F::Connection, Instant)> {
        let config = &self.inner.config;
        let create_timeout = Duration::from_millis(config.create_timeout_ms);
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let message = match tokio::time::timeout(create_timeout, self.inner.factory.create()).await {
                Ok(Ok(connection)) => {
                    let id = self.inner.id_generator.next();
                    self.inner.counters.record_created();
                    self.inner.emit(PoolEvent::Connected { id });
                    debug!(connection_id = %id, attempts, "连接已建立");
                    return Ok((id, connection, Instant::now()));
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("建连超时 ({}ms)", config.create_timeout_ms),
            };

            self.inner.counters.record_create_error();
            self.inner.emit(PoolEvent::CreateFailed {
                attempt: attempts,
                message: message.clone(),
            });

            if config.propagate_create_error || attempts >= config.max_create_retries {
                warn!(attempts, error = %message, "建立连接失败，放弃重试");
                return Err(AdmissionError::ConnectionCreate { attempts, message });
            }

            let retry_at = Instant::now() + Duration::from_millis(config.retry_interval_ms);
            if retry_at >= deadline {
                return Err(self.acquire_timed_out());
            }

            warn!(
                attempt = attempts,
                retry_in_ms = config.retry_interval_ms,
                error = %message,
                "建立连接失败，稍后重试"
            );
            tokio::time::sleep_until(retry_at).await;
        }
    }

    /// 预热到最小连接数
    ///
    /// 建连失败只记录日志，返回实际新建的连接数。
    pub async fn warm_up(&self) -> usize {
        let mut created = 0;

        while !self.is_closed() && self.inner.counters.total() < self.inner.config.min {
            let deadline =
                Instant::now() + Duration::from_millis(self.inner.config.acquire_timeout_ms);

            match self.create_connection(deadline).await {
                Ok((id, connection, created_at)) => {
                    self.inner.lock_idle().push_back(IdleConnection {
                        id,
                        connection,
                        created_at,
                        idle_since: Instant::now(),
                    });
                    created += 1;
                }
                Err(e) => {
                    warn!(error = %e, "预热连接池失败");
                    break;
                }
            }
        }

        if created > 0 {
            info!(created, min = self.inner.config.min, "连接池预热完成");
        }
        created
    }

    /// 回收空闲超时的连接
    ///
    /// 至少保留 `min` 个存活连接，返回回收数量。
    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.inner.idle_timeout();

        let expired: Vec<_> = {
            let mut idle = self.inner.lock_idle();
            let mut removable = self
                .inner
                .counters
                .total()
                .saturating_sub(self.inner.config.min);
            let mut kept = VecDeque::with_capacity(idle.len());
            let mut expired = Vec::new();

            // 最早归还的排在前面
            while let Some(entry) = idle.pop_front() {
                if removable > 0 && entry.idle_since.elapsed() > idle_timeout {
                    removable -= 1;
                    expired.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *idle = kept;
            expired
        };

        let count = expired.len();
        for entry in expired {
            self.inner.retire(entry.id, entry.connection, "idle timeout").await;
        }
        count
    }

    /// 启动空闲回收任务
    ///
    /// 每隔 `reap_interval_ms` 执行一次，连接池关闭后退出。
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        let token = self.inner.shutdown.clone();
        let interval = Duration::from_millis(self.inner.config.reap_interval_ms.max(1));

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval_timer.tick() => {
                        let count = pool.reap_idle().await;
                        if count > 0 {
                            debug!(count, "回收了空闲连接");
                        }
                    }
                }
            }
        })
    }

    /// 当前状态快照
    pub fn stats(&self) -> PoolStats {
        let counters = &self.inner.counters;
        let idle = self.inner.lock_idle().len();

        PoolStats {
            max: self.inner.config.max,
            min: self.inner.config.min,
            total: counters.total(),
            idle,
            active: counters.active(),
            waiting: counters.waiting(),
            created: counters.created(),
            destroyed: counters.destroyed(),
            acquired: counters.acquired(),
            acquire_timeouts: counters.acquire_timeouts(),
            create_errors: counters.create_errors(),
        }
    }

    /// 关闭连接池
    ///
    /// 唤醒所有等待者（返回 `PoolClosed`），销毁空闲连接，停止回收任务。
    /// 之后归还的租约直接销毁。
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.inner.semaphore.close();
        self.inner.shutdown.cancel();

        let idle: Vec<_> = self.inner.lock_idle().drain(..).collect();
        let count = idle.len();
        for entry in idle {
            self.inner.retire(entry.id, entry.connection, "pool closed").await;
        }

        self.inner.emit(PoolEvent::Closed);
        info!(closed_idle = count, active = self.inner.counters.active(), "连接池已关闭");
    }
}
