//! 停机协调
//!
//! `Running → Draining → Closed`。进入 Draining 后新请求一律以
//! `ShutdownInProgress` 拒绝，排队请求被清空，然后等待借出的连接归还，
//! 超时则强制关闭连接池。

use super::gate::PoolGate;
use dbgate_config::ShutdownConfig;
use dbgate_pool::{ConnectionFactory, ConnectionPool};
use dbgate_queue::{CapacityGate, ClearReason, RequestQueue};
use serde::Serialize;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// 正常服务
    Running,
    /// 停机中，拒绝新请求并等待借出的连接归还
    Draining,
    /// 已关闭
    Closed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Running => "running",
            LifecycleState::Draining => "draining",
            LifecycleState::Closed => "closed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 停机结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// 被拒绝的排队请求数
    pub rejected_queued: usize,
    /// 借出的连接是否全部归还
    pub drained: bool,
    /// 是否因超时强制关闭
    pub forced: bool,
    /// 停机耗时（毫秒）
    pub elapsed_ms: u64,
}

/// 停机协调器
pub struct ShutdownCoordinator<F: ConnectionFactory, G: CapacityGate = PoolGate<F>> {
    config: ShutdownConfig,
    pool: ConnectionPool<F>,
    queue: RequestQueue<G>,
    background: CancellationToken,
    draining: CancellationToken,
    state: watch::Sender<LifecycleState>,
    report: Mutex<Option<ShutdownReport>>,
}

impl<F: ConnectionFactory, G: CapacityGate> ShutdownCoordinator<F, G> {
    /// 创建协调器
    ///
    /// `background` 在停机完成时取消，用于结束后台任务；`draining` 在进入
    /// Draining 后取消，正在等待连接的处理循环据此放弃等待。
    pub fn new(
        config: ShutdownConfig,
        pool: ConnectionPool<F>,
        queue: RequestQueue<G>,
        background: CancellationToken,
        draining: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::Running);

        Self {
            config,
            pool,
            queue,
            background,
            draining,
            state,
            report: Mutex::new(None),
        }
    }

    /// 当前状态
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// 是否仍在接收请求
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// 停机
    ///
    /// 可重复调用：已关闭时直接返回上次的结果，停机进行中时等待其完成。
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut initiated = false;
        self.state.send_if_modified(|state| {
            if *state == LifecycleState::Running {
                *state = LifecycleState::Draining;
                initiated = true;
                true
            } else {
                false
            }
        });

        if !initiated {
            return self.wait_closed().await;
        }

        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.timeout_ms);
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        info!(timeout_ms = self.config.timeout_ms, "开始停机，拒绝新的请求");

        // 先清空队列，处理循环醒来时已无请求可取
        let rejected_queued = self.queue.clear(ClearReason::Shutdown);
        self.draining.cancel();

        let drained = loop {
            let stats = self.pool.stats();
            if stats.is_drained() {
                break true;
            }
            let active = stats.active;

            let now = Instant::now();
            if now >= deadline {
                warn!(active, "等待连接归还超时，强制关闭连接池");
                break false;
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        };

        self.pool.close().await;
        self.background.cancel();

        let report = ShutdownReport {
            rejected_queued,
            drained,
            forced: !drained,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        *self.report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        self.state.send_replace(LifecycleState::Closed);

        info!(
            rejected_queued,
            drained,
            elapsed_ms = report.elapsed_ms,
            "停机完成"
        );
        report
    }

    async fn wait_closed(&self) -> ShutdownReport {
        let mut receiver = self.state.subscribe();
        // 发送端由自身持有，不会提前关闭
        let _ = receiver
            .wait_for(|state| *state == LifecycleState::Closed)
            .await;

        self.report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }
}

impl<F: ConnectionFactory, G: CapacityGate> fmt::Debug for ShutdownCoordinator<F, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dbgate_config::PoolConfig;
    use dbgate_core::{AdmissionError, AdmissionErrorKind, BoxError, system_clock};
    use dbgate_queue::Unbounded;
    use std::sync::Arc;

    struct NullFactory;

    #[async_trait]
    impl ConnectionFactory for NullFactory {
        type Connection = ();

        async fn create(&self) -> Result<(), BoxError> {
            Ok(())
        }
    }

    fn coordinator(timeout_ms: u64) -> Arc<ShutdownCoordinator<NullFactory, Unbounded>> {
        let pool = ConnectionPool::new(
            PoolConfig {
                max: 2,
                min: 0,
                ..Default::default()
            },
            NullFactory,
        );
        let queue = RequestQueue::with_max_size(8, system_clock(), Unbounded);
        Arc::new(ShutdownCoordinator::new(
            ShutdownConfig {
                timeout_ms,
                poll_interval_ms: 10,
            },
            pool,
            queue,
            CancellationToken::new(),
            CancellationToken::new(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_idle_completes_immediately() {
        let coordinator = coordinator(1_000);
        let report = coordinator.shutdown().await;

        assert!(report.drained);
        assert!(!report.forced);
        assert_eq!(report.rejected_queued, 0);
        assert_eq!(coordinator.state(), LifecycleState::Closed);
        assert!(coordinator.pool.is_closed());
        assert!(coordinator.background.is_cancelled());
        assert!(coordinator.draining.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_lease() {
        let coordinator = coordinator(1_000);
        let lease = coordinator.pool.acquire().await.unwrap();

        let handle = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(coordinator.state(), LifecycleState::Draining);

        drop(lease);
        let report = handle.await.unwrap();
        assert!(report.drained);
        assert!(report.elapsed_ms >= 100);
        assert!(report.elapsed_ms < 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_forced_after_timeout() {
        let coordinator = coordinator(500);
        let _lease = coordinator.pool.acquire().await.unwrap();

        let report = coordinator.shutdown().await;
        assert!(!report.drained);
        assert!(report.forced);
        assert_eq!(report.elapsed_ms, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent() {
        let coordinator = coordinator(1_000);
        let lease = coordinator.pool.acquire().await.unwrap();

        let first = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // 停机进行中再次调用会等待同一次停机完成
        let second = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lease);

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert_eq!(first, second);

        let third = coordinator.shutdown().await;
        assert_eq!(third, first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_rejects_queued() {
        let coordinator = coordinator(1_000);
        let queue = coordinator.queue.clone();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

        let blocker = queue
            .submit(
                move |_| async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<(), AdmissionError>(())
                },
                0,
                Duration::from_secs(30),
            )
            .unwrap();
        started_rx.await.unwrap();

        let pending: Vec<_> = (0..3)
            .map(|_| {
                queue
                    .submit(|_| async { Ok::<(), AdmissionError>(()) }, 0, Duration::from_secs(30))
                    .unwrap()
            })
            .collect();

        let report = coordinator.shutdown().await;
        assert_eq!(report.rejected_queued, 3);
        for ticket in pending {
            assert_eq!(
                ticket.await.unwrap_err().kind(),
                AdmissionErrorKind::ShutdownInProgress
            );
        }

        release_tx.send(()).unwrap();
        blocker.await.unwrap();
    }
}
