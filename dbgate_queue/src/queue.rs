//! 请求队列
//!
//! 暂存无法立即准入的请求。处理循环是唯一的消费者：先从 [`CapacityGate`] 拿到许可，
//! 再取出优先级最高的请求；截止时间已过则直接拒绝，否则等待它执行完成后才处理下一个。

use crate::gate::{CapacityGate, Unbounded};
use crate::request::{PendingOperation, QueuedRequest};
use dbgate_config::QueueConfig;
use dbgate_core::{AdmissionError, AdmissionErrorKind, RequestState, Result, SharedClock};
use serde::Serialize;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// 清空队列的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearReason {
    /// 停机：拒绝所有待处理请求并关闭队列
    Shutdown,
    /// 管理操作重置：拒绝所有待处理请求，队列继续可用
    Reset,
}

impl ClearReason {
    fn error(&self) -> AdmissionError {
        match self {
            ClearReason::Shutdown => AdmissionError::ShutdownInProgress,
            ClearReason::Reset => AdmissionError::QueueCleared,
        }
    }
}

/// 排队结果
///
/// 请求结束（执行完成、超时或被清空）时就绪。
pub struct QueueTicket<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Future for QueueTicket<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(AdmissionError::operation("排队的操作异常终止")))
        })
    }
}

/// 队列内部状态，只在锁内修改
struct QueueState<P> {
    heap: BinaryHeap<QueuedRequest<P>>,
    next_sequence: u64,
    processing: bool,
    closed: bool,
}

impl<P> Default for QueueState<P> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence: 0,
            processing: false,
            closed: false,
        }
    }
}

/// 队列累计计数
#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    executed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    rejected_full: AtomicU64,
    rejected_shutdown: AtomicU64,
    cleared: AtomicU64,
}

/// 队列状态快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    /// 当前排队数
    pub len: usize,
    /// 队列上限
    pub max_size: usize,
    /// 处理循环是否在运行
    pub processing: bool,
    /// 累计入队数
    pub enqueued: u64,
    /// 累计执行数
    pub executed: u64,
    /// 执行失败数
    pub failed: u64,
    /// 排队超时数
    pub timed_out: u64,
    /// 因队列已满被拒绝的数量
    pub rejected_full: u64,
    /// 因停机被拒绝的数量
    pub rejected_shutdown: u64,
    /// 被清空的数量
    pub cleared: u64,
}

struct QueueInner<G: CapacityGate> {
    max_size: usize,
    clock: SharedClock,
    gate: G,
    state: Mutex<QueueState<G::Permit>>,
    counters: QueueCounters,
}

impl<G: CapacityGate> QueueInner<G> {
    fn lock_state(&self) -> MutexGuard<'_, QueueState<G::Permit>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 队列为空时结束处理循环
    fn stop_if_idle(&self) -> bool {
        let mut state = self.lock_state();
        if state.heap.is_empty() {
            state.processing = false;
            true
        } else {
            false
        }
    }

    /// 取出优先级最高且未过期的请求，途中遇到的过期请求直接拒绝
    ///
    /// 队列取空时结束处理循环并返回 `None`。
    fn next_live(&self) -> Option<QueuedRequest<G::Permit>> {
        loop {
            let request = {
                let mut state = self.lock_state();
                match state.heap.pop() {
                    Some(request) => request,
                    None => {
                        state.processing = false;
                        return None;
                    }
                }
            };

            let now = self.clock.now_ms();
            if request.is_expired(now) {
                self.expire(request, now);
            } else {
                return Some(request);
            }
        }
    }

    /// 等待容量超时后，拒绝所有已过截止时间的请求，其余留在队列中
    fn sweep_expired(&self) {
        let now = self.clock.now_ms();
        let expired: Vec<QueuedRequest<G::Permit>> = {
            let mut state = self.lock_state();
            let (expired, live): (Vec<_>, Vec<_>) =
                state.heap.drain().partition(|request| request.is_expired(now));
            state.heap.extend(live);
            expired
        };

        for request in expired {
            self.expire(request, now);
        }
    }

    fn expire(&self, mut request: QueuedRequest<G::Permit>, now: u64) {
        let waited_ms = now.saturating_sub(request.enqueue_time_ms);
        request.transition(RequestState::TimedOut);
        warn!(
            sequence = request.sequence,
            waited_ms,
            timeout_ms = request.timeout_ms,
            "排队请求已超时"
        );
        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
        request.transition(RequestState::Rejected);
        let timeout_ms = request.timeout_ms;
        request.reject(AdmissionError::QueueTimeout {
            waited_ms,
            timeout_ms,
        });
    }
}

/// 优先级请求队列
pub struct RequestQueue<G: CapacityGate = Unbounded> {
    inner: Arc<QueueInner<G>>,
}

impl<G: CapacityGate> Clone for RequestQueue<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<G: CapacityGate> RequestQueue<G> {
    /// 创建新的请求队列
    pub fn new(config: &QueueConfig, clock: SharedClock, gate: G) -> Self {
        Self::with_max_size(config.max_queue_size, clock, gate)
    }

    /// 指定上限创建
    pub fn with_max_size(max_size: usize, clock: SharedClock, gate: G) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                max_size,
                clock,
                gate,
                state: Mutex::new(QueueState::default()),
                counters: QueueCounters::default(),
            }),
        }
    }

    /// 入队并等待执行结果
    ///
    /// 队列已满时立即返回 `QueueFull`；队列已关闭时返回 `ShutdownInProgress`。
    /// 否则挂起，直到请求被执行、超时或被清空。
    pub async fn enqueue<F, Fut, T>(&self, operation: F, priority: i32, timeout: Duration) -> Result<T>
    where
        F: FnOnce(G::Permit) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(operation, priority, timeout)?.await
    }

    /// 同步入队，返回等待结果的 future
    ///
    /// 返回时请求已经在队列中，调用方可以立即读取新的队列长度。
    pub fn submit<F, Fut, T>(
        &self,
        operation: F,
        priority: i32,
        timeout: Duration,
    ) -> Result<QueueTicket<T>>
    where
        F: FnOnce(G::Permit) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, receiver) = oneshot::channel();
        let counters = &self.inner.counters;

        let start_loop = {
            let mut state = self.inner.lock_state();

            if state.closed {
                counters.rejected_shutdown.fetch_add(1, Ordering::Relaxed);
                return Err(AdmissionError::ShutdownInProgress);
            }

            if state.heap.len() >= self.inner.max_size {
                counters.rejected_full.fetch_add(1, Ordering::Relaxed);
                warn!(max_size = self.inner.max_size, priority, "请求队列已满，拒绝入队");
                return Err(AdmissionError::QueueFull {
                    max_size: self.inner.max_size,
                });
            }

            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.heap.push(QueuedRequest::new(
                sequence,
                priority,
                self.inner.clock.now_ms(),
                timeout.as_millis() as u64,
                Box::new(PendingOperation::new(operation, reply)),
            ));
            counters.enqueued.fetch_add(1, Ordering::Relaxed);
            debug!(sequence, priority, queued = state.heap.len(), "请求已入队");

            !std::mem::replace(&mut state.processing, true)
        };

        if start_loop {
            tokio::spawn(Self::process(Arc::clone(&self.inner)));
        }

        Ok(QueueTicket { receiver })
    }

    /// 处理循环
    ///
    /// 等待许可期间请求留在堆里，许可到手后才决定执行哪一个。
    async fn process(inner: Arc<QueueInner<G>>) {
        loop {
            if inner.stop_if_idle() {
                return;
            }

            match inner.gate.reserve().await {
                Ok(permit) => {
                    let Some(request) = inner.next_live() else {
                        return;
                    };
                    Self::execute(&inner, request, permit).await;
                }
                Err(err) if err.kind() == AdmissionErrorKind::AcquireTimeout => {
                    debug!(error = %err, "等待执行容量超时");
                    inner.sweep_expired();
                }
                Err(err) => {
                    let Some(mut request) = inner.next_live() else {
                        return;
                    };
                    warn!(sequence = request.sequence, error = %err, "无法获得执行容量");
                    request.transition(RequestState::Executing);
                    request.transition(RequestState::Rejected);
                    request.reject(err);
                }
            }
        }
    }

    async fn execute(inner: &QueueInner<G>, mut request: QueuedRequest<G::Permit>, permit: G::Permit) {
        let Some(run) = request.start(permit) else {
            return;
        };

        // 在独立任务中执行，操作 panic 不会拖垮处理循环
        let success = tokio::spawn(run).await.unwrap_or(false);

        inner.counters.executed.fetch_add(1, Ordering::Relaxed);
        if !success {
            inner.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        request.transition(if success {
            RequestState::Resolved
        } else {
            RequestState::Rejected
        });
        debug!(sequence = request.sequence, state = %request.state(), "排队请求执行完毕");
    }

    /// 清空队列
    ///
    /// 拒绝所有待处理请求并返回数量；正在执行的请求不受影响。
    pub fn clear(&self, reason: ClearReason) -> usize {
        let drained: Vec<QueuedRequest<G::Permit>> = {
            let mut state = self.inner.lock_state();
            if reason == ClearReason::Shutdown {
                state.closed = true;
            }
            state.heap.drain().collect()
        };

        let count = drained.len();
        for mut request in drained {
            request.transition(RequestState::RejectedShutdown);
            request.transition(RequestState::Rejected);
            request.reject(reason.error());
        }

        self.inner
            .counters
            .cleared
            .fetch_add(count as u64, Ordering::Relaxed);
        if count > 0 {
            info!(count, ?reason, "请求队列已清空");
        }
        count
    }

    /// 当前排队数
    pub fn len(&self) -> usize {
        self.inner.lock_state().heap.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 队列上限
    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    /// 处理循环是否在运行
    pub fn is_processing(&self) -> bool {
        self.inner.lock_state().processing
    }

    /// 是否已因停机关闭
    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// 状态快照
    pub fn stats(&self) -> QueueStats {
        let (len, processing) = {
            let state = self.inner.lock_state();
            (state.heap.len(), state.processing)
        };
        let counters = &self.inner.counters;

        QueueStats {
            len,
            max_size: self.inner.max_size,
            processing,
            enqueued: counters.enqueued.load(Ordering::Relaxed),
            executed: counters.executed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            timed_out: counters.timed_out.load(Ordering::Relaxed),
            rejected_full: counters.rejected_full.load(Ordering::Relaxed),
            rejected_shutdown: counters.rejected_shutdown.load(Ordering::Relaxed),
            cleared: counters.cleared.load(Ordering::Relaxed),
        }
    }
}
