//! 排队请求
//!
//! 队列中的元素按优先级降序、到达顺序升序排列。操作本身被类型擦除，
//! 结果通过 oneshot 通道交还给挂起的调用方。

use dbgate_core::{AdmissionError, RequestState, Result};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use tokio::sync::oneshot;
use tracing::trace;

/// 类型擦除后的排队操作，`P` 为执行时拿到的容量许可
pub(crate) trait QueuedTask<P>: Send {
    /// 执行操作，返回是否成功
    fn run(self: Box<Self>, permit: P) -> BoxFuture<'static, bool>;

    /// 不执行，直接以错误结束
    fn reject(self: Box<Self>, error: AdmissionError);
}

/// 持有调用方回执的待执行操作
pub(crate) struct PendingOperation<F, T> {
    operation: F,
    reply: oneshot::Sender<Result<T>>,
}

impl<F, T> PendingOperation<F, T> {
    pub(crate) fn new(operation: F, reply: oneshot::Sender<Result<T>>) -> Self {
        Self { operation, reply }
    }
}

impl<F, Fut, T, P> QueuedTask<P> for PendingOperation<F, T>
where
    F: FnOnce(P) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
    P: Send + 'static,
{
    fn run(self: Box<Self>, permit: P) -> BoxFuture<'static, bool> {
        let PendingOperation { operation, reply } = *self;

        async move {
            let result = operation(permit).await;
            let success = result.is_ok();
            // 调用方可能已经放弃等待
            let _ = reply.send(result);
            success
        }
        .boxed()
    }

    fn reject(self: Box<Self>, error: AdmissionError) {
        let _ = self.reply.send(Err(error));
    }
}

/// 排队请求
pub struct QueuedRequest<P = ()> {
    /// 到达序号，同一毫秒内也保持先来先服务
    pub(crate) sequence: u64,
    /// 优先级，数值越大越先执行
    pub(crate) priority: i32,
    /// 入队时间（毫秒）
    pub(crate) enqueue_time_ms: u64,
    /// 排队超时（毫秒）
    pub(crate) timeout_ms: u64,
    pub(crate) state: RequestState,
    pub(crate) task: Option<Box<dyn QueuedTask<P>>>,
}

impl<P> QueuedRequest<P> {
    pub(crate) fn new(
        sequence: u64,
        priority: i32,
        enqueue_time_ms: u64,
        timeout_ms: u64,
        task: Box<dyn QueuedTask<P>>,
    ) -> Self {
        Self {
            sequence,
            priority,
            enqueue_time_ms,
            timeout_ms,
            state: RequestState::Pending,
            task: Some(task),
        }
    }

    /// 到达序号
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// 优先级
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// 入队时间
    pub fn enqueue_time_ms(&self) -> u64 {
        self.enqueue_time_ms
    }

    /// 排队超时
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// 当前状态
    pub fn state(&self) -> RequestState {
        self.state
    }

    /// 截止时间已过
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.enqueue_time_ms.saturating_add(self.timeout_ms) < now_ms
    }

    pub(crate) fn transition(&mut self, next: RequestState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "非法状态迁移: {} -> {}",
            self.state,
            next
        );
        trace!(sequence = self.sequence, from = %self.state, to = %next, "排队请求状态变化");
        self.state = next;
    }

    /// 进入执行状态，返回执行操作的 future
    pub(crate) fn start(&mut self, permit: P) -> Option<BoxFuture<'static, bool>> {
        self.transition(RequestState::Executing);
        self.task.take().map(|task| task.run(permit))
    }

    /// 以错误结束，不执行操作
    pub(crate) fn reject(&mut self, error: AdmissionError) {
        if let Some(task) = self.task.take() {
            task.reject(error);
        }
    }
}

impl<P> fmt::Debug for QueuedRequest<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedRequest")
            .field("sequence", &self.sequence)
            .field("priority", &self.priority)
            .field("enqueue_time_ms", &self.enqueue_time_ms)
            .field("timeout_ms", &self.timeout_ms)
            .field("state", &self.state)
            .finish()
    }
}

impl<P> PartialEq for QueuedRequest<P> {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl<P> Eq for QueuedRequest<P> {}

impl<P> PartialOrd for QueuedRequest<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for QueuedRequest<P> {
    // BinaryHeap 是大顶堆：优先级高者为大，同优先级下先到者为大
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    fn request(sequence: u64, priority: i32, enqueue_time_ms: u64) -> QueuedRequest {
        let (tx, _rx) = oneshot::channel::<Result<()>>();
        QueuedRequest::new(
            sequence,
            priority,
            enqueue_time_ms,
            100,
            Box::new(PendingOperation::new(|_: ()| async { Ok::<_, AdmissionError>(()) }, tx)),
        )
    }

    #[test]
    fn test_heap_order() {
        let mut heap = BinaryHeap::new();
        heap.push(request(1, 0, 10));
        heap.push(request(2, 0, 10));
        heap.push(request(3, 10, 20));
        heap.push(request(4, 5, 30));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|r| r.sequence)).collect();
        assert_eq!(order, vec![3, 4, 1, 2]);
    }

    #[test]
    fn test_expiry_is_strict() {
        let req = request(1, 0, 1_000);
        assert!(!req.is_expired(1_050));
        assert!(!req.is_expired(1_100));
        assert!(req.is_expired(1_101));
    }

    #[tokio::test]
    async fn test_start_hands_out_operation() {
        let mut req = request(1, 0, 0);
        let run = req.start(()).unwrap();
        assert_eq!(req.state(), RequestState::Executing);
        assert!(run.await);

        req.transition(RequestState::Resolved);
        assert!(req.state().is_terminal());
        assert!(req.task.is_none());
    }

    #[tokio::test]
    async fn test_reject_delivers_error() {
        let (tx, rx) = oneshot::channel::<Result<u32>>();
        let task: Box<dyn QueuedTask<()>> =
            Box::new(PendingOperation::new(|_: ()| async { Ok::<u32, AdmissionError>(1) }, tx));
        task.reject(AdmissionError::QueueCleared);
        assert!(matches!(rx.await.unwrap(), Err(AdmissionError::QueueCleared)));
    }

    #[tokio::test]
    async fn test_run_receives_permit() {
        let (tx, rx) = oneshot::channel::<Result<u32>>();
        let task: Box<dyn QueuedTask<u32>> = Box::new(PendingOperation::new(
            |permit: u32| async move { Ok::<u32, AdmissionError>(permit * 2) },
            tx,
        ));
        assert!(task.run(21).await);
        assert_eq!(rx.await.unwrap().unwrap(), 42);
    }
}
