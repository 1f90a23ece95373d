//! 排队请求的执行容量：连接池中的一个连接

use async_trait::async_trait;
use dbgate_core::{AdmissionError, Result};
use dbgate_pool::{ConnectionFactory, ConnectionPool, PooledConnection};
use dbgate_queue::CapacityGate;
use tokio_util::sync::CancellationToken;

/// 以连接租约作为许可的容量闸门
///
/// 进入停机后不再等待连接，直接返回 `ShutdownInProgress`。
pub struct PoolGate<F: ConnectionFactory> {
    pool: ConnectionPool<F>,
    draining: CancellationToken,
}

impl<F: ConnectionFactory> PoolGate<F> {
    pub fn new(pool: ConnectionPool<F>, draining: CancellationToken) -> Self {
        Self { pool, draining }
    }
}

#[async_trait]
impl<F: ConnectionFactory> CapacityGate for PoolGate<F> {
    type Permit = PooledConnection<F>;

    async fn reserve(&self) -> Result<PooledConnection<F>> {
        tokio::select! {
            lease = self.pool.acquire() => lease,
            _ = self.draining.cancelled() => Err(AdmissionError::ShutdownInProgress),
        }
    }
}
