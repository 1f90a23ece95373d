//! 连接租约
//!
//! 借出期间调用方独占连接；租约被丢弃时连接自动归还，
//! 内部持有的信号量许可随之释放。

use crate::connection::ConnectionId;
use crate::factory::ConnectionFactory;
use crate::pool::PoolInner;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

/// 借出的连接
pub struct PooledConnection<F: ConnectionFactory> {
    connection: Option<F::Connection>,
    id: ConnectionId,
    created_at: Instant,
    acquired_at: Instant,
    discard: bool,
    pool: Arc<PoolInner<F>>,
    // 最后一个字段：在连接放回空闲集合之后才释放许可
    _permit: OwnedSemaphorePermit,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub(crate) fn new(
        connection: F::Connection,
        id: ConnectionId,
        created_at: Instant,
        pool: Arc<PoolInner<F>>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            connection: Some(connection),
            id,
            created_at,
            acquired_at: Instant::now(),
            discard: false,
            pool,
            _permit: permit,
        }
    }

    /// 连接 ID
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// 本次借出已持有的时间
    pub fn held_for(&self) -> std::time::Duration {
        self.acquired_at.elapsed()
    }

    /// 归还连接
    pub fn release(self) {
        drop(self);
    }

    /// 丢弃连接而不是放回空闲集合
    ///
    /// 用于状态未知的连接，例如语句超时后被中断的连接。
    pub fn discard(mut self) {
        self.discard = true;
        drop(self);
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        // 只有 Drop 会取走连接
        self.connection.as_ref().expect("connection taken before drop")
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection.as_mut().expect("connection taken before drop")
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("held_for", &self.held_for())
            .field("discard", &self.discard)
            .finish()
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool
                .return_connection(self.id, connection, self.created_at, self.discard);
        }
    }
}
