//! dbgate 有界连接池
//!
//! 约束同时借出的后端连接数，追踪活跃、空闲、等待计数并广播生命周期事件。

pub mod connection;
pub mod event;
pub mod factory;
pub mod lease;
pub mod metrics;
pub mod pool;

// 导出主要类型到 crate root
pub use crate::connection::{Connection, ConnectionId, ConnectionIdGenerator, QueryResult};
pub use crate::event::PoolEvent;
pub use crate::factory::ConnectionFactory;
pub use crate::lease::PooledConnection;
pub use crate::metrics::{PoolCounters, PoolStats};
pub use crate::pool::ConnectionPool;

// 预导出
pub mod prelude {
    pub use crate::connection::{Connection, QueryResult};
    pub use crate::factory::ConnectionFactory;
    pub use crate::lease::PooledConnection;
    pub use crate::pool::ConnectionPool;
}
