//! 连接池生命周期事件

use crate::connection::ConnectionId;

/// 连接池事件
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// 新连接已建立
    Connected { id: ConnectionId },

    /// 连接被借出
    Acquired { id: ConnectionId },

    /// 连接归还到空闲集合
    Released { id: ConnectionId },

    /// 连接被移除
    Removed { id: ConnectionId, reason: &'static str },

    /// 建连失败（会按间隔重试）
    CreateFailed { attempt: u32, message: String },

    /// 获取连接超时
    AcquireTimedOut { timeout_ms: u64 },

    /// 连接池已关闭
    Closed,
}
