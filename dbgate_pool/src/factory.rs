//! 连接工厂
//!
//! 连接池通过工厂创建、校验和销毁后端连接。

use async_trait::async_trait;
use dbgate_core::BoxError;

/// 连接工厂 trait
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// 工厂产出的连接类型
    type Connection: Send + 'static;

    /// 建立新连接
    async fn create(&self) -> Result<Self::Connection, BoxError>;

    /// 销毁连接
    async fn destroy(&self, _connection: Self::Connection) {}

    /// 复用前校验空闲连接
    async fn is_valid(&self, _connection: &mut Self::Connection) -> bool {
        true
    }

    /// 后端可达性探测
    async fn ping(&self) -> Result<(), BoxError> {
        Ok(())
    }
}
