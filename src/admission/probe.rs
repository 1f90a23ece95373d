//! 默认健康探测：调用连接工厂的 `ping`

use async_trait::async_trait;
use dbgate_monitor::HealthProbe;
use dbgate_pool::{ConnectionFactory, ConnectionPool};

/// 通过连接工厂探测后端可达性
pub struct FactoryProbe<F: ConnectionFactory> {
    pool: ConnectionPool<F>,
}

impl<F: ConnectionFactory> FactoryProbe<F> {
    pub fn new(pool: ConnectionPool<F>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl<F: ConnectionFactory> HealthProbe for FactoryProbe<F> {
    async fn check(&self) -> Result<(), String> {
        self.pool.factory().ping().await.map_err(|e| e.to_string())
    }
}
