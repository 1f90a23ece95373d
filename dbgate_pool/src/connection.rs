//! 连接 ID 和后端连接抽象
//!
//! 连接池本身不关心后端协议，只要求连接能执行语句。

use async_trait::async_trait;
use dbgate_core::BoxError;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// 连接唯一标识符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// 创建新的连接 ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// 获取内部值
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// 连接 ID 生成器
#[derive(Debug)]
pub struct ConnectionIdGenerator {
    next_id: AtomicU64,
}

impl ConnectionIdGenerator {
    /// 创建新的生成器
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    /// 生成下一个 ID
    pub fn next(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for ConnectionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// 查询结果
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    /// 返回的行
    pub rows: Vec<serde_json::Value>,
    /// 受影响的行数
    pub rows_affected: u64,
}

impl QueryResult {
    /// 只有受影响行数的结果
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
        }
    }
}

/// 后端连接
///
/// 由数据访问层的驱动适配器实现。
#[async_trait]
pub trait Connection: Send + 'static {
    /// 执行带参数的语句
    async fn query(
        &mut self,
        statement: &str,
        params: &[serde_json::Value],
    ) -> Result<QueryResult, BoxError>;

    /// 执行不带参数的语句（`BEGIN` / `COMMIT` / `ROLLBACK` 等）
    async fn execute(&mut self, statement: &str) -> Result<u64, BoxError> {
        self.query(statement, &[]).await.map(|r| r.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoConnection;

    #[async_trait]
    impl Connection for EchoConnection {
        async fn query(
            &mut self,
            statement: &str,
            params: &[serde_json::Value],
        ) -> Result<QueryResult, BoxError> {
            Ok(QueryResult {
                rows: vec![serde_json::json!({ "statement": statement })],
                rows_affected: params.len() as u64,
            })
        }
    }

    #[test]
    fn test_connection_id() {
        let id1 = ConnectionId::new(1);
        let id2 = ConnectionId::new(2);
        assert_ne!(id1, id2);
        assert_eq!(id1.value(), 1);
        assert_eq!(id1.to_string(), "conn-1");
    }

    #[test]
    fn test_id_generator() {
        let generator = ConnectionIdGenerator::new();
        let id1 = generator.next();
        let id2 = generator.next();
        assert_eq!(id1.value(), 1);
        assert_eq!(id2.value(), 2);
    }

    #[tokio::test]
    async fn test_default_execute_uses_query() {
        let mut conn = EchoConnection;
        let affected = conn.execute("BEGIN").await.unwrap();
        assert_eq!(affected, 0);

        let result = conn
            .query("SELECT $1", &[serde_json::json!(7)])
            .await
            .unwrap();
        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.rows[0]["statement"], "SELECT $1");
    }
}
