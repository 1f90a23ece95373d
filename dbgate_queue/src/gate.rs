//! 执行容量
//!
//! 处理循环先拿到许可，再取出当前优先级最高的请求，许可随请求一起交给操作。
//! 等待容量期间请求仍留在队列里，后到的高优先级请求可以排到前面。

use async_trait::async_trait;
use dbgate_core::Result;

/// 排队请求执行前必须拿到的容量
#[async_trait]
pub trait CapacityGate: Send + Sync + 'static {
    /// 许可，随操作一起释放
    type Permit: Send + 'static;

    /// 等待一个许可
    ///
    /// 返回 `AcquireTimeout` 时处理循环只清理已过期的请求并继续等待；
    /// 其他错误交给当前优先级最高的请求。
    async fn reserve(&self) -> Result<Self::Permit>;
}

/// 不限容量
#[derive(Debug, Default, Clone, Copy)]
pub struct Unbounded;

#[async_trait]
impl CapacityGate for Unbounded {
    type Permit = ();

    async fn reserve(&self) -> Result<()> {
        Ok(())
    }
}
