//! 连接池计数器
//!
//! 每次建连、借出、归还、移除都会更新这里的计数，监控模块读取快照。

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 连接池计数器
#[derive(Debug, Default)]
pub struct PoolCounters {
    /// 当前存活连接数（空闲 + 借出）
    total: AtomicUsize,
    /// 当前借出的连接数
    active: AtomicUsize,
    /// 正在等待连接的调用方
    waiting: AtomicUsize,
    /// 累计建立的连接数
    created: AtomicU64,
    /// 累计销毁的连接数
    destroyed: AtomicU64,
    /// 累计借出次数
    acquired: AtomicU64,
    /// 累计获取超时次数
    acquire_timeouts: AtomicU64,
    /// 累计建连失败次数
    create_errors: AtomicU64,
}

impl PoolCounters {
    /// 创建新的计数器
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录新建连接
    pub fn record_created(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录销毁连接
    pub fn record_destroyed(&self) {
        self.total.fetch_sub(1, Ordering::Relaxed);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录借出
    pub fn record_acquired(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录归还或丢弃借出的连接
    pub fn record_returned(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// 记录获取超时
    pub fn record_acquire_timeout(&self) {
        self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录建连失败
    pub fn record_create_error(&self) {
        self.create_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_waiting(&self) {
        self.waiting.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_waiting(&self) {
        self.waiting.fetch_sub(1, Ordering::Relaxed);
    }

    /// 当前存活连接数
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// 当前借出连接数
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// 当前等待者数量
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Relaxed)
    }

    /// 累计建立连接数
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// 累计销毁连接数
    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    /// 累计借出次数
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    /// 累计获取超时次数
    pub fn acquire_timeouts(&self) -> u64 {
        self.acquire_timeouts.load(Ordering::Relaxed)
    }

    /// 累计建连失败次数
    pub fn create_errors(&self) -> u64 {
        self.create_errors.load(Ordering::Relaxed)
    }
}

/// 等待计数守卫
///
/// 等待方被取消（例如外层超时丢弃了 future）时也能正确减计数。
pub(crate) struct WaitingGuard<'a> {
    counters: &'a PoolCounters,
}

impl<'a> WaitingGuard<'a> {
    pub(crate) fn new(counters: &'a PoolCounters) -> Self {
        counters.inc_waiting();
        Self { counters }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.counters.dec_waiting();
    }
}

/// 连接池状态快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    /// 最大连接数
    pub max: usize,
    /// 最小连接数
    pub min: usize,
    /// 存活连接数
    pub total: usize,
    /// 空闲连接数
    pub idle: usize,
    /// 借出连接数
    pub active: usize,
    /// 等待者数量
    pub waiting: usize,
    /// 累计建立连接数
    pub created: u64,
    /// 累计销毁连接数
    pub destroyed: u64,
    /// 累计借出次数
    pub acquired: u64,
    /// 累计获取超时次数
    pub acquire_timeouts: u64,
    /// 累计建连失败次数
    pub create_errors: u64,
}

impl PoolStats {
    /// 借出连接占最大连接数的比例
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        self.active as f64 / self.max as f64
    }

    /// 是否没有未归还的连接
    pub fn is_drained(&self) -> bool {
        self.active == 0
    }

    /// 生成摘要报告
    pub fn summary(&self) -> String {
        format!(
            "连接池状态:\n\
             - 存活连接: {}/{}\n\
             - 空闲连接: {}\n\
             - 借出连接: {}\n\
             - 等待者: {}\n\
             - 获取超时: {}\n\
             - 建连失败: {}",
            self.total,
            self.max,
            self.idle,
            self.active,
            self.waiting,
            self.acquire_timeouts,
            self.create_errors
        )
    }
}
