//! 请求状态机
//!
//! `Pending → {Executing | TimedOut | RejectedFull | RejectedShutdown} → {Resolved | Rejected}`

use serde::Serialize;
use std::fmt;

/// 单个请求的生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// 等待准入
    Pending,
    /// 正在执行
    Executing,
    /// 排队超时
    TimedOut,
    /// 队列已满被拒绝
    RejectedFull,
    /// 停机或清空时被拒绝
    RejectedShutdown,
    /// 成功完成
    Resolved,
    /// 以错误结束
    Rejected,
}

impl RequestState {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Resolved | RequestState::Rejected)
    }

    /// 检查状态迁移是否合法
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;

        match (self, next) {
            (Pending, Executing | TimedOut | RejectedFull | RejectedShutdown) => true,
            (Executing, Resolved | Rejected) => true,
            (TimedOut | RejectedFull | RejectedShutdown, Rejected) => true,
            _ => false,
        }
    }

    /// 状态名称
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::Executing => "executing",
            RequestState::TimedOut => "timed_out",
            RequestState::RejectedFull => "rejected_full",
            RequestState::RejectedShutdown => "rejected_shutdown",
            RequestState::Resolved => "resolved",
            RequestState::Rejected => "rejected",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
