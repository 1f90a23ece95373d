//! 错误上下文
//!
//! 后端错误只保留消息文本，出错请求的标签以 `key: value` 的形式附在后面。

use std::fmt;

/// 附加在错误上的键值
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    key: &'static str,
    value: String,
}

impl ErrorContext {
    pub fn new(key: &'static str, value: impl Into<String>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.value)
    }
}

impl From<(&'static str, &str)> for ErrorContext {
    fn from((key, value): (&'static str, &str)) -> Self {
        Self::new(key, value)
    }
}
