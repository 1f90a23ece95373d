//! Per-request admission options

use serde::{Deserialize, Serialize};

/// Options attached to a single admitted operation
///
/// # Example
///
/// ```rust
/// use dbgate::QueryOptions;
///
/// let options = QueryOptions::new()
///     .priority(10)
///     .timeout_ms(2_000)
///     .label("messages.list");
/// assert_eq!(options.priority, 10);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryOptions {
    /// Higher values are dequeued first when the pool is saturated
    pub priority: i32,
    /// How long the request may wait in the queue; falls back to the
    /// configured `queue.default_timeout_ms`
    pub timeout_ms: Option<u64>,
    /// Label used for metrics and logs
    pub label: Option<String>,
}

impl QueryOptions {
    /// Create options with default priority and timeout
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the queue priority
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the queue timeout in milliseconds
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Set the metrics label
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub(crate) fn label_or(&self, fallback: &str) -> String {
        self.label.clone().unwrap_or_else(|| fallback.to_string())
    }
}
