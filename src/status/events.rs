use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// One structured event as shown to the status reporter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub symbol: Option<String>,
    pub message: String,
}

/// Bounded ring buffer of recent events, mirrored to `tracing`
///
/// Cloning shares the same buffer.
#[derive(Clone)]
pub struct EventLog {
    events: Arc<Mutex<VecDeque<LogEvent>>>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn record(&self, severity: Severity, symbol: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        let tag = symbol.unwrap_or("-");

        match severity {
            Severity::Info => tracing::info!(symbol = %tag, "{}", message),
            Severity::Success => tracing::info!(symbol = %tag, outcome = "success", "{}", message),
            Severity::Warning => tracing::warn!(symbol = %tag, "{}", message),
            Severity::Error => tracing::error!(symbol = %tag, "{}", message),
        }

        let mut events = self.lock();
        events.push_back(LogEvent {
            timestamp: Utc::now(),
            severity,
            symbol: symbol.map(str::to_string),
            message,
        });
        while events.len() > self.capacity {
            events.pop_front();
        }
    }

    pub fn info(&self, symbol: Option<&str>, message: impl Into<String>) {
        self.record(Severity::Info, symbol, message);
    }

    pub fn success(&self, symbol: Option<&str>, message: impl Into<String>) {
        self.record(Severity::Success, symbol, message);
    }

    pub fn warning(&self, symbol: Option<&str>, message: impl Into<String>) {
        self.record(Severity::Warning, symbol, message);
    }

    pub fn error(&self, symbol: Option<&str>, message: impl Into<String>) {
        self.record(Severity::Error, symbol, message);
    }

    /// Oldest first
    pub fn recent(&self) -> Vec<LogEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEvent>> {
        // A panic while holding the lock cannot leave the deque half-written
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
