use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const DEFAULT_DIAGNOSTIC_CAPACITY: usize = 500;

/// Structured record of a degraded operation. Distinct from user-facing
/// notifications: a lookup that falls back to an empty list still lands
/// here so data problems stay observable in aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticEvent {
    pub source: String,
    pub code: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// Non-blocking toast payload for the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

impl Notification {
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            message: message.into(),
        }
    }
}

#[derive(Clone)]
pub struct Diagnostics {
    events: Arc<Mutex<VecDeque<DiagnosticEvent>>>,
    capacity: usize,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_DIAGNOSTIC_CAPACITY)
    }
}

impl Diagnostics {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, source: &str, code: &str, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::warn!(source = source, code = code, detail = %detail, "diagnostic event");

        let event = DiagnosticEvent {
            source: source.to_string(),
            code: code.to_string(),
            detail,
            at: Utc::now(),
        };
        let Ok(mut events) = self.events.lock() else {
            return;
        };
        events.push_back(event);
        while events.len() > self.capacity {
            events.pop_front();
        }
    }

    pub fn recent(&self, limit: usize) -> Vec<DiagnosticEvent> {
        let Ok(events) = self.events.lock() else {
            return Vec::new();
        };
        events.iter().rev().take(limit).cloned().collect()
    }

    pub fn prune(&self, keep: usize) {
        let Ok(mut events) = self.events.lock() else {
            return;
        };
        while events.len() > keep {
            events.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|events| events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
