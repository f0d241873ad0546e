//! Bounded diagnostic history kept per server run.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Maximum stderr lines retained.
pub const MAX_STDERR_LINES: usize = 200;

/// Maximum error records retained.
pub const MAX_ERRORS: usize = 50;

/// One recorded failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Extra context such as an error source chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Recent stderr output and errors for the current run.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticHistory {
    stderr: VecDeque<String>,
    errors: VecDeque<ErrorRecord>,
}

impl DiagnosticHistory {
    pub fn push_stderr(&mut self, line: String) {
        push_bounded(&mut self.stderr, line, MAX_STDERR_LINES);
    }

    pub fn push_error(&mut self, message: impl Into<String>, detail: Option<String>) {
        let record = ErrorRecord {
            message: message.into(),
            detail,
            at: Utc::now(),
        };
        push_bounded(&mut self.errors, record, MAX_ERRORS);
    }

    pub fn clear(&mut self) {
        self.stderr.clear();
        self.errors.clear();
    }

    pub fn stderr(&self) -> Vec<String> {
        self.stderr.iter().cloned().collect()
    }

    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }
}

fn push_bounded<T>(log: &mut VecDeque<T>, item: T, cap: usize) {
    if log.len() == cap {
        log.pop_front();
    }
    log.push_back(item);
}

/// Render an error and its source chain as one detail string.
pub fn error_chain(error: &(dyn std::error::Error + 'static)) -> Option<String> {
    let mut source = error.source();
    let mut parts = Vec::new();
    while let Some(err) = source {
        parts.push(err.to_string());
        source = err.source();
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(": "))
    }
}
