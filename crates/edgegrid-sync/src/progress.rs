//! Sinks for human-readable progress messages of long-running operations.

use std::sync::{Mutex, PoisonError};

use tracing::info;

pub trait Progress: Send + Sync {
    fn send(&self, msg: &str);
}

/// Writes progress messages to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl Progress for LogProgress {
    fn send(&self, msg: &str) {
        info!(%msg, "progress");
    }
}

/// Keeps every message, for inspection by tests and stream readers.
#[derive(Debug, Default)]
pub struct CollectProgress {
    msgs: Mutex<Vec<String>>,
}

impl CollectProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.msgs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|m| m.contains(needle))
    }
}

impl Progress for CollectProgress {
    fn send(&self, msg: &str) {
        self.msgs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(msg.to_string());
    }
}
