//! Where session output goes.
//!
//! The session never renders anything itself: goals, messages and errors
//! are handed to a [`SessionSink`]. Callbacks run on the session's worker
//! threads, never while session state is locked.

use std::sync::Mutex;

use crate::protocol::{ErrorInfo, Goals};

/// Receiver of everything a session reports.
pub trait SessionSink: Send + Sync {
    /// Fresh goals after a commit, rewind or explicit refresh; `None` when no
    /// proof is open.
    fn on_goals(&self, goals: Option<&Goals>) {
        let _ = goals;
    }

    /// Informational output: query answers, verifier messages.
    fn on_info(&self, message: &str) {
        let _ = message;
    }

    /// A rejected sentence or a fatal session error.
    fn on_error(&self, error: &ErrorInfo) {
        let _ = error;
    }

    /// Diagnostics: worker status, stderr lines, wire traffic.
    fn on_debug(&self, message: &str) {
        let _ = message;
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl SessionSink for NullSink {}

/// Forwards everything to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl SessionSink for TracingSink {
    fn on_goals(&self, goals: Option<&Goals>) {
        match goals {
            Some(goals) if goals.is_complete() => tracing::info!("no goals remaining"),
            Some(goals) => tracing::info!(
                focused = goals.focused.len(),
                unfocused = goals.unfocused_count,
                "goals updated\n{}",
                goals.render()
            ),
            None => tracing::info!("no proof open"),
        }
    }

    fn on_info(&self, message: &str) {
        tracing::info!("{}", message);
    }

    fn on_error(&self, error: &ErrorInfo) {
        tracing::warn!(location = ?error.location, "{}", error.message);
    }

    fn on_debug(&self, message: &str) {
        tracing::debug!("{}", message);
    }
}

/// One recorded sink callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Goals(Option<Goals>),
    Info(String),
    Error(ErrorInfo),
    Debug(String),
}

/// Keeps every callback in order; useful for tests and batch tools.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events so far.
    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn infos(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Info(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<ErrorInfo> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Error(info) => Some(info),
                _ => None,
            })
            .collect()
    }

    /// The most recent goals report, if any arrived.
    pub fn last_goals(&self) -> Option<Option<Goals>> {
        self.events().into_iter().rev().find_map(|e| match e {
            SinkEvent::Goals(goals) => Some(goals),
            _ => None,
        })
    }

    fn push(&self, event: SinkEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl SessionSink for RecordingSink {
    fn on_goals(&self, goals: Option<&Goals>) {
        self.push(SinkEvent::Goals(goals.cloned()));
    }

    fn on_info(&self, message: &str) {
        self.push(SinkEvent::Info(message.to_string()));
    }

    fn on_error(&self, error: &ErrorInfo) {
        self.push(SinkEvent::Error(error.clone()));
    }

    fn on_debug(&self, message: &str) {
        self.push(SinkEvent::Debug(message.to_string()));
    }
}
