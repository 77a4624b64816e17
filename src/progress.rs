use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validate,
    Identity,
    Physicochemical,
    Homology,
    Structure,
    Merged,
    Rejected,
    Cancelled,
    Summary,
}

impl Stage {
    /// Stages that close out one identifier.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Merged | Stage::Rejected | Stage::Cancelled)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Validate => "validate",
            Stage::Identity => "identity",
            Stage::Physicochemical => "physicochemical",
            Stage::Homology => "homology",
            Stage::Structure => "structure",
            Stage::Merged => "merged",
            Stage::Rejected => "rejected",
            Stage::Cancelled => "cancelled",
            Stage::Summary => "summary",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub identifier: Option<String>,
    pub completed_count: usize,
    pub total_count: usize,
    pub message: String,
    pub severity: Severity,
}

impl ProgressEvent {
    pub fn fraction(&self) -> f64 {
        if self.total_count == 0 {
            return 1.0;
        }
        self.completed_count as f64 / self.total_count as f64
    }
}

/// Receives progress events from the pipeline.
///
/// `event` runs while the reporter holds its ordering lock, so every worker
/// waits for it. Sinks that do real work (rendering, I/O) should hand events
/// to a [`ChannelSink`] and consume them on their own thread.
pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn event(&self, _event: ProgressEvent) {}
}

/// Forwards events to a receiver owned by the shell. A dropped receiver is
/// ignored so the pipeline never stalls on its consumer.
pub struct ChannelSink {
    sender: Sender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        Self { sender }
    }
}

impl ProgressSink for ChannelSink {
    fn event(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }
}

/// Orders events from all workers and keeps the completed counter.
pub struct ProgressReporter<'a> {
    sink: &'a dyn ProgressSink,
    total: usize,
    completed: Mutex<usize>,
}

impl<'a> ProgressReporter<'a> {
    pub fn new(sink: &'a dyn ProgressSink, total: usize) -> Self {
        Self {
            sink,
            total,
            completed: Mutex::new(0),
        }
    }

    pub fn stage(&self, stage: Stage, identifier: &str, message: impl Into<String>) {
        self.emit(stage, Some(identifier), message.into(), Severity::Info);
    }

    pub fn warn(&self, stage: Stage, identifier: &str, message: impl Into<String>) {
        self.emit(stage, Some(identifier), message.into(), Severity::Warning);
    }

    /// Emits the single closing event for one identifier.
    pub fn finish(
        &self,
        stage: Stage,
        identifier: &str,
        message: impl Into<String>,
        severity: Severity,
    ) {
        debug_assert!(stage.is_terminal());
        self.emit(stage, Some(identifier), message.into(), severity);
    }

    pub fn summary(&self, message: impl Into<String>) {
        self.emit(Stage::Summary, None, message.into(), Severity::Info);
    }

    fn emit(&self, stage: Stage, identifier: Option<&str>, message: String, severity: Severity) {
        let mut completed = self.completed.lock().unwrap_or_else(PoisonError::into_inner);
        if stage.is_terminal() {
            *completed += 1;
        }
        self.sink.event(ProgressEvent {
            stage,
            identifier: identifier.map(str::to_string),
            completed_count: *completed,
            total_count: self.total,
            message,
            severity,
        });
    }
}
