use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use serde::Serialize;

use crate::error::ProtmergeError;
use crate::pipeline::RunOutput;
use crate::progress::{ChannelSink, ProgressEvent, ProgressSink, Severity};

pub struct JsonOutput;

impl JsonOutput {
    /// Writes the run as pretty JSON to `path`, or to stdout when absent.
    pub fn print_run(output: &RunOutput, path: Option<&Path>) -> Result<(), ProtmergeError> {
        let json = Self::render(output)?;
        match path {
            Some(path) => fs::write(path, format!("{json}\n"))
                .map_err(|err| ProtmergeError::Output(format!("{}: {err}", path.display()))),
            None => Self::write_stdout(&json)
                .map_err(|err| ProtmergeError::Output(err.to_string())),
        }
    }

    pub fn render<T: Serialize>(value: &T) -> Result<String, ProtmergeError> {
        serde_json::to_string_pretty(value).map_err(|err| ProtmergeError::Output(err.to_string()))
    }

    fn write_stdout(json: &str) -> io::Result<()> {
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Renders progress through `tracing`, so `RUST_LOG` controls verbosity.
pub struct LogProgress;

impl LogProgress {
    /// Logs events on a background thread fed by the returned sink. The
    /// thread ends once the sink is dropped and yields the number of events
    /// it logged.
    pub fn spawn() -> (ChannelSink, JoinHandle<usize>) {
        let (tx, rx) = mpsc::channel::<ProgressEvent>();
        let handle = thread::spawn(move || {
            let mut logged = 0;
            for event in rx {
                LogProgress.event(event);
                logged += 1;
            }
            logged
        });
        (ChannelSink::new(tx), handle)
    }
}

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        let id = event.identifier.as_deref().unwrap_or("-");
        let done = event.completed_count;
        let total = event.total_count;
        match event.severity {
            Severity::Info => {
                tracing::info!(stage = %event.stage, id, done, total, "{}", event.message)
            }
            Severity::Warning => {
                tracing::warn!(stage = %event.stage, id, done, total, "{}", event.message)
            }
            Severity::Error => {
                tracing::error!(stage = %event.stage, id, done, total, "{}", event.message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{ProgressReporter, Stage};

    #[test]
    fn background_logger_drains_every_event() {
        let (sink, logger) = LogProgress::spawn();
        let reporter = ProgressReporter::new(&sink, 2);
        reporter.stage(Stage::Identity, "P04637", "querying UniProt");
        reporter.finish(Stage::Merged, "P04637", "complete", Severity::Info);
        reporter.finish(Stage::Rejected, "bad", "invalid", Severity::Warning);
        reporter.summary("done");
        drop(reporter);
        drop(sink);
        assert_eq!(logger.join().unwrap(), 4);
    }
}
