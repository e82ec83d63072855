//! Reporter collaborator receiving test lifecycle events from a fork.

use anyhow::Result;
use log::{debug, error, info, warn};

use forkline_protocol::{ReportEntry, StackTraceWriter, StreamKind, StreamOutput};

/// Receives lifecycle events decoded from a worker.
///
/// Lifecycle callbacks may fail; the event pump records the failure and keeps
/// delivering later events. Console methods default to the log facade.
pub trait Reporter: Send + Sync {
    fn test_set_starting(&self, entry: &ReportEntry) -> Result<()>;
    fn test_set_completed(&self, entry: &ReportEntry) -> Result<()>;
    fn test_starting(&self, entry: &ReportEntry) -> Result<()>;
    fn test_succeeded(&self, entry: &ReportEntry) -> Result<()>;
    fn test_failed(&self, entry: &ReportEntry) -> Result<()>;
    fn test_skipped(&self, entry: &ReportEntry) -> Result<()>;
    fn test_error(&self, entry: &ReportEntry) -> Result<()>;
    fn test_assumption_failure(&self, entry: &ReportEntry) -> Result<()>;

    /// Captured stdout/stderr of the worker.
    fn write_test_output(&self, output: &StreamOutput) -> Result<()>;

    fn debug(&self, message: &str) {
        debug!("{}", message);
    }

    fn info(&self, message: &str) {
        info!("{}", message);
    }

    fn warning(&self, message: &str) {
        warn!("{}", message);
    }

    fn error(&self, message: &str, trace: Option<&StackTraceWriter>) {
        match trace.and_then(|t| t.stack_trace.as_deref()) {
            Some(trace) => error!("{}\n{}", message, trace),
            None => error!("{}", message),
        }
    }
}

/// Reporter that writes everything to the log, tagged with the fork number.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingReporter {
    fork_number: u32,
}

impl LoggingReporter {
    pub fn new(fork_number: u32) -> Self {
        Self { fork_number }
    }

    fn describe(entry: &ReportEntry) -> String {
        match (&entry.source_name, &entry.name) {
            (Some(source), Some(name)) => format!("{source}#{name}"),
            (Some(source), None) => source.clone(),
            (None, Some(name)) => name.clone(),
            (None, None) => "<unnamed>".to_string(),
        }
    }

    fn elapsed(entry: &ReportEntry) -> String {
        entry
            .elapsed
            .map(|ms| format!(" ({ms} ms)"))
            .unwrap_or_default()
    }
}

impl Reporter for LoggingReporter {
    fn test_set_starting(&self, entry: &ReportEntry) -> Result<()> {
        info!("[fork {}] Running {}", self.fork_number, Self::describe(entry));
        Ok(())
    }

    fn test_set_completed(&self, entry: &ReportEntry) -> Result<()> {
        info!(
            "[fork {}] Finished {}{}",
            self.fork_number,
            Self::describe(entry),
            Self::elapsed(entry)
        );
        Ok(())
    }

    fn test_starting(&self, entry: &ReportEntry) -> Result<()> {
        debug!("[fork {}] Starting {}", self.fork_number, Self::describe(entry));
        Ok(())
    }

    fn test_succeeded(&self, entry: &ReportEntry) -> Result<()> {
        info!(
            "[fork {}] PASS {}{}",
            self.fork_number,
            Self::describe(entry),
            Self::elapsed(entry)
        );
        Ok(())
    }

    fn test_failed(&self, entry: &ReportEntry) -> Result<()> {
        error!(
            "[fork {}] FAIL {}: {}",
            self.fork_number,
            Self::describe(entry),
            entry.message.as_deref().unwrap_or_default()
        );
        Ok(())
    }

    fn test_skipped(&self, entry: &ReportEntry) -> Result<()> {
        info!("[fork {}] SKIP {}", self.fork_number, Self::describe(entry));
        Ok(())
    }

    fn test_error(&self, entry: &ReportEntry) -> Result<()> {
        error!(
            "[fork {}] ERROR {}: {}",
            self.fork_number,
            Self::describe(entry),
            entry.message.as_deref().unwrap_or_default()
        );
        Ok(())
    }

    fn test_assumption_failure(&self, entry: &ReportEntry) -> Result<()> {
        info!(
            "[fork {}] ASSUMPTION {}",
            self.fork_number,
            Self::describe(entry)
        );
        Ok(())
    }

    fn write_test_output(&self, output: &StreamOutput) -> Result<()> {
        let text = output.text();
        match output.stream {
            StreamKind::StdOut => info!("[fork {}] {}", self.fork_number, text),
            StreamKind::StdErr => warn!("[fork {}] {}", self.fork_number, text),
        }
        Ok(())
    }
}
