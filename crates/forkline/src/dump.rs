//! Diagnostic dump files.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::{debug, warn};

use forkline_protocol::StackTraceWriter;

/// Persists diagnostics for a fork and returns where they went.
///
/// Implementations never fail the caller; write errors are logged and the
/// intended location is still returned.
pub trait DumpSink: Send + Sync {
    /// Record a fatal error reported by the worker.
    fn dump_exception(&self, fork_number: u32, message: &str, trace: Option<&StackTraceWriter>)
    -> PathBuf;

    /// Record a free-form diagnostic line.
    fn dump_text(&self, fork_number: u32, text: &str) -> PathBuf;

    /// Record native stream output that was not a frame.
    fn dump_stream_text(&self, fork_number: u32, text: &str) -> PathBuf;
}

/// Appends dumps to `<stamp>-jvmRun<N>.dump` and `<stamp>-jvmRun<N>.dumpstream`.
#[derive(Debug, Clone)]
pub struct FileDumpSink {
    directory: PathBuf,
    stamp: String,
}

impl FileDumpSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let stamp = Local::now().format("%Y-%m-%dT%H-%M-%S_%3f").to_string();
        Self::with_stamp(directory, stamp)
    }

    pub fn with_stamp(directory: impl Into<PathBuf>, stamp: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            stamp: stamp.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn dump_path(&self, fork_number: u32) -> PathBuf {
        self.directory
            .join(format!("{}-jvmRun{}.dump", self.stamp, fork_number))
    }

    pub fn stream_dump_path(&self, fork_number: u32) -> PathBuf {
        self.directory
            .join(format!("{}-jvmRun{}.dumpstream", self.stamp, fork_number))
    }

    fn append(&self, path: PathBuf, text: &str) -> PathBuf {
        if let Err(e) = Self::append_line(&path, text) {
            warn!("Failed to write dump {}: {}", path.display(), e);
        } else {
            debug!("Wrote dump {}", path.display());
        }
        path
    }

    fn append_line(path: &Path, text: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "# Created at {}", Local::now().to_rfc3339())?;
        writeln!(file, "{text}")?;
        file.flush()
    }
}

impl DumpSink for FileDumpSink {
    fn dump_exception(
        &self,
        fork_number: u32,
        message: &str,
        trace: Option<&StackTraceWriter>,
    ) -> PathBuf {
        let text = match trace.map(StackTraceWriter::write_trace_to_string) {
            Some(trace) if !trace.is_empty() => format!("{message}\n{trace}"),
            _ => message.to_string(),
        };
        self.append(self.dump_path(fork_number), &text)
    }

    fn dump_text(&self, fork_number: u32, text: &str) -> PathBuf {
        self.append(self.dump_path(fork_number), text)
    }

    fn dump_stream_text(&self, fork_number: u32, text: &str) -> PathBuf {
        self.append(self.stream_dump_path(fork_number), text)
    }
}
