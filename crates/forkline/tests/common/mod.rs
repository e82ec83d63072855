//! Shared fixtures for forkline integration tests.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use forkline::{DumpSink, ForkClient, Reporter, TestProvidingStream, TestQueue, test_queue};
use forkline_protocol::{
    Command, ControlSignal, Event, ReportEntry, ReportKind, StackTraceWriter, StreamOutput,
    encode_event,
};
use tokio::sync::mpsc;

/// Reporter recording every call as `<call>:<source name>`.
#[derive(Default)]
pub struct RecordingReporter {
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
}

impl RecordingReporter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every lifecycle call for the source `name` fail.
    pub fn failing_on(name: &str) -> Arc<Self> {
        let reporter = Self::default();
        *reporter.fail_on.lock().unwrap() = Some(name.to_string());
        Arc::new(reporter)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str, entry: &ReportEntry) -> Result<()> {
        let label = entry.source_name.clone().unwrap_or_default();
        self.calls.lock().unwrap().push(format!("{call}:{label}"));
        if self.fail_on.lock().unwrap().as_deref() == Some(label.as_str()) {
            bail!("reporter refused {call} for {label}");
        }
        Ok(())
    }
}

impl Reporter for RecordingReporter {
    fn test_set_starting(&self, entry: &ReportEntry) -> Result<()> {
        self.record("testSetStarting", entry)
    }
    fn test_set_completed(&self, entry: &ReportEntry) -> Result<()> {
        self.record("testSetCompleted", entry)
    }
    fn test_starting(&self, entry: &ReportEntry) -> Result<()> {
        self.record("testStarting", entry)
    }
    fn test_succeeded(&self, entry: &ReportEntry) -> Result<()> {
        self.record("testSucceeded", entry)
    }
    fn test_failed(&self, entry: &ReportEntry) -> Result<()> {
        self.record("testFailed", entry)
    }
    fn test_skipped(&self, entry: &ReportEntry) -> Result<()> {
        self.record("testSkipped", entry)
    }
    fn test_error(&self, entry: &ReportEntry) -> Result<()> {
        self.record("testError", entry)
    }
    fn test_assumption_failure(&self, entry: &ReportEntry) -> Result<()> {
        self.record("testAssumptionFailure", entry)
    }
    fn write_test_output(&self, output: &StreamOutput) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("output:{}", output.text()));
        Ok(())
    }
}

/// Dump sink keeping every record in memory.
#[derive(Default)]
pub struct MemoryDumpSink {
    records: Mutex<Vec<String>>,
}

impl MemoryDumpSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<String> {
        self.records.lock().unwrap().clone()
    }

    fn push(&self, text: String, path: &str) -> PathBuf {
        self.records.lock().unwrap().push(text);
        PathBuf::from(path)
    }
}

impl DumpSink for MemoryDumpSink {
    fn dump_exception(&self, fork: u32, message: &str, _: Option<&StackTraceWriter>) -> PathBuf {
        self.push(message.to_string(), &format!("memory-{fork}.dump"))
    }
    fn dump_text(&self, fork: u32, text: &str) -> PathBuf {
        self.push(text.to_string(), &format!("memory-{fork}.dump"))
    }
    fn dump_stream_text(&self, fork: u32, text: &str) -> PathBuf {
        self.push(text.to_string(), &format!("memory-{fork}.dumpstream"))
    }
}

/// A session wired to recording collaborators.
pub struct Session {
    pub client: Arc<ForkClient>,
    pub reporter: Arc<RecordingReporter>,
    pub dump: Arc<MemoryDumpSink>,
    pub stream: Arc<TestProvidingStream>,
    pub commands: mpsc::UnboundedReceiver<Command>,
}

pub fn session(classes: &[&str]) -> Session {
    session_with(RecordingReporter::new(), test_queue(classes.iter().copied()))
}

pub fn session_with(reporter: Arc<RecordingReporter>, tests: TestQueue) -> Session {
    let dump = MemoryDumpSink::new();
    let (stream, commands) = TestProvidingStream::new(tests);
    let client = Arc::new(ForkClient::new(
        1,
        reporter.clone(),
        stream.clone(),
        dump.clone(),
    ));
    Session {
        client,
        reporter,
        dump,
        stream,
        commands,
    }
}

pub fn drain(commands: &mut mpsc::UnboundedReceiver<Command>) -> Vec<Command> {
    let mut out = Vec::new();
    while let Ok(command) = commands.try_recv() {
        out.push(command);
    }
    out
}

// ============================================================================
// Frames
// ============================================================================

pub fn report(kind: ReportKind, source: &str, name: Option<&str>) -> String {
    encode_event(&Event::report(
        kind,
        ReportEntry::new(source, name.map(str::to_string)),
    ))
}

pub fn control(signal: ControlSignal) -> String {
    encode_event(&Event::Control(signal))
}

/// The clean run: one test set with two passing tests, then goodbye.
pub fn clean_run_frames() -> Vec<String> {
    vec![
        report(ReportKind::TestSetStarting, "S", None),
        report(ReportKind::TestStarting, "T1", Some("first")),
        report(ReportKind::TestSucceeded, "T1", Some("first")),
        report(ReportKind::TestStarting, "T2", Some("second")),
        report(ReportKind::TestSucceeded, "T2", Some("second")),
        report(ReportKind::TestSetCompleted, "S", None),
        control(ControlSignal::Bye),
    ]
}

pub fn lines(frames: &[String]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in frames {
        out.extend_from_slice(frame.as_bytes());
        out.push(b'\n');
    }
    out
}
