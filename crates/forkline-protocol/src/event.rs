//! Decoded event model.

use std::collections::BTreeMap;

use crate::opcode::{Category, Charset, Opcode, RunMode};

/// Failure details carried by console-error, exit-error and failed test frames.
/// Every field is independently optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackTraceWriter {
    pub message: Option<String>,
    pub smart_trimmed_stack_trace: Option<String>,
    pub stack_trace: Option<String>,
}

impl StackTraceWriter {
    pub fn new(
        message: Option<String>,
        smart_trimmed_stack_trace: Option<String>,
        stack_trace: Option<String>,
    ) -> Self {
        Self {
            message,
            smart_trimmed_stack_trace,
            stack_trace,
        }
    }

    /// True when no field carries anything.
    pub fn is_empty(&self) -> bool {
        self.message.is_none() && self.smart_trimmed_stack_trace.is_none() && self.stack_trace.is_none()
    }

    /// Full trace if present, otherwise the best available summary.
    pub fn write_trace_to_string(&self) -> String {
        self.stack_trace
            .as_deref()
            .or(self.smart_trimmed_stack_trace.as_deref())
            .or(self.message.as_deref())
            .unwrap_or_default()
            .to_string()
    }
}

/// Control frames without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlSignal {
    Bye,
    StopOnNextTest,
    NextTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsoleLevel {
    Info,
    Debug,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    StdOut,
    StdErr,
}

/// Test lifecycle frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportKind {
    TestSetStarting,
    TestSetCompleted,
    TestStarting,
    TestSucceeded,
    TestFailed,
    TestSkipped,
    TestError,
    TestAssumptionFailure,
}

impl ReportKind {
    pub fn opcode(self) -> Opcode {
        match self {
            ReportKind::TestSetStarting => Opcode::TestSetStarting,
            ReportKind::TestSetCompleted => Opcode::TestSetCompleted,
            ReportKind::TestStarting => Opcode::TestStarting,
            ReportKind::TestSucceeded => Opcode::TestSucceeded,
            ReportKind::TestFailed => Opcode::TestFailed,
            ReportKind::TestSkipped => Opcode::TestSkipped,
            ReportKind::TestError => Opcode::TestError,
            ReportKind::TestAssumptionFailure => Opcode::TestAssumptionFailure,
        }
    }

    pub(crate) fn from_opcode(opcode: Opcode) -> Option<Self> {
        Some(match opcode {
            Opcode::TestSetStarting => ReportKind::TestSetStarting,
            Opcode::TestSetCompleted => ReportKind::TestSetCompleted,
            Opcode::TestStarting => ReportKind::TestStarting,
            Opcode::TestSucceeded => ReportKind::TestSucceeded,
            Opcode::TestFailed => ReportKind::TestFailed,
            Opcode::TestSkipped => ReportKind::TestSkipped,
            Opcode::TestError => ReportKind::TestError,
            Opcode::TestAssumptionFailure => ReportKind::TestAssumptionFailure,
            _ => return None,
        })
    }
}

/// Payload of a test lifecycle frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportEntry {
    pub run_mode: RunMode,
    pub source_name: Option<String>,
    pub source_text: Option<String>,
    pub name: Option<String>,
    pub name_text: Option<String>,
    pub group: Option<String>,
    pub message: Option<String>,
    /// Elapsed time in milliseconds.
    pub elapsed: Option<i32>,
    pub stack_trace: Option<StackTraceWriter>,
    /// Worker system properties, attached by the controller when a test set completes.
    pub system_properties: BTreeMap<String, String>,
}

impl ReportEntry {
    pub fn new(source_name: impl Into<String>, name: Option<String>) -> Self {
        Self {
            source_name: Some(source_name.into()),
            name,
            ..Default::default()
        }
    }

    pub fn with_elapsed(mut self, elapsed: i32) -> Self {
        self.elapsed = Some(elapsed);
        self
    }

    pub fn with_stack_trace(mut self, trace: StackTraceWriter) -> Self {
        self.stack_trace = Some(trace);
        self
    }

    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }
}

/// Bytes captured from the worker's stdout or stderr.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutput {
    pub stream: StreamKind,
    pub run_mode: RunMode,
    pub charset: Charset,
    pub output: Vec<u8>,
    /// The worker printed a line terminator after `output`.
    pub new_line: bool,
}

impl StreamOutput {
    pub fn text(&self) -> String {
        self.charset.decode(&self.output)
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Control(ControlSignal),
    Console {
        level: ConsoleLevel,
        message: Option<String>,
    },
    ConsoleError(StackTraceWriter),
    StandardStream(StreamOutput),
    SystemProperty {
        key: String,
        value: Option<String>,
    },
    Report {
        kind: ReportKind,
        entry: ReportEntry,
    },
    ExitError(StackTraceWriter),
}

impl Event {
    pub fn opcode(&self) -> Opcode {
        match self {
            Event::Control(ControlSignal::Bye) => Opcode::Bye,
            Event::Control(ControlSignal::StopOnNextTest) => Opcode::StopOnNextTest,
            Event::Control(ControlSignal::NextTest) => Opcode::NextTest,
            Event::Console { level, .. } => match level {
                ConsoleLevel::Info => Opcode::ConsoleInfoLog,
                ConsoleLevel::Debug => Opcode::ConsoleDebugLog,
                ConsoleLevel::Warning => Opcode::ConsoleWarningLog,
            },
            Event::ConsoleError(_) => Opcode::ConsoleErrorLog,
            Event::StandardStream(out) => match (out.stream, out.new_line) {
                (StreamKind::StdOut, false) => Opcode::StdOutStream,
                (StreamKind::StdOut, true) => Opcode::StdOutStreamNewLine,
                (StreamKind::StdErr, false) => Opcode::StdErrStream,
                (StreamKind::StdErr, true) => Opcode::StdErrStreamNewLine,
            },
            Event::SystemProperty { .. } => Opcode::SysProp,
            Event::Report { kind, .. } => kind.opcode(),
            Event::ExitError(_) => Opcode::JvmExitError,
        }
    }

    pub fn category(&self) -> Category {
        self.opcode().category()
    }

    /// Lane of the event; categories without a run mode belong to the normal run.
    pub fn run_mode(&self) -> RunMode {
        match self {
            Event::StandardStream(out) => out.run_mode,
            Event::Report { entry, .. } => entry.run_mode,
            _ => RunMode::NormalRun,
        }
    }

    pub fn report(kind: ReportKind, entry: ReportEntry) -> Self {
        Event::Report { kind, entry }
    }
}
