//! Opcodes, run modes and charsets.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;

use crate::error::DecodeError;

/// Prefix of every event frame. A frame reads `:forkline-event:<opcode>...`.
pub const MAGIC_NUMBER: &str = ":forkline-event";

/// Token standing for an absent value.
pub const NULL_TOKEN: &str = "-";

/// Payload shape shared by a group of opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Control,
    Console,
    ConsoleError,
    StandardStream,
    SystemProperty,
    Test,
    ExitError,
}

/// Every event the worker may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    TestSetStarting,
    TestSetCompleted,
    TestStarting,
    TestSucceeded,
    TestFailed,
    TestSkipped,
    TestError,
    TestAssumptionFailure,
    StdOutStream,
    StdOutStreamNewLine,
    StdErrStream,
    StdErrStreamNewLine,
    ConsoleInfoLog,
    ConsoleDebugLog,
    ConsoleWarningLog,
    ConsoleErrorLog,
    SysProp,
    Bye,
    StopOnNextTest,
    NextTest,
    JvmExitError,
}

static OPCODES: Lazy<HashMap<&'static str, Opcode>> =
    Lazy::new(|| Opcode::ALL.iter().map(|op| (op.as_str(), *op)).collect());

impl Opcode {
    pub const ALL: [Opcode; 21] = [
        Opcode::TestSetStarting,
        Opcode::TestSetCompleted,
        Opcode::TestStarting,
        Opcode::TestSucceeded,
        Opcode::TestFailed,
        Opcode::TestSkipped,
        Opcode::TestError,
        Opcode::TestAssumptionFailure,
        Opcode::StdOutStream,
        Opcode::StdOutStreamNewLine,
        Opcode::StdErrStream,
        Opcode::StdErrStreamNewLine,
        Opcode::ConsoleInfoLog,
        Opcode::ConsoleDebugLog,
        Opcode::ConsoleWarningLog,
        Opcode::ConsoleErrorLog,
        Opcode::SysProp,
        Opcode::Bye,
        Opcode::StopOnNextTest,
        Opcode::NextTest,
        Opcode::JvmExitError,
    ];

    /// Wire name of the opcode.
    pub fn as_str(self) -> &'static str {
        match self {
            Opcode::TestSetStarting => "testset-starting",
            Opcode::TestSetCompleted => "testset-completed",
            Opcode::TestStarting => "test-starting",
            Opcode::TestSucceeded => "test-succeeded",
            Opcode::TestFailed => "test-failed",
            Opcode::TestSkipped => "test-skipped",
            Opcode::TestError => "test-error",
            Opcode::TestAssumptionFailure => "test-assumption-failure",
            Opcode::StdOutStream => "std-out-stream",
            Opcode::StdOutStreamNewLine => "std-out-stream-new-line",
            Opcode::StdErrStream => "std-err-stream",
            Opcode::StdErrStreamNewLine => "std-err-stream-new-line",
            Opcode::ConsoleInfoLog => "console-info-log",
            Opcode::ConsoleDebugLog => "console-debug-log",
            Opcode::ConsoleWarningLog => "console-warning-log",
            Opcode::ConsoleErrorLog => "console-error-log",
            Opcode::SysProp => "sys-prop",
            Opcode::Bye => "bye",
            Opcode::StopOnNextTest => "stop-on-next-test",
            Opcode::NextTest => "next-test",
            Opcode::JvmExitError => "jvm-exit-error",
        }
    }

    /// Look up an opcode by its wire name.
    pub fn from_token(token: &str) -> Option<Opcode> {
        OPCODES.get(token).copied()
    }

    pub fn category(self) -> Category {
        match self {
            Opcode::TestSetStarting
            | Opcode::TestSetCompleted
            | Opcode::TestStarting
            | Opcode::TestSucceeded
            | Opcode::TestFailed
            | Opcode::TestSkipped
            | Opcode::TestError
            | Opcode::TestAssumptionFailure => Category::Test,
            Opcode::StdOutStream
            | Opcode::StdOutStreamNewLine
            | Opcode::StdErrStream
            | Opcode::StdErrStreamNewLine => Category::StandardStream,
            Opcode::ConsoleInfoLog | Opcode::ConsoleDebugLog | Opcode::ConsoleWarningLog => {
                Category::Console
            }
            Opcode::ConsoleErrorLog => Category::ConsoleError,
            Opcode::SysProp => Category::SystemProperty,
            Opcode::Bye | Opcode::StopOnNextTest | Opcode::NextTest => Category::Control,
            Opcode::JvmExitError => Category::ExitError,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Run mode
// ============================================================================

/// Logical test-run lane an event belongs to within a reused worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RunMode {
    #[default]
    NormalRun,
    RerunTestAfterFailure,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::NormalRun => "normal-run",
            RunMode::RerunTestAfterFailure => "rerun-test-after-failure",
        }
    }
}

impl FromStr for RunMode {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal-run" => Ok(RunMode::NormalRun),
            "rerun-test-after-failure" => Ok(RunMode::RerunTestAfterFailure),
            other => Err(DecodeError::UnknownRunMode(other.to_string())),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Charset
// ============================================================================

/// Character encodings a frame may declare for its string fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Charset {
    #[default]
    Utf8,
    UsAscii,
    Iso8859_1,
}

impl Charset {
    /// Canonical name written on the wire.
    pub fn name(self) -> &'static str {
        match self {
            Charset::Utf8 => "UTF-8",
            Charset::UsAscii => "US-ASCII",
            Charset::Iso8859_1 => "ISO-8859-1",
        }
    }

    /// Decode bytes into text. Unmappable input becomes U+FFFD.
    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Charset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Charset::UsAscii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
                .collect(),
            Charset::Iso8859_1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }

    /// Encode text. Characters outside the charset become `?`.
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Charset::Utf8 => text.as_bytes().to_vec(),
            Charset::UsAscii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
            Charset::Iso8859_1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
        }
    }
}

impl FromStr for Charset {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UTF-8" | "UTF8" => Ok(Charset::Utf8),
            "US-ASCII" | "ASCII" => Ok(Charset::UsAscii),
            "ISO-8859-1" | "ISO8859_1" | "ISO-LATIN-1" | "LATIN1" => Ok(Charset::Iso8859_1),
            _ => Err(DecodeError::UnsupportedCharset(s.to_string())),
        }
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
