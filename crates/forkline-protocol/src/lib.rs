//! Wire protocol spoken between the forkline controller and its forked workers.
//!
//! Workers write one event frame per line on their output channel; the
//! controller answers with command lines on the worker's input channel. Both
//! directions are plain text so a frame survives any byte stream (pipe or
//! loopback socket) and native-stream noise can be told apart by its prefix.

pub mod codec;
pub mod command;
pub mod error;
pub mod event;
pub mod opcode;

pub use codec::{decode_frame, encode_event, handle_frame};
pub use command::{COMMAND_MAGIC, Command, CommandKind, Shutdown, decode_command, encode_command};
pub use error::{DecodeError, DecodeResult};
pub use event::{
    ConsoleLevel, ControlSignal, Event, ReportEntry, ReportKind, StackTraceWriter, StreamKind,
    StreamOutput,
};
pub use opcode::{Category, Charset, MAGIC_NUMBER, NULL_TOKEN, Opcode, RunMode};
