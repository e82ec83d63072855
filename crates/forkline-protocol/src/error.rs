//! Decode errors for event frames and command lines.

use thiserror::Error;

use crate::opcode::Opcode;

/// Reasons a line could not be turned into an event or command.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The line does not start with the frame marker (native stream output).
    #[error("line does not start with the frame marker")]
    MissingMagicNumber,

    /// The opcode token is not part of the opcode table.
    #[error("unknown opcode '{0}'")]
    UnknownOpcode(String),

    /// The command opcode token is not a known command.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// The frame ended before a required field.
    #[error("{opcode} frame is missing the {field} field")]
    MissingField { opcode: Opcode, field: &'static str },

    /// The frame carries more fields than its opcode allows.
    #[error("{opcode} frame has {count} unexpected trailing field(s)")]
    TrailingFields { opcode: Opcode, count: usize },

    /// The declared charset is not supported.
    #[error("unsupported charset '{0}'")]
    UnsupportedCharset(String),

    /// The run mode token is not known.
    #[error("unknown run mode '{0}'")]
    UnknownRunMode(String),

    /// The shutdown mode carried by a shutdown command is not known.
    #[error("unknown shutdown mode '{0}'")]
    UnknownShutdown(String),

    /// A string or binary field is not valid base64.
    #[error("malformed base64 in the {field} field: {source}")]
    Base64 {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    /// The elapsed field is not an integer.
    #[error("malformed integer '{token}' in the {field} field: {source}")]
    Integer {
        field: &'static str,
        token: String,
        #[source]
        source: std::num::ParseIntError,
    },

    /// A system property frame decoded to a blank key.
    #[error("system property key must not be blank")]
    BlankPropertyKey,
}

pub type DecodeResult<T> = Result<T, DecodeError>;
