//! Commands sent from the controller to a worker.
//!
//! Each command is one line: `:forkline-command:<opcode>[:<charset>:<data>]`,
//! where `data` is base64 of the payload.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{DecodeError, DecodeResult};
use crate::opcode::Charset;

/// Prefix of every command line.
pub const COMMAND_MAGIC: &str = ":forkline-command";

/// How the worker should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Shutdown {
    /// Finish the current test set, then exit.
    #[default]
    Default,
    /// Exit as soon as possible.
    Exit,
    /// Halt immediately.
    Kill,
}

impl Shutdown {
    pub fn as_str(self) -> &'static str {
        match self {
            Shutdown::Default => "default",
            Shutdown::Exit => "exit",
            Shutdown::Kill => "kill",
        }
    }
}

impl FromStr for Shutdown {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Shutdown::Default),
            "exit" => Ok(Shutdown::Exit),
            "kill" => Ok(Shutdown::Kill),
            other => Err(DecodeError::UnknownShutdown(other.to_string())),
        }
    }
}

impl fmt::Display for Shutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    RunClass,
    TestSetFinished,
    SkipSinceNextTest,
    Shutdown,
    Noop,
    ByeAck,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::RunClass => "run-class",
            CommandKind::TestSetFinished => "testset-finished",
            CommandKind::SkipSinceNextTest => "skip-since-next-test",
            CommandKind::Shutdown => "shutdown",
            CommandKind::Noop => "noop",
            CommandKind::ByeAck => "bye-ack",
        }
    }

    fn has_data(self) -> bool {
        matches!(self, CommandKind::RunClass | CommandKind::Shutdown)
    }
}

impl FromStr for CommandKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "run-class" => CommandKind::RunClass,
            "testset-finished" => CommandKind::TestSetFinished,
            "skip-since-next-test" => CommandKind::SkipSinceNextTest,
            "shutdown" => CommandKind::Shutdown,
            "noop" => CommandKind::Noop,
            "bye-ack" => CommandKind::ByeAck,
            other => return Err(DecodeError::UnknownCommand(other.to_string())),
        })
    }
}

/// An instruction to a worker. Two commands are equal when kind and payload are.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    kind: CommandKind,
    data: Option<String>,
}

impl Command {
    pub fn run_class(class_name: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::RunClass,
            data: Some(class_name.into()),
        }
    }

    pub fn shutdown(mode: Shutdown) -> Self {
        Self {
            kind: CommandKind::Shutdown,
            data: Some(mode.as_str().to_string()),
        }
    }

    pub fn test_set_finished() -> Self {
        Self::bare(CommandKind::TestSetFinished)
    }

    pub fn skip_since_next_test() -> Self {
        Self::bare(CommandKind::SkipSinceNextTest)
    }

    pub fn noop() -> Self {
        Self::bare(CommandKind::Noop)
    }

    pub fn bye_ack() -> Self {
        Self::bare(CommandKind::ByeAck)
    }

    fn bare(kind: CommandKind) -> Self {
        Self { kind, data: None }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    /// Shutdown mode, when this is a shutdown command.
    pub fn to_shutdown(&self) -> Option<Shutdown> {
        match self.kind {
            CommandKind::Shutdown => self.data.as_deref().and_then(|d| d.parse().ok()),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            Some(data) => write!(f, "{}({data})", self.kind.as_str()),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

/// Encode a command as a line without the trailing newline.
pub fn encode_command(command: &Command) -> String {
    let mut line = format!("{COMMAND_MAGIC}:{}", command.kind.as_str());
    if let Some(data) = &command.data {
        line.push(':');
        line.push_str(Charset::Utf8.name());
        line.push(':');
        line.push_str(&STANDARD.encode(data));
    }
    line
}

/// Decode a command line as written by [`encode_command`].
pub fn decode_command(line: &str) -> DecodeResult<Command> {
    let line = line.trim_end_matches(['\r', '\n']);
    let body = line
        .strip_prefix(COMMAND_MAGIC)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or(DecodeError::MissingMagicNumber)?;

    let mut parts = body.split(':');
    let kind: CommandKind = parts.next().unwrap_or_default().parse()?;
    if !kind.has_data() {
        return match parts.count() {
            0 => Ok(Command::bare(kind)),
            count => Err(DecodeError::UnknownCommand(format!(
                "{} with {count} unexpected field(s)",
                kind.as_str()
            ))),
        };
    }

    let charset: Charset = parts
        .next()
        .ok_or_else(|| DecodeError::UnknownCommand(format!("{} without charset", kind.as_str())))?
        .parse()?;
    let token = parts.next().unwrap_or_default();
    let bytes = STANDARD
        .decode(token)
        .map_err(|source| DecodeError::Base64 { field: "data", source })?;
    let data = charset.decode(&bytes);
    if kind == CommandKind::Shutdown {
        data.parse::<Shutdown>()?;
    }
    Ok(Command {
        kind,
        data: Some(data),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_compare_structurally() {
        assert_eq!(Command::run_class("a.B"), Command::run_class("a.B"));
        assert_ne!(Command::run_class("a.B"), Command::run_class("a.C"));
        assert_ne!(Command::noop(), Command::bye_ack());
        assert_eq!(Command::shutdown(Shutdown::Kill).to_shutdown(), Some(Shutdown::Kill));
        assert_eq!(Command::noop().to_shutdown(), None);
    }

    #[test]
    fn encodes_payload_as_base64() {
        assert_eq!(encode_command(&Command::noop()), ":forkline-command:noop");
        assert_eq!(
            encode_command(&Command::run_class("a.B")),
            ":forkline-command:run-class:UTF-8:YS5C"
        );
    }

    #[test]
    fn decodes_every_command() {
        for command in [
            Command::run_class("pkg.FooTest"),
            Command::shutdown(Shutdown::Exit),
            Command::test_set_finished(),
            Command::skip_since_next_test(),
            Command::noop(),
            Command::bye_ack(),
        ] {
            assert_eq!(decode_command(&encode_command(&command)).unwrap(), command);
        }
    }

    #[test]
    fn rejects_malformed_commands() {
        assert!(matches!(decode_command("noop"), Err(DecodeError::MissingMagicNumber)));
        assert!(matches!(
            decode_command(":forkline-command:reboot"),
            Err(DecodeError::UnknownCommand(_))
        ));
        assert!(matches!(
            decode_command(":forkline-command:shutdown:UTF-8:bm9wZQ=="),
            Err(DecodeError::UnknownShutdown(mode)) if mode == "nope"
        ));
    }
}
