//! Transport between the controller and a fork.
//!
//! Two implementations:
//!
//! - **Pipe**: commands go to the worker's stdin, events come from its stdout
//! - **Socket**: the worker connects back to a loopback TCP port
//!
//! Both feed inbound lines through the stream consumer into the fork's event
//! pump, and both write outbound commands encoded by a [`CommandEncoder`].

mod pipe;
mod socket;

pub use pipe::PipeForkChannel;
pub use socket::SocketForkChannel;

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use forkline_protocol::{Command, encode_command};

use crate::pump::PumpError;

/// Errors raised by a fork channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Writing to or reading from the transport failed.
    #[error("channel I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The worker never connected back or presented the wrong session id.
    #[error("fork {fork} did not connect: {message}")]
    Connect { fork: u32, message: String },

    /// The channel was closed before the command could be written.
    #[error("channel to fork {0} is closed")]
    Closed(u32),

    /// Event handlers failed while the channel was open.
    #[error("event processing failed:\n{0}")]
    Pump(#[from] PumpError),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// Bidirectional channel to one fork.
#[async_trait]
pub trait ForkChannel: Send + Sync {
    /// Address the worker uses to reach the controller.
    fn channel_config(&self) -> String;

    /// Encode and write one command, flushing the transport.
    async fn send(&self, command: &Command) -> ChannelResult<()>;

    /// Drain inbound events, stop the event pump and release the transport.
    async fn close(&self) -> ChannelResult<()>;
}

/// Turns a command into transport bytes. `None` means nothing is written.
pub trait CommandEncoder: Send + Sync {
    fn encode(&self, command: &Command) -> Option<Vec<u8>>;
}

/// Newline-terminated command lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineCommandEncoder;

impl CommandEncoder for LineCommandEncoder {
    fn encode(&self, command: &Command) -> Option<Vec<u8>> {
        let mut line = encode_command(command);
        line.push('\n');
        Some(line.into_bytes())
    }
}

/// Spawn the task forwarding queued commands to `channel` until the queue closes.
///
/// A failed write ends the task with that error.
pub fn spawn_command_pump(
    channel: Arc<dyn ForkChannel>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) -> JoinHandle<ChannelResult<()>> {
    tokio::spawn(async move {
        info!("Command pump for {} started", channel.channel_config());
        while let Some(command) = commands.recv().await {
            debug!("Sending {} to {}", command, channel.channel_config());
            if let Err(e) = channel.send(&command).await {
                error!("Failed to send {}: {}", command, e);
                return Err(e);
            }
        }
        info!("Command pump for {} ended", channel.channel_config());
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_encoder_terminates_with_newline() {
        let bytes = LineCommandEncoder.encode(&Command::noop()).unwrap();
        assert_eq!(bytes, b":forkline-command:noop\n".to_vec());
    }

    #[test]
    fn pump_error_is_wrapped_with_its_failures() {
        let err = ChannelError::from(PumpError::Dispatch(vec!["a".into(), "b".into()]));
        assert_eq!(err.to_string(), "event processing failed:\na\nb");
    }
}
