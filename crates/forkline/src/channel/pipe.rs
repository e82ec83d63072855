use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use forkline_protocol::Command;

use super::{ChannelError, ChannelResult, CommandEncoder, ForkChannel};
use crate::client::ForkClient;
use crate::consumer::spawn_event_consumer;
use crate::pump::EventPump;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Channel over the worker's standard streams. Sends never wait for a peer.
pub struct PipeForkChannel {
    fork_number: u32,
    writer: Mutex<Option<BoxedWriter>>,
    encoder: Arc<dyn CommandEncoder>,
    pump: Arc<EventPump>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl PipeForkChannel {
    /// Start reading events from `output` and write commands to `input`.
    pub fn new<R, W>(
        client: Arc<ForkClient>,
        pump: Arc<EventPump>,
        input: W,
        output: R,
        encoder: Arc<dyn CommandEncoder>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let fork_number = client.fork_number();
        let reader = spawn_event_consumer(output, client, Arc::clone(&pump));
        Self {
            fork_number,
            writer: Mutex::new(Some(Box::new(input))),
            encoder,
            pump,
            reader: StdMutex::new(Some(reader)),
        }
    }
}

#[async_trait]
impl ForkChannel for PipeForkChannel {
    fn channel_config(&self) -> String {
        format!("pipe://{}", self.fork_number)
    }

    async fn send(&self, command: &Command) -> ChannelResult<()> {
        let Some(bytes) = self.encoder.encode(command) else {
            return Ok(());
        };
        let mut writer = self.writer.lock().await;
        let writer = writer
            .as_mut()
            .ok_or(ChannelError::Closed(self.fork_number))?;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) -> ChannelResult<()> {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader
            && let Err(e) = reader.await
        {
            warn!("Event reader for fork {} failed: {}", self.fork_number, e);
        }

        let pumped = self.pump.close().await;

        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(e) = writer.shutdown().await
        {
            debug!("Closing stdin of fork {}: {}", self.fork_number, e);
        }

        pumped.map_err(ChannelError::from)
    }
}
