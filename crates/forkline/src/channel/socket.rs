use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time;
use uuid::Uuid;

use forkline_protocol::Command;

use super::{ChannelError, ChannelResult, CommandEncoder, ForkChannel};
use crate::client::ForkClient;
use crate::consumer::spawn_event_consumer;
use crate::pump::EventPump;

const ACCEPT_GRACE: Duration = Duration::from_millis(200);
/// Time a connected worker has to present its session id.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Connection state published by the accept task.
#[derive(Clone)]
enum Connection {
    Pending,
    Ready(SharedWriter),
    Failed(String),
    Closed,
}

/// Accept task outcome: the event reader of the accepted client, or the accept error.
type AcceptOutcome = Result<JoinHandle<()>, io::Error>;

/// Channel over a loopback TCP connection made by the worker.
///
/// The worker's first bytes on the connection must be the session id carried
/// in [`channel_config`](ForkChannel::channel_config); anything else fails the
/// channel. Commands sent before the worker connects wait until it does.
pub struct SocketForkChannel {
    fork_number: u32,
    local_addr: SocketAddr,
    session_id: String,
    encoder: Arc<dyn CommandEncoder>,
    pump: Arc<EventPump>,
    state_tx: watch::Sender<Connection>,
    state_rx: watch::Receiver<Connection>,
    accept: StdMutex<Option<JoinHandle<AcceptOutcome>>>,
}

impl SocketForkChannel {
    /// Bind an ephemeral loopback port and start accepting the worker's connection.
    pub async fn bind(
        client: Arc<ForkClient>,
        pump: Arc<EventPump>,
        encoder: Arc<dyn CommandEncoder>,
    ) -> ChannelResult<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let local_addr = listener.local_addr()?;
        let fork_number = client.fork_number();
        let session_id = Uuid::new_v4().to_string();
        let (state_tx, state_rx) = watch::channel(Connection::Pending);
        info!("Fork {} channel listening on {}", fork_number, local_addr);

        let accept = tokio::spawn(accept_task(
            listener,
            session_id.clone(),
            client,
            Arc::clone(&pump),
            state_tx.clone(),
        ));

        Ok(Self {
            fork_number,
            local_addr,
            session_id,
            encoder,
            pump,
            state_tx,
            state_rx,
            accept: StdMutex::new(Some(accept)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Secret the worker writes first after connecting.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn await_connection(&self) -> ChannelResult<SharedWriter> {
        let mut state = self.state_rx.clone();
        let connection = state
            .wait_for(|c| !matches!(c, Connection::Pending))
            .await
            .map(|c| (*c).clone())
            .map_err(|_| ChannelError::Closed(self.fork_number))?;
        match connection {
            Connection::Ready(writer) => Ok(writer),
            Connection::Failed(message) => Err(ChannelError::Connect {
                fork: self.fork_number,
                message,
            }),
            Connection::Pending | Connection::Closed => Err(ChannelError::Closed(self.fork_number)),
        }
    }
}

async fn accept_task(
    listener: TcpListener,
    session_id: String,
    client: Arc<ForkClient>,
    pump: Arc<EventPump>,
    state: watch::Sender<Connection>,
) -> AcceptOutcome {
    let fork = client.fork_number();
    let accepted = match listener.accept().await {
        Ok((mut stream, peer)) => {
            info!("Fork {} connected from {}", fork, peer);
            verify_session_id(&mut stream, &session_id)
                .await
                .map(|()| stream)
        }
        Err(e) => Err(e),
    };

    match accepted {
        Ok(stream) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not disable Nagle for fork {}: {}", fork, e);
            }
            let (read, write) = stream.into_split();
            let reader = spawn_event_consumer(read, client, pump);
            state.send_replace(Connection::Ready(Arc::new(Mutex::new(write))));
            Ok(reader)
        }
        Err(e) => {
            warn!("Fork {} connection rejected: {}", fork, e);
            state.send_replace(Connection::Failed(e.to_string()));
            Err(e)
        }
    }
}

/// Read the session id the worker must send before any frame.
async fn verify_session_id(stream: &mut TcpStream, expected: &str) -> io::Result<()> {
    let mut presented = vec![0u8; expected.len()];
    match time::timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut presented)).await {
        Ok(read) => {
            read?;
        }
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "no session id received",
            ));
        }
    }
    if presented != expected.as_bytes() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "unexpected session id '{}'",
                String::from_utf8_lossy(&presented)
            ),
        ));
    }
    Ok(())
}

#[async_trait]
impl ForkChannel for SocketForkChannel {
    fn channel_config(&self) -> String {
        format!("tcp://{}?sessionId={}", self.local_addr, self.session_id)
    }

    async fn send(&self, command: &Command) -> ChannelResult<()> {
        let writer = self.await_connection().await?;
        let Some(bytes) = self.encoder.encode(command) else {
            return Ok(());
        };
        let mut writer = writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) -> ChannelResult<()> {
        let accept = self
            .accept
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let mut connect_error = None;
        if let Some(mut accept) = accept {
            // A worker may have connected without the accept task having run yet.
            let joined = match time::timeout(ACCEPT_GRACE, &mut accept).await {
                Ok(joined) => joined,
                Err(_) => {
                    debug!("Fork {} never connected, stopping accept", self.fork_number);
                    accept.abort();
                    accept.await
                }
            };
            match joined {
                Ok(Ok(reader)) => {
                    if let Err(e) = reader.await {
                        warn!("Event reader for fork {} failed: {}", self.fork_number, e);
                    }
                }
                Ok(Err(e)) => connect_error = Some(e),
                Err(e) if e.is_cancelled() => {}
                Err(e) => warn!("Accept task for fork {} failed: {}", self.fork_number, e),
            }
        }

        let previous = self.state_tx.send_replace(Connection::Closed);
        let pumped = self.pump.close().await;

        if let Connection::Ready(writer) = previous
            && let Err(e) = writer.lock().await.shutdown().await
        {
            debug!("Closing socket of fork {}: {}", self.fork_number, e);
        }

        if let Some(e) = connect_error {
            return Err(ChannelError::Connect {
                fork: self.fork_number,
                message: e.to_string(),
            });
        }
        pumped.map_err(ChannelError::from)
    }
}
