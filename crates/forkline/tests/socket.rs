mod common;

use std::sync::Arc;

use forkline::channel::{LineCommandEncoder, spawn_command_pump};
use forkline::{ChannelError, EventPump, ForkChannel, SocketForkChannel};
use forkline_protocol::{Command, ControlSignal, decode_command};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use common::{Session, clean_run_frames, control, lines, session};

async fn bind(session: &Session) -> SocketForkChannel {
    let pump = Arc::new(EventPump::new(session.client.clone()));
    SocketForkChannel::bind(session.client.clone(), pump, Arc::new(LineCommandEncoder))
        .await
        .unwrap()
}

/// Split `tcp://<addr>?sessionId=<id>` the way a worker reads it.
fn parse_config(config: &str) -> (String, String) {
    let rest = config.strip_prefix("tcp://").expect("tcp scheme");
    let (address, id) = rest.split_once("?sessionId=").expect("session id");
    (address.to_string(), id.to_string())
}

/// Connect like a worker: open the socket, then present the session id.
async fn connect_worker(config: &str) -> TcpStream {
    let (address, id) = parse_config(config);
    let mut worker = TcpStream::connect(address).await.unwrap();
    worker.write_all(id.as_bytes()).await.unwrap();
    worker
}

#[tokio::test]
async fn channel_config_carries_address_and_session_id() {
    let s = session(&[]);
    let channel = bind(&s).await;
    let (address, id) = parse_config(&channel.channel_config());
    assert_eq!(address, channel.local_addr().to_string());
    assert_eq!(id, channel.session_id());
    assert_eq!(id.len(), 36);

    let other = bind(&s).await;
    assert_ne!(other.session_id(), channel.session_id());
    channel.close().await.unwrap();
    other.close().await.unwrap();
}

#[tokio::test]
async fn worker_connects_back_and_streams_events() {
    let s = session(&[]);
    let channel = bind(&s).await;

    let mut worker = connect_worker(&channel.channel_config()).await;
    worker.write_all(b"\n").await.unwrap();
    worker
        .write_all(&lines(&clean_run_frames()))
        .await
        .unwrap();
    drop(worker);
    channel.close().await.unwrap();

    assert_eq!(s.reporter.calls().len(), 6);
    assert!(s.client.is_said_goodbye());
    assert!(!s.client.has_tests_in_progress());
    assert!(s.dump.records().is_empty());
}

#[tokio::test]
async fn wrong_session_id_fails_the_channel() {
    let s = session(&[]);
    let channel = bind(&s).await;
    let (address, id) = parse_config(&channel.channel_config());

    let mut intruder = TcpStream::connect(address).await.unwrap();
    let forged = "0".repeat(id.len());
    intruder.write_all(forged.as_bytes()).await.unwrap();
    intruder
        .write_all(&lines(&clean_run_frames()))
        .await
        .unwrap();

    let err = channel.send(&Command::noop()).await.unwrap_err();
    assert!(matches!(err, ChannelError::Connect { fork: 1, .. }));
    drop(intruder);

    let err = channel.close().await.unwrap_err();
    assert!(matches!(err, ChannelError::Connect { .. }));
    assert!(err.to_string().contains("unexpected session id"));
    assert!(s.reporter.calls().is_empty());
    assert!(!s.client.is_said_goodbye());
}

#[tokio::test]
async fn commands_sent_before_connect_wait_for_the_worker() {
    let Session {
        client, commands, ..
    } = session(&["a.A"]);
    let pump = Arc::new(EventPump::new(client.clone()));
    let channel: Arc<dyn ForkChannel> = Arc::new(
        SocketForkChannel::bind(client.clone(), pump, Arc::new(LineCommandEncoder))
            .await
            .unwrap(),
    );

    let pending = tokio::spawn({
        let channel = Arc::clone(&channel);
        async move { channel.send(&Command::noop()).await }
    });
    let pumper = spawn_command_pump(Arc::clone(&channel), commands);

    let worker = connect_worker(&channel.channel_config()).await;
    let (read, mut write) = worker.into_split();
    let frames = [control(ControlSignal::NextTest), control(ControlSignal::Bye)];
    write.write_all(&lines(&frames)).await.unwrap();

    let mut received = Vec::new();
    let mut reader = BufReader::new(read).lines();
    while received.len() < 3 {
        let line = reader.next_line().await.unwrap().expect("command line");
        received.push(decode_command(&line).unwrap());
    }
    pending.await.unwrap().unwrap();
    pumper.await.unwrap().unwrap();

    assert!(received.contains(&Command::noop()));
    assert!(received.contains(&Command::run_class("a.A")));
    assert!(received.contains(&Command::bye_ack()));

    drop(write);
    channel.close().await.unwrap();
}

#[tokio::test]
async fn close_without_a_worker_does_not_hang() {
    let s = session(&[]);
    let channel = Arc::new(bind(&s).await);

    let pending = tokio::spawn({
        let channel = Arc::clone(&channel);
        async move { channel.send(&Command::noop()).await }
    });
    channel.close().await.unwrap();

    assert!(pending.await.unwrap().is_err());
    assert!(s.reporter.calls().is_empty());
}
