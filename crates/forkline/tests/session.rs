//! End-to-end session behaviour over an in-memory pipe channel.

mod common;

use std::sync::Arc;

use forkline::channel::{LineCommandEncoder, spawn_command_pump};
use forkline::{ChannelError, EventPump, ForkChannel, PipeForkChannel, test_queue};
use forkline_protocol::{Command, ControlSignal, ReportKind, decode_command};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, duplex};

use common::{
    RecordingReporter, Session, clean_run_frames, control, drain, lines, report, session,
    session_with,
};

/// Both ends of a pipe channel: the worker writes events and reads commands.
struct Worker {
    events: DuplexStream,
    commands: DuplexStream,
}

fn connect(session: &Session) -> (PipeForkChannel, Worker) {
    let (events_in, events) = duplex(64 * 1024);
    let (commands_out, commands) = duplex(64 * 1024);
    let pump = Arc::new(EventPump::new(session.client.clone()));
    let channel = PipeForkChannel::new(
        session.client.clone(),
        pump,
        commands_out,
        events_in,
        Arc::new(LineCommandEncoder),
    );
    (channel, Worker { events, commands })
}

#[tokio::test]
async fn clean_run_reports_every_call_in_order() {
    let mut s = session(&[]);
    let (channel, mut worker) = connect(&s);

    worker
        .events
        .write_all(&lines(&clean_run_frames()))
        .await
        .unwrap();
    drop(worker.events);
    channel.close().await.unwrap();

    assert_eq!(
        s.reporter.calls(),
        vec![
            "testSetStarting:S",
            "testStarting:T1",
            "testSucceeded:T1",
            "testStarting:T2",
            "testSucceeded:T2",
            "testSetCompleted:S",
        ]
    );
    assert!(!s.client.has_tests_in_progress());
    assert!(s.client.is_said_goodbye());
    assert!(!s.client.is_error_in_fork());
    assert_eq!(drain(&mut s.commands), vec![Command::bye_ack()]);
    assert!(s.dump.records().is_empty());
}

#[tokio::test]
async fn interleaved_tests_settle_independently() {
    let mut s = session(&[]);
    let (channel, mut worker) = connect(&s);

    let frames = [
        report(ReportKind::TestSetStarting, "S", None),
        report(ReportKind::TestStarting, "T1", None),
        report(ReportKind::TestStarting, "T2", None),
        report(ReportKind::TestSucceeded, "T1", None),
        report(ReportKind::TestFailed, "T2", None),
        report(ReportKind::TestSetCompleted, "S", None),
        control(ControlSignal::Bye),
    ];
    worker.events.write_all(&lines(&frames)).await.unwrap();
    drop(worker.events);
    channel.close().await.unwrap();

    assert_eq!(
        s.reporter.calls(),
        vec![
            "testSetStarting:S",
            "testStarting:T1",
            "testStarting:T2",
            "testSucceeded:T1",
            "testFailed:T2",
            "testSetCompleted:S",
        ]
    );
    assert!(s.client.tests_in_progress().is_empty());
    assert!(s.client.is_said_goodbye());
    assert!(!s.client.is_error_in_fork());
    assert_eq!(drain(&mut s.commands), vec![Command::bye_ack()]);
}

#[tokio::test]
async fn crash_leaves_started_test_in_flight() {
    let s = session(&[]);
    let (channel, mut worker) = connect(&s);

    let frames = [
        report(ReportKind::TestSetStarting, "S", None),
        report(ReportKind::TestStarting, "T1", None),
    ];
    worker.events.write_all(&lines(&frames)).await.unwrap();
    drop(worker.events);
    channel.close().await.unwrap();

    assert!(!s.client.is_said_goodbye());
    assert_eq!(s.client.tests_in_progress(), vec!["T1"]);
}

#[tokio::test]
async fn native_output_between_frames_is_dumped_once() {
    let s = session(&[]);
    let (channel, mut worker) = connect(&s);

    let mut bytes = lines(&[report(ReportKind::TestStarting, "T1", None)]);
    bytes.extend_from_slice(b"Exception in thread main: oops\n");
    bytes.extend_from_slice(&lines(&[report(ReportKind::TestSucceeded, "T1", None)]));
    worker.events.write_all(&bytes).await.unwrap();
    drop(worker.events);
    channel.close().await.unwrap();

    assert_eq!(
        s.reporter.calls(),
        vec!["testStarting:T1", "testSucceeded:T1"]
    );
    let records = s.dump.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].contains("Exception in thread main: oops"));
    let warnings = s.client.warnings_at_end();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("Corrupted channel"));
}

#[tokio::test]
async fn malformed_frame_is_skipped() {
    let s = session(&[]);
    let (channel, mut worker) = connect(&s);

    let mut bytes = lines(&[report(ReportKind::TestStarting, "T1", None)]);
    bytes.extend_from_slice(b":forkline-event:no-such-opcode:UTF-8:x\n");
    bytes.extend_from_slice(b"\r\n");
    bytes.extend_from_slice(&lines(&[report(ReportKind::TestFailed, "T1", None)]));
    worker.events.write_all(&bytes).await.unwrap();
    drop(worker.events);
    channel.close().await.unwrap();

    assert_eq!(s.reporter.calls(), vec!["testStarting:T1", "testFailed:T1"]);
    assert_eq!(s.dump.records().len(), 1);
    assert!(s.client.warnings_at_end().is_empty());
}

#[tokio::test]
async fn reporter_failure_surfaces_on_close() {
    let s = session_with(RecordingReporter::failing_on("T1"), test_queue(Vec::<String>::new()));
    let (channel, mut worker) = connect(&s);

    let frames = [
        report(ReportKind::TestStarting, "T1", None),
        report(ReportKind::TestStarting, "T2", None),
        control(ControlSignal::Bye),
    ];
    worker.events.write_all(&lines(&frames)).await.unwrap();
    drop(worker.events);
    let err = channel.close().await.unwrap_err();

    assert!(matches!(err, ChannelError::Pump(_)));
    assert!(err.to_string().contains("reporter refused testStarting for T1"));
    assert_eq!(s.reporter.calls(), vec!["testStarting:T1", "testStarting:T2"]);
    assert!(s.client.is_said_goodbye());
}

#[tokio::test]
async fn next_test_requests_are_answered_over_the_pipe() {
    let s = session(&["a.A"]);
    let Session {
        client, commands, ..
    } = s;
    let (events_in, mut events) = duplex(64 * 1024);
    let (commands_out, worker_commands) = duplex(64 * 1024);
    let pump = Arc::new(EventPump::new(client.clone()));
    let channel: Arc<dyn ForkChannel> = Arc::new(PipeForkChannel::new(
        client.clone(),
        pump,
        commands_out,
        events_in,
        Arc::new(LineCommandEncoder),
    ));
    assert_eq!(channel.channel_config(), "pipe://1");
    let pumper = spawn_command_pump(Arc::clone(&channel), commands);

    let frames = [
        control(ControlSignal::NextTest),
        control(ControlSignal::NextTest),
        control(ControlSignal::Bye),
    ];
    events.write_all(&lines(&frames)).await.unwrap();

    let mut received = Vec::new();
    let mut reader = BufReader::new(worker_commands).lines();
    while received.len() < 3 {
        let line = reader.next_line().await.unwrap().expect("command line");
        received.push(decode_command(&line).unwrap());
    }
    assert_eq!(
        received,
        vec![
            Command::run_class("a.A"),
            Command::test_set_finished(),
            Command::bye_ack()
        ]
    );

    pumper.await.unwrap().unwrap();
    drop(events);
    channel.close().await.unwrap();
    assert!(channel.send(&Command::noop()).await.is_err());
}
