//! Work supply for a fork: turns session callbacks into outbound commands.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;
use tokio::sync::mpsc;

use forkline_protocol::{Command, Shutdown};

/// Shared queue of test classes still to be handed out. Several forks may draw
/// from the same queue.
pub type TestQueue = Arc<Mutex<VecDeque<String>>>;

pub fn test_queue<I, S>(classes: I) -> TestQueue
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Arc::new(Mutex::new(classes.into_iter().map(Into::into).collect()))
}

/// What the session asks of the work supply.
pub trait NotifiableTestStream: Send + Sync {
    /// The worker asked for its next unit of work.
    fn provide_new_test(&self);

    /// The worker said goodbye; acknowledge and stop emitting.
    fn acknowledge_bye_event_received(&self);

    fn shutdown(&self, mode: Shutdown);

    /// Ask the worker to skip everything after its current test.
    fn skip_since_next_test(&self);

    /// Keep-alive.
    fn noop(&self);
}

/// Sender half that stops emitting once closed. Closing drops the sender so the
/// command pumper sees the end of the queue after draining it.
#[derive(Debug)]
struct CommandOutlet {
    sender: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl CommandOutlet {
    fn new() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn emit(&self, command: Command) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(tx) => {
                if tx.send(command).is_err() {
                    debug!("Command pumper gone, dropping command");
                }
            }
            None => debug!("Stream closed, dropping {}", command),
        }
    }

    fn close(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn is_closed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Hands out test classes on demand from a shared queue.
#[derive(Debug)]
pub struct TestProvidingStream {
    tests: TestQueue,
    outlet: CommandOutlet,
}

impl TestProvidingStream {
    pub fn new(tests: TestQueue) -> (Arc<Self>, mpsc::UnboundedReceiver<Command>) {
        let (outlet, rx) = CommandOutlet::new();
        (Arc::new(Self { tests, outlet }), rx)
    }

    pub fn close(&self) {
        self.outlet.close();
    }

    pub fn is_closed(&self) -> bool {
        self.outlet.is_closed()
    }
}

impl NotifiableTestStream for TestProvidingStream {
    fn provide_new_test(&self) {
        if self.is_closed() {
            return;
        }
        let next = self
            .tests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(class) => self.outlet.emit(Command::run_class(class)),
            None => self.outlet.emit(Command::test_set_finished()),
        }
    }

    fn acknowledge_bye_event_received(&self) {
        self.outlet.emit(Command::bye_ack());
        self.close();
    }

    fn shutdown(&self, mode: Shutdown) {
        self.outlet.emit(Command::shutdown(mode));
    }

    fn skip_since_next_test(&self) {
        self.outlet.emit(Command::skip_since_next_test());
    }

    fn noop(&self) {
        self.outlet.emit(Command::noop());
    }
}

/// Work supply for a worker that already knows its whole test set.
#[derive(Debug)]
pub struct TestLessStream {
    outlet: CommandOutlet,
}

impl TestLessStream {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Command>) {
        let (outlet, rx) = CommandOutlet::new();
        (Arc::new(Self { outlet }), rx)
    }

    pub fn close(&self) {
        self.outlet.close();
    }
}

impl NotifiableTestStream for TestLessStream {
    fn provide_new_test(&self) {
        debug!("Worker without a test queue asked for more work");
    }

    fn acknowledge_bye_event_received(&self) {
        self.outlet.emit(Command::bye_ack());
        self.close();
    }

    fn shutdown(&self, mode: Shutdown) {
        self.outlet.emit(Command::shutdown(mode));
    }

    fn skip_since_next_test(&self) {
        self.outlet.emit(Command::skip_since_next_test());
    }

    fn noop(&self) {
        self.outlet.emit(Command::noop());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Command>) -> Vec<Command> {
        let mut out = Vec::new();
        while let Ok(command) = rx.try_recv() {
            out.push(command);
        }
        out
    }

    #[test]
    fn hands_out_classes_then_finishes() {
        let (stream, mut rx) = TestProvidingStream::new(test_queue(["a.A", "b.B"]));
        stream.provide_new_test();
        stream.provide_new_test();
        stream.provide_new_test();
        assert_eq!(
            drain(&mut rx),
            vec![
                Command::run_class("a.A"),
                Command::run_class("b.B"),
                Command::test_set_finished()
            ]
        );
    }

    #[test]
    fn forks_share_one_queue() {
        let queue = test_queue(["a.A", "b.B"]);
        let (first, mut first_rx) = TestProvidingStream::new(queue.clone());
        let (second, mut second_rx) = TestProvidingStream::new(queue);
        first.provide_new_test();
        second.provide_new_test();
        assert_eq!(drain(&mut first_rx), vec![Command::run_class("a.A")]);
        assert_eq!(drain(&mut second_rx), vec![Command::run_class("b.B")]);
    }

    #[test]
    fn nothing_is_emitted_after_bye() {
        let (stream, mut rx) = TestProvidingStream::new(test_queue(["a.A"]));
        stream.acknowledge_bye_event_received();
        stream.provide_new_test();
        stream.noop();
        stream.shutdown(Shutdown::Kill);
        assert_eq!(drain(&mut rx), vec![Command::bye_ack()]);
        assert!(rx.try_recv().is_err());
        assert!(stream.is_closed());
    }

    #[test]
    fn test_less_stream_ignores_work_requests() {
        let (stream, mut rx) = TestLessStream::new();
        stream.provide_new_test();
        stream.skip_since_next_test();
        stream.shutdown(Shutdown::Exit);
        assert_eq!(
            drain(&mut rx),
            vec![Command::skip_since_next_test(), Command::shutdown(Shutdown::Exit)]
        );
    }
}
