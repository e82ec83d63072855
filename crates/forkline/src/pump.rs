//! Bounded event queue with one dedicated consumer thread per fork.
//!
//! The reader task submits decoded events; the consumer dispatches them to the
//! session in order. A failing or panicking handler does not stop delivery of
//! later events: failures are collected and reported once by [`EventPump::close`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, error, warn};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use forkline_protocol::Event;

use crate::client::EventHandler;

/// Default queue capacity.
pub const QUEUE_MAX_ITEMS: usize = 10_000;

/// An item on the pump queue. `End` terminates the consumer and is never a real event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueItem {
    Event(Event),
    End,
}

impl QueueItem {
    pub fn is_end(&self) -> bool {
        matches!(self, QueueItem::End)
    }
}

#[derive(Debug, Error)]
pub enum PumpError {
    /// One or more handler calls failed; the message joins each failure with `\n`.
    #[error("{}", .0.join("\n"))]
    Dispatch(Vec<String>),
}

impl PumpError {
    pub fn failures(&self) -> &[String] {
        match self {
            PumpError::Dispatch(failures) => failures,
        }
    }
}

pub struct EventPump {
    sender: mpsc::Sender<QueueItem>,
    stop: AtomicBool,
    alive: Arc<AtomicBool>,
    failures: Arc<Mutex<Vec<String>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl EventPump {
    /// Start the consumer thread. Must be called inside a tokio runtime.
    pub fn new(handler: Arc<dyn EventHandler>) -> Self {
        Self::with_capacity(handler, QUEUE_MAX_ITEMS)
    }

    pub fn with_capacity(handler: Arc<dyn EventHandler>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let alive = Arc::new(AtomicBool::new(true));
        let failures = Arc::new(Mutex::new(Vec::new()));
        let consumer = tokio::task::spawn_blocking({
            let alive = Arc::clone(&alive);
            let failures = Arc::clone(&failures);
            move || consume(receiver, handler, alive, failures)
        });
        Self {
            sender,
            stop: AtomicBool::new(false),
            alive,
            failures,
            consumer: Mutex::new(Some(consumer)),
        }
    }

    /// Queue an event, waiting while the queue is full.
    ///
    /// Dropped after [`close`](Self::close) and when the consumer has died.
    pub async fn submit(&self, event: Event) {
        if self.stop.load(Ordering::Acquire) {
            debug!("Pump stopped, dropping {}", event.opcode());
            return;
        }
        if !self.alive.load(Ordering::Acquire) {
            warn!("Pump consumer is gone, dropping {}", event.opcode());
            return;
        }
        if let Err(mpsc::error::SendError(QueueItem::Event(event))) =
            self.sender.send(QueueItem::Event(event)).await
        {
            warn!("Pump consumer is gone, dropping {}", event.opcode());
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Stop accepting events, let the consumer drain what was queued, and
    /// report the collected handler failures.
    pub async fn close(&self) -> Result<(), PumpError> {
        if !self.stop.swap(true, Ordering::AcqRel) {
            if self.sender.send(QueueItem::End).await.is_err() {
                debug!("Pump consumer already finished");
            }
            let consumer = self
                .consumer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(consumer) = consumer
                && let Err(e) = consumer.await
            {
                error!("Pump consumer thread failed: {}", e);
            }
        }

        let failures = std::mem::take(
            &mut *self
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(PumpError::Dispatch(failures))
        }
    }
}

struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn consume(
    mut receiver: mpsc::Receiver<QueueItem>,
    handler: Arc<dyn EventHandler>,
    alive: Arc<AtomicBool>,
    failures: Arc<Mutex<Vec<String>>>,
) {
    let _guard = AliveGuard(alive);
    while let Some(item) = receiver.blocking_recv() {
        let QueueItem::Event(event) = item else {
            break;
        };
        let opcode = event.opcode();
        let failure = match panic::catch_unwind(AssertUnwindSafe(|| handler.handle_event(event))) {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => panic_message(payload),
        };
        warn!("Handling {} failed: {}", opcode, failure);
        failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(failure);
    }
    // Dropping the receiver releases producers blocked on a full queue.
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "event handler panicked".to_string()
    }
}
