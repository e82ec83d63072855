//! Controller side of the forkline protocol.
//!
//! A [`ForkStarter`](starter::ForkStarter) launches worker processes and
//! connects each one through a [`ForkChannel`](channel::ForkChannel). Lines
//! read from the worker are decoded into events and queued on an
//! [`EventPump`](pump::EventPump), whose consumer thread drives the fork's
//! [`ForkClient`](client::ForkClient) session. Commands flow back through a
//! work supply stream and the command pumper.

pub mod channel;
pub mod client;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod dump;
pub mod pump;
pub mod reporter;
pub mod starter;
pub mod stream;
pub mod watchdog;

pub use channel::{ChannelError, ForkChannel, PipeForkChannel, SocketForkChannel};
pub use client::{EventHandler, ForkClient, TestSetClock};
pub use config::{ForkConfig, Transport, load_config};
pub use dump::{DumpSink, FileDumpSink};
pub use pump::{EventPump, PumpError, QueueItem};
pub use reporter::{LoggingReporter, Reporter};
pub use starter::{ForkOutcome, ForkResult, ForkSpec, ForkStarter, ReporterFactory};
pub use stream::{NotifiableTestStream, TestLessStream, TestProvidingStream, TestQueue, test_queue};
