//! Periodic timeout checks and keep-alive pings for running forks.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::client::{ForkClient, now_millis};

#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// Fork timeout in seconds; 0 disables timeouts.
    pub fork_timeout_secs: u64,
    pub tick: Duration,
    /// Interval between `noop` pings; zero disables pings.
    pub ping_interval: Duration,
}

/// Registry of active sessions plus the task that watches them.
pub struct Watchdog {
    clients: Arc<DashMap<u32, Arc<ForkClient>>>,
    shutdown_tx: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    pub fn spawn(config: WatchdogConfig) -> Self {
        let clients: Arc<DashMap<u32, Arc<ForkClient>>> = Arc::new(DashMap::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(watch(Arc::clone(&clients), config, shutdown_rx));
        Self {
            clients,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn register(&self, client: Arc<ForkClient>) {
        debug!("Watching fork {}", client.fork_number());
        self.clients.insert(client.fork_number(), client);
    }

    pub fn unregister(&self, fork_number: u32) {
        self.clients.remove(&fork_number);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Stop the watchdog task and wait for it.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            debug!("Watchdog task ended abnormally: {}", e);
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Run one timeout pass over `clients`; returns the forks that timed out now.
pub fn check_timeouts(
    clients: &DashMap<u32, Arc<ForkClient>>,
    now_millis: i64,
    timeout_secs: u64,
) -> Vec<u32> {
    clients
        .iter()
        .filter(|e| e.value().try_to_timeout(now_millis, timeout_secs))
        .map(|e| *e.key())
        .collect()
}

fn ping(clients: &DashMap<u32, Arc<ForkClient>>) {
    for entry in clients.iter() {
        entry.value().test_stream().noop();
    }
}

async fn watch(
    clients: Arc<DashMap<u32, Arc<ForkClient>>>,
    config: WatchdogConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = time::interval(config.tick.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_ping = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                let expired = check_timeouts(&clients, now_millis(), config.fork_timeout_secs);
                for fork in expired {
                    info!("Fork {} timed out", fork);
                }
                if !config.ping_interval.is_zero() && last_ping.elapsed() >= config.ping_interval {
                    ping(&clients);
                    last_ping = Instant::now();
                }
            }
        }
    }
    debug!("Watchdog stopped");
}
