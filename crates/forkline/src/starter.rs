//! Launches forked workers and supervises them until they exit.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::io::{AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::channel::{
    ChannelError, CommandEncoder, ForkChannel, LineCommandEncoder, PipeForkChannel,
    SocketForkChannel, spawn_command_pump,
};
use crate::client::ForkClient;
use crate::config::{ForkConfig, Transport};
use crate::consumer::{MAX_LINE_BYTES, read_line_capped};
use crate::dump::DumpSink;
use crate::pump::EventPump;
use crate::reporter::Reporter;
use crate::stream::{NotifiableTestStream, TestProvidingStream, TestQueue};
use crate::watchdog::Watchdog;

/// Environment variable carrying the channel address for TCP forks.
pub const CHANNEL_ENV: &str = "FORKLINE_CHANNEL";
/// Environment variable carrying the fork number.
pub const FORK_NUMBER_ENV: &str = "FORKLINE_FORK_NUMBER";

const EXIT_POLL: Duration = Duration::from_millis(100);

/// Creates the reporter for a fork number.
pub type ReporterFactory = Arc<dyn Fn(u32) -> Arc<dyn Reporter> + Send + Sync>;

/// How to start a worker process.
#[derive(Debug, Clone, Default)]
pub struct ForkSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl ForkSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForkOutcome {
    Completed,
    Crashed,
    TimedOut,
}

impl fmt::Display for ForkOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkOutcome::Completed => f.write_str("completed"),
            ForkOutcome::Crashed => f.write_str("crashed"),
            ForkOutcome::TimedOut => f.write_str("timed out"),
        }
    }
}

/// What happened to one fork.
#[derive(Debug, Clone, Serialize)]
pub struct ForkResult {
    pub fork_number: u32,
    pub exit_code: Option<i32>,
    pub said_goodbye: bool,
    pub timed_out: bool,
    /// First fatal error the worker reported.
    pub error_in_fork: Option<String>,
    /// Tests still running when the worker went away, sorted.
    pub tests_in_progress: Vec<String>,
    pub warnings: Vec<String>,
    /// Failure raised while closing the channel: event handler errors or a
    /// connection that was never made.
    pub channel_error: Option<String>,
}

impl ForkResult {
    pub fn outcome(&self) -> ForkOutcome {
        if self.timed_out {
            ForkOutcome::TimedOut
        } else if !self.said_goodbye {
            ForkOutcome::Crashed
        } else {
            ForkOutcome::Completed
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome() == ForkOutcome::Completed
    }

    /// Human readable explanation for a fork that did not complete.
    pub fn failure_message(&self) -> Option<String> {
        let mut message = match self.outcome() {
            ForkOutcome::Completed => return None,
            ForkOutcome::TimedOut => format!(
                "There was a timeout in fork {}",
                self.fork_number
            ),
            ForkOutcome::Crashed => format!(
                "The forked worker {} terminated without properly saying goodbye. Crash or exit called? (exit code {})",
                self.fork_number,
                self.exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string())
            ),
        };
        if !self.tests_in_progress.is_empty() {
            message.push_str("\nCrashed tests:\n");
            message.push_str(&self.tests_in_progress.join("\n"));
        }
        if let Some(error) = &self.error_in_fork {
            message.push_str("\nError in fork: ");
            message.push_str(error);
        }
        Some(message)
    }
}

/// Starts forks with one configuration, reporter and dump sink.
pub struct ForkStarter {
    config: ForkConfig,
    reporters: ReporterFactory,
    dump: Arc<dyn DumpSink>,
    encoder: Arc<dyn CommandEncoder>,
    watchdog: Watchdog,
    streams: Arc<DashMap<u32, Arc<TestProvidingStream>>>,
    next_fork: AtomicU32,
}

impl ForkStarter {
    /// Must be called inside a tokio runtime.
    pub fn new(config: ForkConfig, reporters: ReporterFactory, dump: Arc<dyn DumpSink>) -> Self {
        let watchdog = Watchdog::spawn(config.watchdog());
        Self {
            config,
            reporters,
            dump,
            encoder: Arc::new(LineCommandEncoder),
            watchdog,
            streams: Arc::new(DashMap::new()),
            next_fork: AtomicU32::new(1),
        }
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn CommandEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn config(&self) -> &ForkConfig {
        &self.config
    }

    /// Run one fork drawing tests from `tests` until it exits.
    pub async fn run(&self, spec: &ForkSpec, tests: TestQueue) -> Result<ForkResult> {
        let fork_number = self.next_fork.fetch_add(1, Ordering::SeqCst);
        let (stream, commands) = TestProvidingStream::new(tests);
        self.streams.insert(fork_number, Arc::clone(&stream));

        let streams = Arc::clone(&self.streams);
        let client = Arc::new(
            ForkClient::new(
                fork_number,
                (self.reporters)(fork_number),
                stream.clone(),
                Arc::clone(&self.dump),
            )
            .with_stop_on_next_test(move || {
                for entry in streams.iter() {
                    entry.value().skip_since_next_test();
                }
            }),
        );
        let pump = Arc::new(EventPump::with_capacity(
            client.clone(),
            self.config.queue_capacity,
        ));

        let launched = self.launch(spec, &client, &pump).await;
        let (channel, mut child) = match launched {
            Ok(launched) => launched,
            Err(e) => {
                self.streams.remove(&fork_number);
                stream.close();
                if let Err(close) = pump.close().await {
                    debug!("Closing pump of fork {} after failed launch: {}", fork_number, close);
                }
                return Err(e);
            }
        };

        info!(
            "Fork {} started (pid {:?}) on {}",
            fork_number,
            child.id(),
            channel.channel_config()
        );
        self.watchdog.register(client.clone());
        let pumper = spawn_command_pump(Arc::clone(&channel), commands);

        let status = self.wait_for_exit(&client, &mut child).await;

        self.watchdog.unregister(fork_number);
        self.streams.remove(&fork_number);
        stream.close();

        let channel_error = match channel.close().await {
            Ok(()) => None,
            Err(e) => {
                warn!("Closing channel of fork {}: {}", fork_number, e);
                Some(e.to_string())
            }
        };
        match pumper.await {
            Ok(Ok(())) => {}
            Ok(Err(ChannelError::Closed(_))) => {}
            Ok(Err(e)) => debug!("Command pump of fork {} stopped: {}", fork_number, e),
            Err(e) => warn!("Command pump of fork {} failed: {}", fork_number, e),
        }

        let status = status?;
        let result = ForkResult {
            fork_number,
            exit_code: status.code(),
            said_goodbye: client.is_said_goodbye(),
            timed_out: client.had_timeout(),
            error_in_fork: client.error_in_fork().map(|trace| {
                trace
                    .message
                    .clone()
                    .unwrap_or_else(|| trace.write_trace_to_string())
            }),
            tests_in_progress: client.tests_in_progress(),
            warnings: client.warnings_at_end(),
            channel_error,
        };

        for warning in &result.warnings {
            warn!("{}", warning);
        }
        match result.failure_message() {
            Some(message) => error!("{}", message),
            None => info!("Fork {} completed", fork_number),
        }
        Ok(result)
    }

    /// Run `forks` forks in parallel, all drawing from the same test queue.
    pub async fn run_parallel(
        self: &Arc<Self>,
        spec: &ForkSpec,
        tests: TestQueue,
        forks: usize,
    ) -> Result<Vec<ForkResult>> {
        let mut set = JoinSet::new();
        for _ in 0..forks.max(1) {
            let starter = Arc::clone(self);
            let spec = spec.clone();
            let tests = Arc::clone(&tests);
            set.spawn(async move { starter.run(&spec, tests).await });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            results.push(joined.context("fork task panicked")??);
        }
        results.sort_by_key(|r| r.fork_number);
        Ok(results)
    }

    pub async fn shutdown(&self) {
        self.watchdog.shutdown().await;
    }

    async fn launch(
        &self,
        spec: &ForkSpec,
        client: &Arc<ForkClient>,
        pump: &Arc<EventPump>,
    ) -> Result<(Arc<dyn ForkChannel>, Child)> {
        let fork_number = client.fork_number();
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .env(FORK_NUMBER_ENV, fork_number.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        match self.config.transport {
            Transport::Pipe => {
                command.stdin(Stdio::piped());
                let mut child = command
                    .spawn()
                    .with_context(|| format!("spawning fork {fork_number}: {}", spec.program))?;
                let stdin = child.stdin.take().context("fork has no stdin")?;
                let stdout = child.stdout.take().context("fork has no stdout")?;
                if let Some(stderr) = child.stderr.take() {
                    tokio::spawn(forward_native_output(fork_number, "stderr", stderr));
                }
                let channel: Arc<dyn ForkChannel> = Arc::new(PipeForkChannel::new(
                    Arc::clone(client),
                    Arc::clone(pump),
                    stdin,
                    stdout,
                    Arc::clone(&self.encoder),
                ));
                Ok((channel, child))
            }
            Transport::Tcp => {
                let channel = SocketForkChannel::bind(
                    Arc::clone(client),
                    Arc::clone(pump),
                    Arc::clone(&self.encoder),
                )
                .await
                .context("binding fork channel")?;
                let address = channel.channel_config();
                command
                    .arg(&address)
                    .env(CHANNEL_ENV, &address)
                    .stdin(Stdio::null());

                let mut child = match command.spawn() {
                    Ok(child) => child,
                    Err(e) => {
                        if let Err(close) = channel.close().await {
                            debug!("Closing unused channel of fork {}: {}", fork_number, close);
                        }
                        return Err(e).with_context(|| {
                            format!("spawning fork {fork_number}: {}", spec.program)
                        });
                    }
                };
                if let Some(stdout) = child.stdout.take() {
                    tokio::spawn(forward_native_output(fork_number, "stdout", stdout));
                }
                if let Some(stderr) = child.stderr.take() {
                    tokio::spawn(forward_native_output(fork_number, "stderr", stderr));
                }
                let channel: Arc<dyn ForkChannel> = Arc::new(channel);
                Ok((channel, child))
            }
        }
    }

    /// Wait for the process, force-killing it when it outlives the exit timeout
    /// after saying goodbye or timing out.
    async fn wait_for_exit(&self, client: &ForkClient, child: &mut Child) -> Result<ExitStatus> {
        let mut poll = tokio::time::interval(EXIT_POLL);
        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                status = child.wait() => {
                    return status.with_context(|| format!("waiting for fork {}", client.fork_number()));
                }
                _ = poll.tick() => {
                    if deadline.is_none() && (client.had_timeout() || client.is_said_goodbye()) {
                        deadline = Some(Instant::now() + self.config.exit_timeout());
                    }
                    if let Some(deadline) = deadline
                        && Instant::now() >= deadline
                    {
                        warn!(
                            "Fork {} did not exit within {:?}, killing the process",
                            client.fork_number(),
                            self.config.exit_timeout()
                        );
                        child.start_kill().context("killing fork")?;
                        return child.wait().await.context("waiting for killed fork");
                    }
                }
            }
        }
    }
}

/// Log a worker's stray output until end of stream. Bytes that are not UTF-8
/// are replaced, never fatal, so the pipe stays drained while the worker lives.
async fn forward_native_output<R>(fork_number: u32, name: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match read_line_capped(&mut reader, &mut buf, MAX_LINE_BYTES).await {
            Ok((0, _)) => break,
            Ok((_, truncated)) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                if truncated {
                    warn!("Fork {} {} (truncated): {}", fork_number, name, line);
                } else if !line.trim().is_empty() {
                    warn!("Fork {} {}: {}", fork_number, name, line);
                }
            }
            Err(e) => {
                warn!("Reading {} of fork {} failed: {}", name, fork_number, e);
                break;
            }
        }
    }
    debug!("Fork {} {} reader ended", fork_number, name);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(said_goodbye: bool, timed_out: bool, in_flight: &[&str]) -> ForkResult {
        ForkResult {
            fork_number: 2,
            exit_code: Some(1),
            said_goodbye,
            timed_out,
            error_in_fork: None,
            tests_in_progress: in_flight.iter().map(|s| s.to_string()).collect(),
            warnings: Vec::new(),
            channel_error: None,
        }
    }

    #[test]
    fn outcome_distinguishes_timeout_from_crash() {
        assert_eq!(result(true, false, &[]).outcome(), ForkOutcome::Completed);
        assert_eq!(result(false, false, &[]).outcome(), ForkOutcome::Crashed);
        assert_eq!(result(false, true, &[]).outcome(), ForkOutcome::TimedOut);
        assert_eq!(result(true, true, &[]).outcome(), ForkOutcome::TimedOut);
    }

    #[test]
    fn crash_message_lists_in_flight_tests() {
        let message = result(false, false, &["a.A", "b.B"]).failure_message().unwrap();
        assert!(message.contains("terminated without properly saying goodbye"));
        assert!(message.ends_with("Crashed tests:\na.A\nb.B"));
        assert!(result(true, false, &[]).failure_message().is_none());
    }

    #[tokio::test]
    async fn native_output_keeps_draining_after_invalid_utf8() {
        use tokio::io::AsyncWriteExt;

        let (mut worker, controller) = tokio::io::duplex(8);
        let reader = tokio::spawn(forward_native_output(1, "stderr", controller));
        worker.write_all(b"caf\xe9\n").await.unwrap();
        worker.write_all(b"\xff\xfe binary noise\n").await.unwrap();
        worker.write_all(b"still alive\n").await.unwrap();
        drop(worker);
        reader.await.unwrap();
    }

    #[test]
    fn builder_collects_args() {
        let spec = ForkSpec::new("worker").arg("-v").args(["a", "b"]);
        assert_eq!(spec.args, vec!["-v", "a", "b"]);
    }
}
