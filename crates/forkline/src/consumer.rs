//! Reader task turning a worker's output stream into pump submissions.

use std::io;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use forkline_protocol::{DecodeError, handle_frame};

use crate::client::ForkClient;
use crate::pump::EventPump;

/// Longest line kept from a worker; the rest of an oversized line is discarded.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Printed by a worker started with a debugger agent; harmless.
const DEBUGGER_BANNER: &str = "Listening for transport dt_socket at address:";

/// Line prefixes of the launcher's own start-up failures.
const VM_ERROR_PREFIXES: &[&str] = &["Error: ", "Error occurred during initialization"];

/// Lowercase fragments of messages printed by a VM that failed to start.
const VM_ERROR_PATTERNS: &[&str] = &[
    "could not create the java virtual machine",
    "could not reserve enough space",
    "could not allocate",
    "unable to allocate",
    "java.lang.module.findexception",
];

/// Spawn the task reading `reader` until end of stream.
pub fn spawn_event_consumer<R>(
    reader: R,
    client: Arc<ForkClient>,
    pump: Arc<EventPump>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(consume_events(reader, client, pump))
}

/// Read lines until end of stream, submitting every decoded frame.
pub async fn consume_events<R>(reader: R, client: Arc<ForkClient>, pump: Arc<EventPump>)
where
    R: AsyncRead + Unpin,
{
    consume_lines(reader, client, pump, MAX_LINE_BYTES).await
}

async fn consume_lines<R>(reader: R, client: Arc<ForkClient>, pump: Arc<EventPump>, limit: usize)
where
    R: AsyncRead + Unpin,
{
    let fork = client.fork_number();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    debug!("Event reader for fork {} started", fork);

    loop {
        buf.clear();
        let truncated = match read_line_capped(&mut reader, &mut buf, limit).await {
            Ok((0, _)) => break,
            Ok((_, truncated)) => truncated,
            Err(e) => {
                warn!("Failed to read from fork {}: {}", fork, e);
                break;
            }
        };
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }

        if truncated {
            let line = String::from_utf8_lossy(&buf).into_owned();
            offload(&client, Rejected::Oversized(line)).await;
            continue;
        }
        if buf.is_empty() {
            continue;
        }

        let line = String::from_utf8_lossy(&buf);
        let mut rejected = None;
        let event = handle_frame(&line, |raw, err| rejected = Some(Rejected::new(raw, err)));
        if let Some(event) = event {
            pump.submit(event).await;
        }
        if let Some(rejected) = rejected {
            offload(&client, rejected).await;
        }
    }

    debug!("Event reader for fork {} finished", fork);
}

/// Read one `\n`-terminated line into `buf`, keeping at most `limit` bytes.
///
/// Returns the number of bytes consumed from `reader` (0 at end of stream) and
/// whether the line was cut short.
pub(crate) async fn read_line_capped<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
) -> io::Result<(usize, bool)>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0;
    let mut truncated = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok((consumed, truncated));
        }
        let (chunk, done) = match available.iter().position(|b| *b == b'\n') {
            Some(end) => (&available[..=end], true),
            None => (available, false),
        };
        let room = limit.saturating_sub(buf.len());
        if chunk.len() - usize::from(done) > room {
            truncated = true;
        }
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        let used = chunk.len();
        reader.consume(used);
        consumed += used;
        if done {
            return Ok((consumed, truncated));
        }
    }
}

/// A line that did not yield an event.
enum Rejected {
    /// Written straight to the worker's output, bypassing the protocol.
    Native(String),
    Corrupted { line: String, reason: String },
    Oversized(String),
}

impl Rejected {
    fn new(line: &str, err: &DecodeError) -> Self {
        match err {
            DecodeError::MissingMagicNumber => Rejected::Native(line.to_string()),
            err => Rejected::Corrupted {
                line: line.to_string(),
                reason: err.to_string(),
            },
        }
    }
}

/// Dump sinks write files, so rejected lines are handled on the blocking pool.
async fn offload(client: &Arc<ForkClient>, rejected: Rejected) {
    let client = Arc::clone(client);
    let handled = tokio::task::spawn_blocking(move || match rejected {
        Rejected::Native(line) => on_native_stream(&client, &line),
        Rejected::Corrupted { line, reason } => on_corrupted_frame(&client, &line, &reason),
        Rejected::Oversized(head) => on_oversized_line(&client, &head),
    })
    .await;
    if let Err(e) = handled {
        warn!("Handling a rejected line failed: {}", e);
    }
}

fn on_native_stream(client: &ForkClient, line: &str) {
    let fork = client.fork_number();
    let reporter = client.reporter();
    let dump = client.dump_sink();

    if line.contains(DEBUGGER_BANNER) {
        reporter.debug(line);
        dump.dump_stream_text(fork, line);
        return;
    }

    if is_vm_error(line) {
        reporter.error(line, None);
    } else {
        reporter.debug(line);
    }

    let message =
        format!("Corrupted channel by directly writing to native stream in forked JVM {fork}.");
    let path = dump.dump_stream_text(fork, &format!("{message} Stream '{line}'."));
    client.warn_at_end(format!(
        "{message} See FAQ web page and the dump file {}",
        path.display()
    ));
}

fn on_corrupted_frame(client: &ForkClient, line: &str, reason: &str) {
    let fork = client.fork_number();
    warn!("Fork {} sent a malformed frame: {}", fork, reason);
    let path = client
        .dump_sink()
        .dump_stream_text(fork, &format!("Malformed frame ({reason}): '{line}'"));
    info!("Malformed frame from fork {} dumped to {}", fork, path.display());
}

fn on_oversized_line(client: &ForkClient, head: &str) {
    let fork = client.fork_number();
    warn!(
        "Fork {} wrote an oversized line, keeping its first {} bytes",
        fork,
        head.len()
    );
    client
        .dump_sink()
        .dump_stream_text(fork, &format!("Oversized line truncated: '{head}'"));
}

fn is_vm_error(line: &str) -> bool {
    if VM_ERROR_PREFIXES.iter().any(|p| line.starts_with(p)) {
        return true;
    }
    let lower = line.to_lowercase();
    VM_ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use anyhow::Result;
    use forkline_protocol::{
        Event, ReportEntry, ReportKind, Shutdown, StackTraceWriter, StreamOutput, encode_event,
    };

    use crate::dump::DumpSink;
    use crate::reporter::Reporter;
    use crate::stream::NotifiableTestStream;

    #[test]
    fn recognises_vm_start_up_errors() {
        assert!(is_vm_error("Error: Could not find or load main class Foo"));
        assert!(is_vm_error("Could not reserve enough space for object heap"));
        assert!(!is_vm_error("hello from the worker"));
        assert!(!is_vm_error("assertion error: expected 1"));
        assert!(!is_vm_error("  Error: indented output"));
    }

    #[tokio::test]
    async fn capped_read_keeps_the_head_and_skips_the_rest() {
        let input: &[u8] = b"0123456789abcdef\nok\n";
        let mut reader = BufReader::with_capacity(4, input);
        let mut buf = Vec::new();

        let (consumed, truncated) = read_line_capped(&mut reader, &mut buf, 8).await.unwrap();
        assert_eq!(consumed, 17);
        assert!(truncated);
        assert_eq!(buf, b"01234567");

        buf.clear();
        let (consumed, truncated) = read_line_capped(&mut reader, &mut buf, 8).await.unwrap();
        assert_eq!((consumed, truncated), (3, false));
        assert_eq!(buf, b"ok\n");

        buf.clear();
        assert_eq!(
            read_line_capped(&mut reader, &mut buf, 8).await.unwrap(),
            (0, false)
        );
    }

    #[tokio::test]
    async fn capped_read_returns_an_unterminated_tail() {
        let input: &[u8] = b"tail";
        let mut reader = BufReader::new(input);
        let mut buf = Vec::new();
        let (consumed, truncated) = read_line_capped(&mut reader, &mut buf, 8).await.unwrap();
        assert_eq!((consumed, truncated), (4, false));
        assert_eq!(buf, b"tail");
    }

    struct Quiet;

    impl Reporter for Quiet {
        fn test_set_starting(&self, _: &ReportEntry) -> Result<()> {
            Ok(())
        }
        fn test_set_completed(&self, _: &ReportEntry) -> Result<()> {
            Ok(())
        }
        fn test_starting(&self, _: &ReportEntry) -> Result<()> {
            Ok(())
        }
        fn test_succeeded(&self, _: &ReportEntry) -> Result<()> {
            Ok(())
        }
        fn test_failed(&self, _: &ReportEntry) -> Result<()> {
            Ok(())
        }
        fn test_skipped(&self, _: &ReportEntry) -> Result<()> {
            Ok(())
        }
        fn test_error(&self, _: &ReportEntry) -> Result<()> {
            Ok(())
        }
        fn test_assumption_failure(&self, _: &ReportEntry) -> Result<()> {
            Ok(())
        }
        fn write_test_output(&self, _: &StreamOutput) -> Result<()> {
            Ok(())
        }
    }

    struct Idle;

    impl NotifiableTestStream for Idle {
        fn provide_new_test(&self) {}
        fn acknowledge_bye_event_received(&self) {}
        fn shutdown(&self, _: Shutdown) {}
        fn skip_since_next_test(&self) {}
        fn noop(&self) {}
    }

    #[derive(Default)]
    struct Records(Mutex<Vec<String>>);

    impl DumpSink for Records {
        fn dump_exception(&self, _: u32, message: &str, _: Option<&StackTraceWriter>) -> PathBuf {
            self.0.lock().unwrap().push(message.to_string());
            PathBuf::from("dump")
        }
        fn dump_text(&self, _: u32, text: &str) -> PathBuf {
            self.0.lock().unwrap().push(text.to_string());
            PathBuf::from("dump")
        }
        fn dump_stream_text(&self, _: u32, text: &str) -> PathBuf {
            self.0.lock().unwrap().push(text.to_string());
            PathBuf::from("dumpstream")
        }
    }

    #[tokio::test]
    async fn oversized_line_is_dumped_and_later_frames_still_arrive() {
        let dump = Arc::new(Records::default());
        let client = Arc::new(ForkClient::new(
            1,
            Arc::new(Quiet),
            Arc::new(Idle),
            dump.clone(),
        ));
        let pump = Arc::new(EventPump::new(client.clone()));

        let frame = encode_event(&Event::report(
            ReportKind::TestStarting,
            ReportEntry::new("T1", None),
        ));
        let mut input = vec![b'x'; 300];
        input.push(b'\n');
        input.extend_from_slice(frame.as_bytes());
        input.push(b'\n');

        consume_lines(input.as_slice(), client.clone(), pump.clone(), 200).await;
        pump.close().await.unwrap();

        let records = dump.0.lock().unwrap().clone();
        assert_eq!(records.len(), 1);
        assert!(records[0].starts_with("Oversized line truncated"));
        assert_eq!(client.tests_in_progress(), vec!["T1"]);
    }
}
