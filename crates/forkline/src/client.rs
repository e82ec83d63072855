//! Per-fork session state driven by decoded events.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use log::{debug, warn};
use once_cell::sync::Lazy;

use forkline_protocol::{
    ConsoleLevel, ControlSignal, Event, ReportEntry, ReportKind, Shutdown, StackTraceWriter,
    StreamKind, StreamOutput,
};

use crate::dispatch::DispatchTable;
use crate::dump::DumpSink;
use crate::reporter::Reporter;
use crate::stream::NotifiableTestStream;

/// Consumer side of the event pump.
pub trait EventHandler: Send + Sync + 'static {
    fn handle_event(&self, event: Event) -> Result<()>;
}

/// Clock used for the fork timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestSetClock {
    #[default]
    NotStarted,
    /// Millis since the epoch when the first test set started.
    Running(i64),
    TimedOut,
}

type StopHook = Box<dyn Fn() + Send + Sync>;

static DISPATCH: Lazy<DispatchTable<ForkClient>> = Lazy::new(|| {
    DispatchTable::builder()
        .on_report(ReportKind::TestSetStarting, ForkClient::on_test_set_starting)
        .on_report(ReportKind::TestSetCompleted, ForkClient::on_test_set_completed)
        .on_report(ReportKind::TestStarting, ForkClient::on_test_starting)
        .on_report(ReportKind::TestSucceeded, ForkClient::on_test_succeeded)
        .on_report(ReportKind::TestFailed, ForkClient::on_test_failed)
        .on_report(ReportKind::TestSkipped, ForkClient::on_test_skipped)
        .on_report(ReportKind::TestError, ForkClient::on_test_error)
        .on_report(
            ReportKind::TestAssumptionFailure,
            ForkClient::on_test_assumption_failure,
        )
        .on_system_property(ForkClient::on_system_property)
        .on_stream(StreamKind::StdOut, ForkClient::on_std_out)
        .on_stream(StreamKind::StdErr, ForkClient::on_std_err)
        .on_console(ConsoleLevel::Info, ForkClient::on_console_info)
        .on_console(ConsoleLevel::Debug, ForkClient::on_console_debug)
        .on_console(ConsoleLevel::Warning, ForkClient::on_console_warning)
        .on_console_error(ForkClient::on_console_error)
        .on_exit_error(ForkClient::on_exit_error)
        .on_control(ControlSignal::NextTest, ForkClient::on_acquire_next_test)
        .on_control(ControlSignal::Bye, ForkClient::on_bye)
        .on_control(ControlSignal::StopOnNextTest, ForkClient::on_stop_on_next_test)
        .build()
});

/// Session state of one forked worker.
///
/// Events arrive on the pump's consumer thread; the watchdog and the launcher
/// query the state from other threads.
pub struct ForkClient {
    fork_number: u32,
    reporter: Arc<dyn Reporter>,
    test_stream: Arc<dyn NotifiableTestStream>,
    dump: Arc<dyn DumpSink>,
    /// Source names of started tests, in start order.
    tests_in_progress: Mutex<Vec<String>>,
    system_properties: DashMap<String, String>,
    clock: Mutex<TestSetClock>,
    said_goodbye: AtomicBool,
    error_in_fork: OnceLock<StackTraceWriter>,
    warnings_at_end: Mutex<Vec<String>>,
    stop_on_next_test: Option<StopHook>,
}

impl ForkClient {
    pub fn new(
        fork_number: u32,
        reporter: Arc<dyn Reporter>,
        test_stream: Arc<dyn NotifiableTestStream>,
        dump: Arc<dyn DumpSink>,
    ) -> Self {
        Self {
            fork_number,
            reporter,
            test_stream,
            dump,
            tests_in_progress: Mutex::new(Vec::new()),
            system_properties: DashMap::new(),
            clock: Mutex::new(TestSetClock::NotStarted),
            said_goodbye: AtomicBool::new(false),
            error_in_fork: OnceLock::new(),
            warnings_at_end: Mutex::new(Vec::new()),
            stop_on_next_test: None,
        }
    }

    /// Called when the worker asks to stop after its current test, typically to
    /// make other forks skip their remaining work.
    pub fn with_stop_on_next_test(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.stop_on_next_test = Some(Box::new(hook));
        self
    }

    pub fn fork_number(&self) -> u32 {
        self.fork_number
    }

    pub fn reporter(&self) -> &Arc<dyn Reporter> {
        &self.reporter
    }

    pub fn test_stream(&self) -> &Arc<dyn NotifiableTestStream> {
        &self.test_stream
    }

    pub fn dump_sink(&self) -> &Arc<dyn DumpSink> {
        &self.dump
    }

    // ========================================================================
    // Test lifecycle
    // ========================================================================

    pub fn on_test_set_starting(&self, entry: ReportEntry) -> Result<()> {
        {
            let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
            if *clock == TestSetClock::NotStarted {
                *clock = TestSetClock::Running(now_millis());
            }
        }
        self.reporter.test_set_starting(&entry)
    }

    pub fn on_test_set_completed(&self, mut entry: ReportEntry) -> Result<()> {
        self.in_progress().clear();
        entry.system_properties.extend(self.test_vm_system_properties());
        self.reporter.test_set_completed(&entry)
    }

    pub fn on_test_starting(&self, entry: ReportEntry) -> Result<()> {
        if let Some(source) = &entry.source_name {
            self.in_progress().push(source.clone());
        }
        self.reporter.test_starting(&entry)
    }

    pub fn on_test_succeeded(&self, entry: ReportEntry) -> Result<()> {
        self.finish_test(&entry);
        self.reporter.test_succeeded(&entry)
    }

    pub fn on_test_failed(&self, entry: ReportEntry) -> Result<()> {
        self.finish_test(&entry);
        self.reporter.test_failed(&entry)
    }

    pub fn on_test_skipped(&self, entry: ReportEntry) -> Result<()> {
        self.finish_test(&entry);
        self.reporter.test_skipped(&entry)
    }

    pub fn on_test_error(&self, entry: ReportEntry) -> Result<()> {
        self.finish_test(&entry);
        self.reporter.test_error(&entry)
    }

    pub fn on_test_assumption_failure(&self, entry: ReportEntry) -> Result<()> {
        self.finish_test(&entry);
        self.reporter.test_assumption_failure(&entry)
    }

    /// Remove one occurrence of the test's source; unknown names are ignored.
    fn finish_test(&self, entry: &ReportEntry) {
        let Some(source) = &entry.source_name else {
            return;
        };
        let mut in_progress = self.in_progress();
        if let Some(index) = in_progress.iter().position(|s| s == source) {
            in_progress.remove(index);
        }
    }

    fn in_progress(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.tests_in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ========================================================================
    // Output and properties
    // ========================================================================

    pub fn on_system_property(&self, key: String, value: Option<String>) -> Result<()> {
        self.system_properties
            .insert(key, value.unwrap_or_default());
        Ok(())
    }

    pub fn on_std_out(&self, output: StreamOutput) -> Result<()> {
        self.reporter.write_test_output(&output)
    }

    pub fn on_std_err(&self, output: StreamOutput) -> Result<()> {
        self.reporter.write_test_output(&output)
    }

    pub fn on_console_info(&self, message: Option<String>) -> Result<()> {
        self.reporter.info(message.as_deref().unwrap_or_default());
        Ok(())
    }

    pub fn on_console_debug(&self, message: Option<String>) -> Result<()> {
        self.reporter.debug(message.as_deref().unwrap_or_default());
        Ok(())
    }

    pub fn on_console_warning(&self, message: Option<String>) -> Result<()> {
        self.reporter.warning(message.as_deref().unwrap_or_default());
        Ok(())
    }

    /// Capture the first error, log it, and always dump it.
    pub fn on_console_error(&self, trace: StackTraceWriter) -> Result<()> {
        let message = trace.message.clone().unwrap_or_default();
        if self.error_in_fork.set(trace.clone()).is_ok() {
            self.reporter.error(&message, Some(&trace));
        }
        self.dump
            .dump_exception(self.fork_number, &message, Some(&trace));
        Ok(())
    }

    pub fn on_exit_error(&self, trace: StackTraceWriter) -> Result<()> {
        let message = format!(
            "The forked worker {} failed: {}",
            self.fork_number,
            trace.message.as_deref().unwrap_or("no message")
        );
        let _ = self.error_in_fork.set(trace.clone());
        self.reporter.error(&message, Some(&trace));
        self.dump
            .dump_exception(self.fork_number, &message, Some(&trace));
        Ok(())
    }

    // ========================================================================
    // Control
    // ========================================================================

    pub fn on_acquire_next_test(&self) -> Result<()> {
        self.test_stream.provide_new_test();
        Ok(())
    }

    pub fn on_bye(&self) -> Result<()> {
        self.said_goodbye.store(true, Ordering::Release);
        self.test_stream.acknowledge_bye_event_received();
        Ok(())
    }

    pub fn on_stop_on_next_test(&self) -> Result<()> {
        if let Some(hook) = &self.stop_on_next_test {
            hook();
        }
        Ok(())
    }

    /// Kill the worker once its test set has run for `timeout_secs`.
    ///
    /// Returns true only for the call that fired the kill.
    pub fn try_to_timeout(&self, now_millis: i64, timeout_secs: u64) -> bool {
        if timeout_secs == 0 {
            return false;
        }
        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        let TestSetClock::Running(started) = *clock else {
            return false;
        };
        let limit = i64::try_from(timeout_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        if now_millis.saturating_sub(started) < limit {
            return false;
        }
        *clock = TestSetClock::TimedOut;
        drop(clock);

        warn!(
            "Fork {} exceeded the timeout of {} s, killing it",
            self.fork_number, timeout_secs
        );
        self.test_stream.shutdown(Shutdown::Kill);
        true
    }

    /// Request a forced shutdown unless the worker already said goodbye.
    pub fn kill(&self) {
        if self.is_said_goodbye() {
            debug!("Fork {} already said goodbye, not killing", self.fork_number);
            return;
        }
        self.test_stream.shutdown(Shutdown::Kill);
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn is_said_goodbye(&self) -> bool {
        self.said_goodbye.load(Ordering::Acquire)
    }

    pub fn had_timeout(&self) -> bool {
        *self.clock.lock().unwrap_or_else(PoisonError::into_inner) == TestSetClock::TimedOut
    }

    pub fn clock(&self) -> TestSetClock {
        *self.clock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn error_in_fork(&self) -> Option<&StackTraceWriter> {
        self.error_in_fork.get()
    }

    pub fn is_error_in_fork(&self) -> bool {
        self.error_in_fork.get().is_some()
    }

    pub fn has_tests_in_progress(&self) -> bool {
        !self.in_progress().is_empty()
    }

    /// Sorted snapshot of the tests still running.
    pub fn tests_in_progress(&self) -> Vec<String> {
        let mut snapshot = self.in_progress().clone();
        snapshot.sort();
        snapshot
    }

    pub fn test_vm_system_properties(&self) -> BTreeMap<String, String> {
        self.system_properties
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Remember a warning to print once the fork has finished.
    pub fn warn_at_end(&self, message: impl Into<String>) {
        self.warnings_at_end
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.into());
    }

    pub fn warnings_at_end(&self) -> Vec<String> {
        self.warnings_at_end
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventHandler for ForkClient {
    fn handle_event(&self, event: Event) -> Result<()> {
        DISPATCH.dispatch(self, event)
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
