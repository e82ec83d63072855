//! Immutable routing table from decoded events to typed listeners.
//!
//! The table is built once and shared by every session of the same type; each
//! listener receives the session it is dispatched against.

use std::collections::HashMap;

use anyhow::Result;
use log::debug;

use forkline_protocol::{
    ConsoleLevel, ControlSignal, Event, ReportEntry, ReportKind, StackTraceWriter, StreamKind,
    StreamOutput,
};

type ControlListener<T> = Box<dyn Fn(&T) -> Result<()> + Send + Sync>;
type ConsoleListener<T> = Box<dyn Fn(&T, Option<String>) -> Result<()> + Send + Sync>;
type StackTraceListener<T> = Box<dyn Fn(&T, StackTraceWriter) -> Result<()> + Send + Sync>;
type StreamListener<T> = Box<dyn Fn(&T, StreamOutput) -> Result<()> + Send + Sync>;
type PropertyListener<T> = Box<dyn Fn(&T, String, Option<String>) -> Result<()> + Send + Sync>;
type ReportListener<T> = Box<dyn Fn(&T, ReportEntry) -> Result<()> + Send + Sync>;

pub struct DispatchTable<T> {
    control: HashMap<ControlSignal, ControlListener<T>>,
    console: HashMap<ConsoleLevel, ConsoleListener<T>>,
    console_error: Option<StackTraceListener<T>>,
    stream: HashMap<StreamKind, StreamListener<T>>,
    property: Option<PropertyListener<T>>,
    report: HashMap<ReportKind, ReportListener<T>>,
    exit_error: Option<StackTraceListener<T>>,
}

impl<T> DispatchTable<T> {
    pub fn builder() -> DispatchTableBuilder<T> {
        DispatchTableBuilder {
            table: DispatchTable {
                control: HashMap::new(),
                console: HashMap::new(),
                console_error: None,
                stream: HashMap::new(),
                property: None,
                report: HashMap::new(),
                exit_error: None,
            },
        }
    }

    /// Route `event` to its listener. Events without a listener are ignored.
    pub fn dispatch(&self, target: &T, event: Event) -> Result<()> {
        let opcode = event.opcode();
        let handled = match event {
            Event::Control(signal) => self.control.get(&signal).map(|l| l(target)),
            Event::Console { level, message } => self.console.get(&level).map(|l| l(target, message)),
            Event::ConsoleError(trace) => self.console_error.as_ref().map(|l| l(target, trace)),
            Event::StandardStream(output) => self.stream.get(&output.stream).map(|l| l(target, output)),
            Event::SystemProperty { key, value } => self.property.as_ref().map(|l| l(target, key, value)),
            Event::Report { kind, entry } => self.report.get(&kind).map(|l| l(target, entry)),
            Event::ExitError(trace) => self.exit_error.as_ref().map(|l| l(target, trace)),
        };
        match handled {
            Some(result) => result,
            None => {
                debug!("No listener for {}", opcode);
                Ok(())
            }
        }
    }
}

pub struct DispatchTableBuilder<T> {
    table: DispatchTable<T>,
}

impl<T> DispatchTableBuilder<T> {
    pub fn on_control<F>(mut self, signal: ControlSignal, listener: F) -> Self
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        self.table.control.insert(signal, Box::new(listener));
        self
    }

    pub fn on_console<F>(mut self, level: ConsoleLevel, listener: F) -> Self
    where
        F: Fn(&T, Option<String>) -> Result<()> + Send + Sync + 'static,
    {
        self.table.console.insert(level, Box::new(listener));
        self
    }

    pub fn on_console_error<F>(mut self, listener: F) -> Self
    where
        F: Fn(&T, StackTraceWriter) -> Result<()> + Send + Sync + 'static,
    {
        self.table.console_error = Some(Box::new(listener));
        self
    }

    /// One listener per stream; it receives both the plain and the new-line variant.
    pub fn on_stream<F>(mut self, stream: StreamKind, listener: F) -> Self
    where
        F: Fn(&T, StreamOutput) -> Result<()> + Send + Sync + 'static,
    {
        self.table.stream.insert(stream, Box::new(listener));
        self
    }

    pub fn on_system_property<F>(mut self, listener: F) -> Self
    where
        F: Fn(&T, String, Option<String>) -> Result<()> + Send + Sync + 'static,
    {
        self.table.property = Some(Box::new(listener));
        self
    }

    pub fn on_report<F>(mut self, kind: ReportKind, listener: F) -> Self
    where
        F: Fn(&T, ReportEntry) -> Result<()> + Send + Sync + 'static,
    {
        self.table.report.insert(kind, Box::new(listener));
        self
    }

    pub fn on_exit_error<F>(mut self, listener: F) -> Self
    where
        F: Fn(&T, StackTraceWriter) -> Result<()> + Send + Sync + 'static,
    {
        self.table.exit_error = Some(Box::new(listener));
        self
    }

    pub fn build(self) -> DispatchTable<T> {
        self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    impl Log {
        fn push(&self, s: impl Into<String>) -> Result<()> {
            self.0.lock().unwrap().push(s.into());
            Ok(())
        }
    }

    #[test]
    fn routes_by_category_and_ignores_unregistered() {
        let table = DispatchTable::<Log>::builder()
            .on_control(ControlSignal::Bye, |log| log.push("bye"))
            .on_stream(StreamKind::StdOut, |log, out| log.push(out.text()))
            .on_report(ReportKind::TestStarting, |log, entry| {
                log.push(entry.name.unwrap_or_default())
            })
            .build();
        let log = Log::default();

        table.dispatch(&log, Event::Control(ControlSignal::Bye)).unwrap();
        table.dispatch(&log, Event::Control(ControlSignal::NextTest)).unwrap();
        table
            .dispatch(
                &log,
                Event::report(ReportKind::TestStarting, ReportEntry::new("S", Some("t1".into()))),
            )
            .unwrap();
        for new_line in [false, true] {
            let out = StreamOutput {
                stream: StreamKind::StdOut,
                run_mode: Default::default(),
                charset: Default::default(),
                output: b"hi".to_vec(),
                new_line,
            };
            table.dispatch(&log, Event::StandardStream(out)).unwrap();
        }

        assert_eq!(*log.0.lock().unwrap(), vec!["bye", "t1", "hi", "hi"]);
    }

    #[test]
    fn listener_errors_propagate() {
        let table = DispatchTable::<()>::builder()
            .on_console(ConsoleLevel::Warning, |_, msg| {
                anyhow::bail!("rejected {}", msg.unwrap_or_default())
            })
            .build();
        let err = table
            .dispatch(
                &(),
                Event::Console {
                    level: ConsoleLevel::Warning,
                    message: Some("w".into()),
                },
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "rejected w");
    }
}
