//! Frame decoder and encoder.
//!
//! A frame is `:forkline-event:<opcode>[:<run-mode>]:<charset>:<field>...`.
//! String fields are base64 of the text encoded in the declared charset, and
//! `-` stands for an absent value. An empty string is the empty token, so the
//! two never collide.

use std::str::{FromStr, Split};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{DecodeError, DecodeResult};
use crate::event::{
    ConsoleLevel, ControlSignal, Event, ReportEntry, ReportKind, StackTraceWriter, StreamKind,
    StreamOutput,
};
use crate::opcode::{Category, Charset, MAGIC_NUMBER, NULL_TOKEN, Opcode, RunMode};

const DELIMITER: char = ':';

// ============================================================================
// Decoding
// ============================================================================

/// Decode one line into an event.
///
/// Trailing `\r`/`\n` are ignored. Lines without the frame marker fail with
/// [`DecodeError::MissingMagicNumber`].
pub fn decode_frame(line: &str) -> DecodeResult<Event> {
    let line = line.trim_end_matches(['\r', '\n']);
    let body = line
        .strip_prefix(MAGIC_NUMBER)
        .and_then(|rest| rest.strip_prefix(DELIMITER))
        .ok_or(DecodeError::MissingMagicNumber)?;

    let mut split = body.split(DELIMITER);
    let token = split.next().unwrap_or_default();
    let opcode =
        Opcode::from_token(token).ok_or_else(|| DecodeError::UnknownOpcode(token.to_string()))?;
    let mut tokens = Tokens { opcode, split };

    let event = match opcode.category() {
        Category::Control => Event::Control(match opcode {
            Opcode::Bye => ControlSignal::Bye,
            Opcode::StopOnNextTest => ControlSignal::StopOnNextTest,
            _ => ControlSignal::NextTest,
        }),
        Category::Console => {
            let charset = tokens.charset()?;
            let message = tokens.string("message", charset)?;
            let level = match opcode {
                Opcode::ConsoleDebugLog => ConsoleLevel::Debug,
                Opcode::ConsoleWarningLog => ConsoleLevel::Warning,
                _ => ConsoleLevel::Info,
            };
            Event::Console { level, message }
        }
        Category::ConsoleError => {
            let charset = tokens.charset()?;
            Event::ConsoleError(tokens.stack_trace(charset)?)
        }
        Category::ExitError => {
            let charset = tokens.charset()?;
            Event::ExitError(tokens.stack_trace(charset)?)
        }
        Category::StandardStream => {
            let run_mode = tokens.run_mode()?;
            let charset = tokens.charset()?;
            let output = tokens.bytes("output")?;
            let (stream, new_line) = match opcode {
                Opcode::StdOutStream => (StreamKind::StdOut, false),
                Opcode::StdOutStreamNewLine => (StreamKind::StdOut, true),
                Opcode::StdErrStream => (StreamKind::StdErr, false),
                _ => (StreamKind::StdErr, true),
            };
            Event::StandardStream(StreamOutput {
                stream,
                run_mode,
                charset,
                output,
                new_line,
            })
        }
        Category::SystemProperty => {
            let charset = tokens.charset()?;
            let key = tokens.string("key", charset)?.unwrap_or_default();
            if key.trim().is_empty() {
                return Err(DecodeError::BlankPropertyKey);
            }
            let value = tokens.string("value", charset)?;
            Event::SystemProperty { key, value }
        }
        Category::Test => {
            let run_mode = tokens.run_mode()?;
            let charset = tokens.charset()?;
            let entry = ReportEntry {
                run_mode,
                source_name: tokens.string("source", charset)?,
                source_text: tokens.string("source-text", charset)?,
                name: tokens.string("name", charset)?,
                name_text: tokens.string("name-text", charset)?,
                group: tokens.string("group", charset)?,
                message: tokens.string("message", charset)?,
                elapsed: tokens.integer("elapsed")?,
                stack_trace: Some(tokens.stack_trace(charset)?).filter(|t| !t.is_empty()),
                system_properties: Default::default(),
            };
            let kind = ReportKind::from_opcode(opcode).ok_or_else(|| {
                DecodeError::UnknownOpcode(opcode.as_str().to_string())
            })?;
            Event::Report { kind, entry }
        }
    };

    tokens.finish()?;
    Ok(event)
}

/// Decode a line, routing any failure to `on_error` together with the raw line.
///
/// Returns `None` when the line was rejected; `on_error` is called exactly once
/// in that case and never otherwise.
pub fn handle_frame<F>(line: &str, on_error: F) -> Option<Event>
where
    F: FnOnce(&str, &DecodeError),
{
    match decode_frame(line) {
        Ok(event) => Some(event),
        Err(e) => {
            on_error(line, &e);
            None
        }
    }
}

struct Tokens<'a> {
    opcode: Opcode,
    split: Split<'a, char>,
}

impl<'a> Tokens<'a> {
    fn next(&mut self, field: &'static str) -> DecodeResult<&'a str> {
        self.split.next().ok_or(DecodeError::MissingField {
            opcode: self.opcode,
            field,
        })
    }

    fn run_mode(&mut self) -> DecodeResult<RunMode> {
        RunMode::from_str(self.next("run-mode")?)
    }

    fn charset(&mut self) -> DecodeResult<Charset> {
        Charset::from_str(self.next("charset")?)
    }

    fn string(&mut self, field: &'static str, charset: Charset) -> DecodeResult<Option<String>> {
        let token = self.next(field)?;
        if token == NULL_TOKEN {
            return Ok(None);
        }
        let bytes = base64(token, field)?;
        Ok(Some(charset.decode(&bytes)))
    }

    fn bytes(&mut self, field: &'static str) -> DecodeResult<Vec<u8>> {
        let token = self.next(field)?;
        if token == NULL_TOKEN {
            return Ok(Vec::new());
        }
        base64(token, field)
    }

    fn integer(&mut self, field: &'static str) -> DecodeResult<Option<i32>> {
        let token = self.next(field)?;
        if token == NULL_TOKEN {
            return Ok(None);
        }
        parse_integer(token)
            .map(Some)
            .map_err(|source| DecodeError::Integer {
                field,
                token: token.to_string(),
                source,
            })
    }

    fn stack_trace(&mut self, charset: Charset) -> DecodeResult<StackTraceWriter> {
        Ok(StackTraceWriter {
            message: self.string("trace-message", charset)?,
            smart_trimmed_stack_trace: self.string("smart-trace", charset)?,
            stack_trace: self.string("stack-trace", charset)?,
        })
    }

    fn finish(self) -> DecodeResult<()> {
        let opcode = self.opcode;
        match self.split.count() {
            0 => Ok(()),
            count => Err(DecodeError::TrailingFields { opcode, count }),
        }
    }
}

fn base64(token: &str, field: &'static str) -> DecodeResult<Vec<u8>> {
    STANDARD
        .decode(token)
        .map_err(|source| DecodeError::Base64 { field, source })
}

/// Parse a decimal, `0x`/`#` hexadecimal or leading-zero octal integer with an
/// optional sign.
fn parse_integer(token: &str) -> Result<i32, std::num::ParseIntError> {
    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };
    let (radix, digits) = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .or_else(|| digits.strip_prefix('#'))
    {
        (16, hex)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits)
    };
    // Reject a second sign after the prefix.
    if digits.starts_with(['+', '-']) {
        return i32::from_str_radix("", radix);
    }
    if negative {
        i32::from_str_radix(&format!("-{digits}"), radix)
    } else {
        i32::from_str_radix(digits, radix)
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode an event as a frame line without the trailing newline.
///
/// String fields are written as UTF-8. Stream output keeps its declared
/// charset because its bytes are passed through untouched.
pub fn encode_event(event: &Event) -> String {
    let mut frame = Frame::new(event.opcode());
    match event {
        Event::Control(_) => {}
        Event::Console { message, .. } => {
            frame.charset(Charset::Utf8);
            frame.string(message.as_deref());
        }
        Event::ConsoleError(trace) | Event::ExitError(trace) => {
            frame.charset(Charset::Utf8);
            frame.stack_trace(Some(trace));
        }
        Event::StandardStream(out) => {
            frame.token(out.run_mode.as_str());
            frame.charset(out.charset);
            frame.token(&STANDARD.encode(&out.output));
        }
        Event::SystemProperty { key, value } => {
            frame.charset(Charset::Utf8);
            frame.string(Some(key));
            frame.string(value.as_deref());
        }
        Event::Report { entry, .. } => {
            frame.token(entry.run_mode.as_str());
            frame.charset(Charset::Utf8);
            frame.string(entry.source_name.as_deref());
            frame.string(entry.source_text.as_deref());
            frame.string(entry.name.as_deref());
            frame.string(entry.name_text.as_deref());
            frame.string(entry.group.as_deref());
            frame.string(entry.message.as_deref());
            match entry.elapsed {
                Some(elapsed) => frame.token(&elapsed.to_string()),
                None => frame.token(NULL_TOKEN),
            }
            frame.stack_trace(entry.stack_trace.as_ref());
        }
    }
    frame.line
}

struct Frame {
    line: String,
}

impl Frame {
    fn new(opcode: Opcode) -> Self {
        let mut line = String::with_capacity(64);
        line.push_str(MAGIC_NUMBER);
        line.push(DELIMITER);
        line.push_str(opcode.as_str());
        Self { line }
    }

    fn token(&mut self, token: &str) {
        self.line.push(DELIMITER);
        self.line.push_str(token);
    }

    fn charset(&mut self, charset: Charset) {
        self.token(charset.name());
    }

    fn string(&mut self, value: Option<&str>) {
        match value {
            Some(value) => self.token(&STANDARD.encode(value)),
            None => self.token(NULL_TOKEN),
        }
    }

    fn stack_trace(&mut self, trace: Option<&StackTraceWriter>) {
        let trace = trace.cloned().unwrap_or_default();
        self.string(trace.message.as_deref());
        self.string(trace.smart_trimmed_stack_trace.as_deref());
        self.string(trace.stack_trace.as_deref());
    }
}
