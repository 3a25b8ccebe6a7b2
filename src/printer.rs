//! Line oriented rendering of tapped messages.

use std::io::{self, Write};

use amqptap_types::TapMessage;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};

/// Output format of the printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// One human readable line per message.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Writes one line per message.
#[derive(Debug)]
pub struct Printer<W> {
    out: W,
    format: Format,
}

impl Printer<io::Stdout> {
    pub fn stdout(format: Format) -> Self {
        Self::new(io::stdout(), format)
    }
}

impl<W: Write> Printer<W> {
    pub fn new(out: W, format: Format) -> Self {
        Self { out, format }
    }

    /// Render and flush one message.
    pub fn print(&mut self, message: &TapMessage) -> io::Result<()> {
        match self.format {
            Format::Text => writeln!(self.out, "{}", text_line(message))?,
            Format::Json => writeln!(self.out, "{}", json_line(message))?,
        }
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// `<received_at_ms> <source> <exchange> <routing_key> <body>`
pub fn text_line(message: &TapMessage) -> String {
    let routing_key = if message.routing_key().is_empty() {
        "-"
    } else {
        message.routing_key()
    };
    format!(
        "{} {} {} {} {}",
        message.received_at_ms(),
        message.source_uri(),
        message.exchange(),
        routing_key,
        body_preview(message.body())
    )
}

/// JSON object with provenance, envelope and body.
///
/// UTF-8 bodies are emitted as strings; anything else is base64 encoded and
/// flagged with `"body_encoding": "base64"`.
pub fn json_line(message: &TapMessage) -> Value {
    let (body, encoding) = match std::str::from_utf8(message.body()) {
        Ok(text) => (Value::String(text.to_string()), "utf8"),
        Err(_) => (Value::String(STANDARD.encode(message.body())), "base64"),
    };

    json!({
        "source": message.source_uri(),
        "exchange": message.exchange(),
        "routing_key": message.routing_key(),
        "received_at_ms": message.received_at_ms(),
        "properties": serde_json::to_value(message.envelope()).unwrap_or(Value::Null),
        "body_encoding": encoding,
        "body": body,
    })
}

fn body_preview(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(text) => text.replace('\n', "\\n"),
        Err(_) => format!("<{} bytes binary>", body.len()),
    }
}
