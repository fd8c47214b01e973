//! What the CLI prints.
//!
//! With `--json` every stdout line is one JSON document: a `status` line that
//! ends a command, or an `event` line while `pair`/`listen` keep sessions
//! online. Failures go to stderr in the same shape.

use serde::Serialize;
use serde_json::{json, Map, Value};
use wc_bridge::{codec, RegistryEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Human,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Stdout,
    Stderr,
}

#[derive(Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Status<'a, T> {
    Ok { command: &'a str, data: T },
    Error { error: &'a str },
}

/// One line printed while sessions are streamed.
#[derive(Debug, Clone, Copy)]
pub enum StreamLine<'a> {
    Listening { sessions: usize },
    Registry(&'a RegistryEvent),
    Rejected { request_id: u64 },
}

impl StreamLine<'_> {
    fn name(&self) -> &'static str {
        match self {
            StreamLine::Listening { .. } => "listening",
            StreamLine::Rejected { .. } => "rejected",
            StreamLine::Registry(event) => match event {
                RegistryEvent::SessionsChanged => "sessions_changed",
                RegistryEvent::SessionApproved { .. } => "session_approved",
                RegistryEvent::SessionClosed { .. } => "session_closed",
                RegistryEvent::Request { .. } => "request",
            },
        }
    }

    fn body(&self) -> Value {
        match self {
            StreamLine::Listening { sessions } => json!({ "sessions": sessions }),
            StreamLine::Rejected { request_id } => json!({ "id": request_id }),
            StreamLine::Registry(event) => match event {
                RegistryEvent::SessionsChanged => json!({}),
                RegistryEvent::SessionApproved { session_id } => json!({ "sessionId": session_id }),
                RegistryEvent::SessionClosed { session_id, reason } => {
                    json!({ "sessionId": session_id, "reason": reason })
                }
                RegistryEvent::Request { session_id, call } => {
                    json!({ "sessionId": session_id, "request": codec::to_json(call) })
                }
            },
        }
    }

    fn summary(&self) -> String {
        match self {
            StreamLine::Listening { sessions } => format!("{} stored session(s) online", sessions),
            StreamLine::Rejected { request_id } => format!("request {} rejected", request_id),
            StreamLine::Registry(event) => match event {
                RegistryEvent::SessionsChanged => "session list changed".to_string(),
                RegistryEvent::SessionApproved { session_id } => {
                    format!("session {} approved", session_id)
                }
                RegistryEvent::SessionClosed {
                    session_id,
                    reason: Some(reason),
                } => format!("session {} closed: {}", session_id, reason),
                RegistryEvent::SessionClosed { session_id, .. } => {
                    format!("session {} closed", session_id)
                }
                RegistryEvent::Request { session_id, call } => format!(
                    "request {} on session {}\n{}",
                    call.id(),
                    session_id,
                    pretty(&codec::to_json(call))
                ),
            },
        }
    }
}

pub struct Output {
    format: Format,
}

impl Output {
    pub fn new(json: bool) -> Self {
        let format = if json { Format::Json } else { Format::Human };
        Self { format }
    }

    /// Result of a command that finished.
    pub fn success<T: Serialize>(&self, command: &str, data: T) {
        emit(self.render_success(command, data));
    }

    /// A result that is only a confirmation.
    pub fn done(&self, command: &str, message: &str) {
        match self.format {
            Format::Json => self.success(command, json!({ "message": message })),
            Format::Human => emit((Target::Stdout, message.to_string())),
        }
    }

    pub fn error(&self, message: &str) {
        emit(self.render_error(message));
    }

    pub fn stream(&self, line: StreamLine<'_>) {
        emit(self.render_stream(line));
    }

    fn render_success<T: Serialize>(&self, command: &str, data: T) -> (Target, String) {
        let text = match self.format {
            Format::Json => compact(&Status::Ok { command, data }),
            Format::Human => pretty(&data),
        };
        (Target::Stdout, text)
    }

    fn render_error(&self, message: &str) -> (Target, String) {
        let text = match self.format {
            Format::Json => compact(&Status::Error::<()> { error: message }),
            Format::Human => format!("Error: {}", message),
        };
        (Target::Stderr, text)
    }

    fn render_stream(&self, line: StreamLine<'_>) -> (Target, String) {
        let text = match self.format {
            Format::Json => {
                let mut fields = Map::new();
                fields.insert("event".to_string(), Value::from(line.name()));
                if let Value::Object(body) = line.body() {
                    fields.extend(body);
                }
                Value::Object(fields).to_string()
            }
            Format::Human => format!("[{}] {}", line.name(), line.summary()),
        };
        (Target::Stdout, text)
    }
}

fn emit((target, text): (Target, String)) {
    match target {
        Target::Stdout => println!("{}", text),
        Target::Stderr => eprintln!("{}", text),
    }
}

fn compact<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|e| json!({ "status": "error", "error": e.to_string() }).to_string())
}

fn pretty<T: Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("<unprintable: {}>", e))
}
