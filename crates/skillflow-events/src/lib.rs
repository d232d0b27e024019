#![forbid(unsafe_code)]

use std::io::Write;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use skillflow_domain::{now_utc, DateTimeUtc};

pub const MARKER_START: &str = "[EVENT]";
pub const MARKER_END: &str = "[/EVENT]";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStart,
    WorkflowStep,
    WorkflowComplete,
    WorkflowError,
    WorkflowBlocked,
    WorkflowCancel,
    TeamActivate,
    TeamMessage,
    ContractCheck,
    GateCheck,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowStart => "workflow_start",
            Self::WorkflowStep => "workflow_step",
            Self::WorkflowComplete => "workflow_complete",
            Self::WorkflowError => "workflow_error",
            Self::WorkflowBlocked => "workflow_blocked",
            Self::WorkflowCancel => "workflow_cancel",
            Self::TeamActivate => "team_activate",
            Self::TeamMessage => "team_message",
            Self::ContractCheck => "contract_check",
            Self::GateCheck => "gate_check",
        }
    }
}

/// Lifecycle notification; carries no state of its own beyond emission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: DateTimeUtc,
    pub data: Value,
}

impl WorkflowEvent {
    #[must_use]
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            timestamp: now_utc(),
            data,
        }
    }
}

/// Receiver of lifecycle events. Delivery is fire-and-forget.
pub trait EventSink {
    fn emit(&self, event: &WorkflowEvent);
}

/// Typed in-memory side channel.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: Mutex<Vec<WorkflowEvent>>,
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything queued so far.
    pub fn drain(&self) -> Vec<WorkflowEvent> {
        let mut guard = self.events.lock().unwrap_or_else(|err| err.into_inner());
        std::mem::take(&mut *guard)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<WorkflowEvent> {
        self.events
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    #[must_use]
    pub fn types(&self) -> Vec<EventType> {
        self.snapshot()
            .into_iter()
            .map(|event| event.event_type)
            .collect()
    }
}

impl EventSink for EventQueue {
    fn emit(&self, event: &WorkflowEvent) {
        self.events
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .push(event.clone());
    }
}

/// Writes `[EVENT]<json>[/EVENT]` lines for consumers that scrape text.
pub struct MarkerWriter<W: Write> {
    out: Mutex<W>,
}

impl<W: Write> MarkerWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|err| err.into_inner())
    }

    fn write_line(&self, event: &WorkflowEvent) -> Result<()> {
        let line = encode_marker(event)?;
        let mut out = self.out.lock().unwrap_or_else(|err| err.into_inner());
        writeln!(out, "{line}").context("failed to write event marker")?;
        out.flush().context("failed to flush event marker")
    }
}

impl<W: Write> EventSink for MarkerWriter<W> {
    fn emit(&self, event: &WorkflowEvent) {
        if let Err(err) = self.write_line(event) {
            tracing::warn!(event = event.event_type.as_str(), error = %err, "event write failed");
        }
    }
}

/// One JSON object per line.
pub struct JsonLinesWriter<W: Write> {
    out: Mutex<W>,
}

impl<W: Write> JsonLinesWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|err| err.into_inner())
    }

    fn write_line(&self, event: &WorkflowEvent) -> Result<()> {
        let mut out = self.out.lock().unwrap_or_else(|err| err.into_inner());
        serde_json::to_writer(&mut *out, event).context("failed to serialize event")?;
        writeln!(out).context("failed to write event newline")?;
        out.flush().context("failed to flush event line")
    }
}

impl<W: Write> EventSink for JsonLinesWriter<W> {
    fn emit(&self, event: &WorkflowEvent) {
        if let Err(err) = self.write_line(event) {
            tracing::warn!(event = event.event_type.as_str(), error = %err, "event write failed");
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &WorkflowEvent) {}
}

/// Forwards each event to every inner sink in order.
#[derive(Default)]
pub struct FanoutSink<'a> {
    sinks: Vec<&'a dyn EventSink>,
}

impl<'a> FanoutSink<'a> {
    #[must_use]
    pub fn new(sinks: Vec<&'a dyn EventSink>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink<'_> {
    fn emit(&self, event: &WorkflowEvent) {
        for sink in &self.sinks {
            sink.emit(event);
        }
    }
}

/// Wrap a serialized event in start/end markers.
///
/// `[/` only occurs inside JSON strings, where `\/` is a valid escape, so the
/// end marker can never appear in the body.
///
/// # Errors
/// Returns an error if the event cannot be serialized.
pub fn encode_marker(event: &WorkflowEvent) -> Result<String> {
    let json = serde_json::to_string(event).context("failed to serialize event")?;
    let json = json.replace("[/", "[\\/");
    Ok(format!("{MARKER_START}{json}{MARKER_END}"))
}

/// Extract every well-formed marked event from free text.
///
/// Malformed JSON and unknown event types are skipped; an unterminated
/// marker ends the scan.
#[must_use]
pub fn parse_events(text: &str) -> Vec<WorkflowEvent> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(MARKER_START) {
        let body_start = start + MARKER_START.len();
        let Some(end) = rest[body_start..].find(MARKER_END) else {
            break;
        };
        let body = &rest[body_start..body_start + end];
        match serde_json::from_str::<WorkflowEvent>(body.trim()) {
            Ok(event) => out.push(event),
            Err(err) => tracing::debug!(error = %err, "skipping malformed event marker"),
        }
        rest = &rest[body_start + end + MARKER_END.len()..];
    }
    out
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde_json::json;

    use super::{
        encode_marker, parse_events, EventQueue, EventSink, EventType, FanoutSink,
        JsonLinesWriter, MarkerWriter, WorkflowEvent,
    };

    fn event(event_type: EventType) -> WorkflowEvent {
        WorkflowEvent::new(event_type, json!({"workflow_id": "feature-build"}))
    }

    #[test]
    fn marker_text_parses_back() {
        let first = event(EventType::WorkflowStart);
        let second = event(EventType::WorkflowComplete);
        let text = format!(
            "log line\n{}\nnoise {} trailing",
            encode_marker(&first).unwrap_or_else(|_| unreachable!()),
            encode_marker(&second).unwrap_or_else(|_| unreachable!()),
        );
        let parsed = parse_events(&text);
        assert_eq!(parsed, vec![first, second]);
    }

    #[test]
    fn malformed_and_unterminated_markers_are_skipped() {
        let good = event(EventType::GateCheck);
        let text = format!(
            "[EVENT]{{not json}}[/EVENT][EVENT]{{\"type\":\"bogus\",\"timestamp\":\"2024-01-01T00:00:00Z\",\"data\":null}}[/EVENT]{}[EVENT]{{\"type\":",
            encode_marker(&good).unwrap_or_else(|_| unreachable!())
        );
        let parsed = parse_events(&text);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].event_type, EventType::GateCheck);
    }

    #[test]
    fn marker_text_inside_event_data_survives_encoding() {
        let noisy = WorkflowEvent::new(
            EventType::TeamMessage,
            json!({"note": "see [/EVENT] tag and [EVENT] too", "path": "a/[/b"}),
        );
        let encoded = encode_marker(&noisy).unwrap_or_else(|_| unreachable!());
        assert_eq!(encoded.matches("[/EVENT]").count(), 1);
        assert_eq!(parse_events(&encoded), vec![noisy.clone()]);

        let markers = MarkerWriter::new(Vec::new());
        markers.emit(&noisy);
        markers.emit(&event(EventType::WorkflowComplete));
        let text = String::from_utf8(markers.into_inner()).unwrap_or_default();
        let parsed = parse_events(&text);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].data, noisy.data);
        assert_eq!(parsed[1].event_type, EventType::WorkflowComplete);
    }

    #[test]
    fn event_serializes_with_type_key() {
        let value = serde_json::to_value(event(EventType::TeamMessage))
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(value["type"], json!("team_message"));
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn writers_produce_expected_lines() {
        let markers = MarkerWriter::new(Vec::new());
        let lines = JsonLinesWriter::new(Vec::new());
        let queue = EventQueue::new();
        {
            let sinks: Vec<&dyn EventSink> = vec![&markers, &lines, &queue];
            let fanout = FanoutSink::new(sinks);
            fanout.emit(&event(EventType::ContractCheck));
        }

        let marker_text = String::from_utf8(markers.into_inner()).unwrap_or_default();
        assert!(marker_text.starts_with("[EVENT]{"));
        assert!(marker_text.trim_end().ends_with("[/EVENT]"));

        let json_text = String::from_utf8(lines.into_inner()).unwrap_or_default();
        let decoded: WorkflowEvent =
            serde_json::from_str(json_text.trim()).unwrap_or_else(|_| unreachable!());
        assert_eq!(decoded.event_type, EventType::ContractCheck);

        assert_eq!(queue.types(), vec![EventType::ContractCheck]);
        assert_eq!(queue.drain().len(), 1);
        assert!(queue.snapshot().is_empty());
    }

    proptest! {
        #[test]
        fn parse_events_never_panics(text in "(\\PC|\\[EVENT\\]|\\[/EVENT\\])*") {
            let _ = parse_events(&text);
        }
    }
}
