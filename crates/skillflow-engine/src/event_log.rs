//! Hash-chained event log: every event about a run is persisted before it
//! reaches the sink, chained per subject.

use anyhow::Result;
use serde::Serialize;
use serde_json::{json, Value};
use skillflow_domain::{format_rfc3339, hash_json, EventRecord};
use skillflow_events::{EventSink, EventType, WorkflowEvent};
use skillflow_store_core::{NewEvent, StateStore};

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct ChainReport {
    pub subject_id: String,
    pub events: usize,
    pub chain_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_invalid_seq: Option<i64>,
}

pub struct EventLog<'a> {
    store: &'a dyn StateStore,
    sink: &'a dyn EventSink,
}

impl<'a> EventLog<'a> {
    #[must_use]
    pub fn new(store: &'a dyn StateStore, sink: &'a dyn EventSink) -> Self {
        Self { store, sink }
    }

    /// Append a chained record for `subject_id`, then forward the event.
    ///
    /// # Errors
    /// Returns an error when hashing or the store append fails; the sink is
    /// not called in that case.
    pub fn record(&self, subject_id: &str, event_type: EventType, data: Value) -> Result<i64> {
        let event = WorkflowEvent::new(event_type, data);
        let prev_event_hash = self.store.last_event_hash(subject_id)?;
        let event_hash = chain_hash(
            subject_id,
            event_type.as_str(),
            &format_rfc3339(event.timestamp)?,
            &event.data,
            prev_event_hash.as_deref(),
        )?;

        let seq = self.store.append_event(&NewEvent {
            subject_id: subject_id.to_string(),
            event_type: event_type.as_str().to_string(),
            occurred_at: event.timestamp,
            data: event.data.clone(),
            prev_event_hash,
            event_hash,
        })?;
        self.sink.emit(&event);
        Ok(seq)
    }
}

fn chain_hash(
    subject_id: &str,
    event_type: &str,
    occurred_at: &str,
    data: &Value,
    prev_event_hash: Option<&str>,
) -> Result<String> {
    let material = json!({
        "subject_id": subject_id,
        "event_type": event_type,
        "occurred_at": occurred_at,
        "data_hash": hash_json(data)?,
        "prev_event_hash": prev_event_hash,
    });
    hash_json(&material)
}

/// Recompute the chain for `subject_id` from its stored records.
///
/// # Errors
/// Returns an error when the records cannot be read or hashed.
pub fn verify_chain(store: &dyn StateStore, subject_id: &str) -> Result<ChainReport> {
    let events = store.list_events(subject_id)?;
    let first_invalid_seq = first_broken_link(&events)?;
    Ok(ChainReport {
        subject_id: subject_id.to_string(),
        events: events.len(),
        chain_valid: first_invalid_seq.is_none(),
        first_invalid_seq,
    })
}

fn first_broken_link(events: &[EventRecord]) -> Result<Option<i64>> {
    let mut prev: Option<&str> = None;
    for record in events {
        if record.prev_event_hash.as_deref() != prev {
            return Ok(Some(record.event_seq));
        }
        let expected = chain_hash(
            &record.subject_id,
            &record.event_type,
            &format_rfc3339(record.occurred_at)?,
            &record.data,
            prev,
        )?;
        if expected != record.event_hash {
            return Ok(Some(record.event_seq));
        }
        prev = Some(record.event_hash.as_str());
    }
    Ok(None)
}
