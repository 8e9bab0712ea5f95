use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::descriptor::SourceDbType;

/// Operation carried by one change event.
///
/// The wire strings match what the exporter writes into the event queue. The
/// segment terminator is an ordinary operation value, so equality on plain
/// data identifies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOp {
    /// Row insertion.
    #[serde(rename = "c")]
    Insert,
    /// Row update.
    #[serde(rename = "u")]
    Update,
    /// Row deletion.
    #[serde(rename = "d")]
    Delete,
    /// Terminator record closing an event queue segment.
    #[serde(rename = "end_of_source_queue_segment")]
    EndOfSegment,
}

impl fmt::Display for EventOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::EndOfSegment => write!(f, "end_of_source_queue_segment"),
        }
    }
}

/// One row-level change captured from the source database.
///
/// `key` holds the primary key columns; `fields` holds the post-image for
/// inserts and updates and the pre-image for deletes. Both maps are keyed by
/// column name; values are the exporter's wire representation, or `None` for
/// SQL NULL. The VSN is assigned by the exporter and is strictly increasing
/// across the whole queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub op: EventOp,
    #[serde(default)]
    pub vsn: i64,
    #[serde(default)]
    pub schema_name: String,
    #[serde(default)]
    pub table_name: String,
    #[serde(default)]
    pub key: BTreeMap<String, Option<String>>,
    #[serde(default)]
    pub fields: BTreeMap<String, Option<String>>,
}

impl Event {
    /// Returns `true` if this event is the segment terminator.
    pub fn is_end_of_segment(&self) -> bool {
        self.op == EventOp::EndOfSegment
    }

    /// Returns the table name the event applies to on the target.
    ///
    /// PostgreSQL sources qualify names with the source schema unless the
    /// schema is `public`; other sources address tables by bare name and rely
    /// on the configured target schema.
    pub fn effective_table_name(&self, source_db: SourceDbType) -> String {
        if source_db == SourceDbType::Postgresql && self.schema_name != "public" {
            format!("{}.{}", self.schema_name, self.table_name)
        } else {
            self.table_name.clone()
        }
    }
}

/// Per-operation counters carried by an [`EventBatch`] for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCounts {
    pub num_inserts: i64,
    pub num_updates: i64,
    pub num_deletes: i64,
}

impl EventCounts {
    /// Total number of counted events.
    pub fn total(&self) -> i64 {
        self.num_inserts + self.num_updates + self.num_deletes
    }
}

/// Up to `max_events_per_batch` events destined for one channel, applied as a
/// single transaction together with the channel's watermark update.
#[derive(Debug, Clone)]
pub struct EventBatch {
    pub events: Vec<Event>,
    pub channel_no: usize,
    pub event_counts: EventCounts,
    /// The channel's new watermark if the batch is applied.
    pub max_vsn: i64,
}

impl EventBatch {
    /// Builds a batch from events routed to `channel_no`.
    ///
    /// The events must already be in VSN order; the reader emits them that way
    /// and the single-writer channel preserves it.
    pub fn new(events: Vec<Event>, channel_no: usize) -> Self {
        let mut event_counts = EventCounts::default();
        let mut max_vsn = 0;

        for event in &events {
            match event.op {
                EventOp::Insert => event_counts.num_inserts += 1,
                EventOp::Update => event_counts.num_updates += 1,
                EventOp::Delete => event_counts.num_deletes += 1,
                EventOp::EndOfSegment => {}
            }
            max_vsn = max_vsn.max(event.vsn);
        }

        Self {
            events,
            channel_no,
            event_counts,
            max_vsn,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(op: EventOp, vsn: i64) -> Event {
        Event {
            op,
            vsn,
            schema_name: "public".to_string(),
            table_name: "orders".to_string(),
            key: BTreeMap::from([("id".to_string(), Some("7".to_string()))]),
            fields: BTreeMap::new(),
        }
    }

    #[test]
    fn wire_format_round_trips() {
        let line = r#"{"op":"u","vsn":42,"schema_name":"public","table_name":"orders",
            "key":{"id":"7"},"fields":{"total":"99.5","note":null}}"#;
        let event: Event = serde_json::from_str(line).unwrap();

        assert_eq!(event.op, EventOp::Update);
        assert_eq!(event.vsn, 42);
        assert_eq!(event.fields.get("note"), Some(&None));
    }

    #[test]
    fn terminator_is_identified_by_value() {
        let event: Event =
            serde_json::from_str(r#"{"op":"end_of_source_queue_segment"}"#).unwrap();

        assert!(event.is_end_of_segment());
        assert_eq!(event.vsn, 0);
    }

    #[test]
    fn effective_table_name_qualifies_non_public_pg_schema() {
        let mut event = event(EventOp::Insert, 1);
        event.schema_name = "sales".to_string();

        assert_eq!(
            event.effective_table_name(SourceDbType::Postgresql),
            "sales.orders"
        );
        assert_eq!(event.effective_table_name(SourceDbType::Mysql), "orders");
    }

    #[test]
    fn effective_table_name_keeps_public_unqualified() {
        let event = event(EventOp::Insert, 1);
        assert_eq!(event.effective_table_name(SourceDbType::Postgresql), "orders");
    }

    #[test]
    fn batch_counts_and_max_vsn() {
        let batch = EventBatch::new(
            vec![
                event(EventOp::Insert, 10),
                event(EventOp::Update, 11),
                event(EventOp::Update, 12),
                event(EventOp::Delete, 13),
            ],
            3,
        );

        assert_eq!(batch.event_counts.num_inserts, 1);
        assert_eq!(batch.event_counts.num_updates, 2);
        assert_eq!(batch.event_counts.num_deletes, 1);
        assert_eq!(batch.event_counts.total(), 4);
        assert_eq!(batch.max_vsn, 13);
        assert_eq!(batch.channel_no, 3);
    }
}
