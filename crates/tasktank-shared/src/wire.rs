//! Relay wire frames: JSON arrays tagged by their first element.

use serde_json::{json, Value};

use crate::error::RecordError;
use crate::record::{Record, RecordFilter};

/// Frames a client sends to a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Event(Record),
    Req {
        sub_id: String,
        filters: Vec<RecordFilter>,
    },
    Close(String),
}

/// Frames a relay sends to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Event { sub_id: String, record: Record },
    Eose(String),
    Ok {
        id: String,
        accepted: bool,
        message: String,
    },
    Notice(String),
}

fn malformed(msg: &str) -> RecordError {
    RecordError::Malformed(msg.to_string())
}

fn parse_array(text: &str) -> Result<Vec<Value>, RecordError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) if !items.is_empty() => Ok(items),
        Ok(_) => Err(malformed("frame is not a non-empty array")),
        Err(e) => Err(RecordError::Malformed(e.to_string())),
    }
}

fn string_at(items: &[Value], idx: usize) -> Result<String, RecordError> {
    items
        .get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| malformed("expected string"))
}

fn record_at(items: &[Value], idx: usize) -> Result<Record, RecordError> {
    let value = items.get(idx).cloned().ok_or_else(|| malformed("missing record"))?;
    serde_json::from_value(value).map_err(|e| RecordError::Malformed(e.to_string()))
}

impl ClientFrame {
    pub fn to_json(&self) -> String {
        let value = match self {
            ClientFrame::Event(record) => json!(["EVENT", record]),
            ClientFrame::Req { sub_id, filters } => {
                let mut items = vec![json!("REQ"), json!(sub_id)];
                items.extend(filters.iter().map(|f| json!(f)));
                Value::Array(items)
            }
            ClientFrame::Close(sub_id) => json!(["CLOSE", sub_id]),
        };
        value.to_string()
    }

    pub fn parse(text: &str) -> Result<Self, RecordError> {
        let items = parse_array(text)?;
        match items[0].as_str() {
            Some("EVENT") => Ok(ClientFrame::Event(record_at(&items, 1)?)),
            Some("REQ") => {
                let sub_id = string_at(&items, 1)?;
                let filters = items[2..]
                    .iter()
                    .map(|v| serde_json::from_value(v.clone()))
                    .collect::<Result<Vec<RecordFilter>, _>>()
                    .map_err(|e| RecordError::Malformed(e.to_string()))?;
                Ok(ClientFrame::Req { sub_id, filters })
            }
            Some("CLOSE") => Ok(ClientFrame::Close(string_at(&items, 1)?)),
            _ => Err(malformed("unknown client frame")),
        }
    }
}

impl RelayFrame {
    pub fn to_json(&self) -> String {
        let value = match self {
            RelayFrame::Event { sub_id, record } => json!(["EVENT", sub_id, record]),
            RelayFrame::Eose(sub_id) => json!(["EOSE", sub_id]),
            RelayFrame::Ok {
                id,
                accepted,
                message,
            } => json!(["OK", id, accepted, message]),
            RelayFrame::Notice(message) => json!(["NOTICE", message]),
        };
        value.to_string()
    }

    pub fn parse(text: &str) -> Result<Self, RecordError> {
        let items = parse_array(text)?;
        match items[0].as_str() {
            Some("EVENT") => Ok(RelayFrame::Event {
                sub_id: string_at(&items, 1)?,
                record: record_at(&items, 2)?,
            }),
            Some("EOSE") => Ok(RelayFrame::Eose(string_at(&items, 1)?)),
            Some("OK") => Ok(RelayFrame::Ok {
                id: string_at(&items, 1)?,
                accepted: items.get(2).and_then(Value::as_bool).unwrap_or(false),
                message: items
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            Some("NOTICE") => Ok(RelayFrame::Notice(string_at(&items, 1)?)),
            _ => Err(malformed("unknown relay frame")),
        }
    }
}
