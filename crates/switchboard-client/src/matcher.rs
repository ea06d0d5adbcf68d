//! Response matcher cascade.
//!
//! Targets do not agree on where a response carries its correlation id or
//! its result, so an inbound frame is tried against an ordered list of
//! strategies and the first one that names a pending request wins. Every
//! strategy is a pure function of the pending table and the frame.

use serde_json::Value;
use tracing::warn;

use crate::pending::{PendingEntry, PendingTable};

/// Terminal content of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    Result(Value),
    Error(String),
}

/// A frame attributed to a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    pub id: String,
    pub outcome: ResponseOutcome,
    /// Name of the strategy that produced the match.
    pub strategy: &'static str,
}

pub type Strategy = fn(&PendingTable, &Value) -> Option<Match>;

/// Strategies in the order they are tried.
pub const STRATEGIES: &[(&str, Strategy)] = &[
    ("top_level", top_level),
    ("top_level_id_nested_outcome", top_level_id_nested_outcome),
    ("nested", nested_id_outcome),
    ("nested_message_as_result", nested_message_as_result),
    ("fuzzy_id", fuzzy_id),
    ("document_shape", document_shape),
    ("command_name", command_name),
];

/// Run the cascade; first match wins.
pub fn match_response(table: &PendingTable, frame: &Value) -> Option<Match> {
    STRATEGIES.iter().find_map(|(name, strategy)| {
        strategy(table, frame).map(|m| Match {
            strategy: *name,
            ..m
        })
    })
}

/// Pull an outcome out of an object; `error` takes precedence over `result`.
pub fn extract_outcome(value: &Value) -> Option<ResponseOutcome> {
    let obj = value.as_object()?;
    match obj.get("error") {
        Some(Value::Null) | None => {}
        Some(Value::String(message)) => return Some(ResponseOutcome::Error(message.clone())),
        Some(other) => return Some(ResponseOutcome::Error(other.to_string())),
    }
    obj.get("result")
        .map(|result| ResponseOutcome::Result(result.clone()))
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn top_id(frame: &Value) -> Option<&str> {
    str_field(frame, "id")
}

fn message_of(frame: &Value) -> Option<&Value> {
    frame.get("message")
}

fn nested_id(frame: &Value) -> Option<&str> {
    message_of(frame).and_then(|m| str_field(m, "id"))
}

/// Outcome from the nested message first, then the frame itself.
fn any_outcome(frame: &Value) -> Option<ResponseOutcome> {
    message_of(frame)
        .and_then(extract_outcome)
        .or_else(|| extract_outcome(frame))
}

fn pending_id<'a>(table: &PendingTable, id: Option<&'a str>) -> Option<&'a str> {
    id.filter(|id| table.contains(id))
}

fn matched(id: &str, outcome: ResponseOutcome) -> Match {
    Match {
        id: id.to_string(),
        outcome,
        strategy: "",
    }
}

/// Most recently active of `candidates`; warns when the choice is ambiguous.
fn most_recent<'a>(
    candidates: Vec<&'a PendingEntry>,
    strategy: &'static str,
) -> Option<&'a PendingEntry> {
    if candidates.len() > 1 {
        let ids: Vec<&str> = candidates.iter().map(|e| e.id.as_str()).collect();
        warn!(strategy, candidates = ?ids, "Ambiguous response, choosing most recently active request");
    }
    candidates
        .into_iter()
        .max_by(|a, b| a.last_activity.cmp(&b.last_activity).then_with(|| a.created_at.cmp(&b.created_at)))
}

fn top_level(table: &PendingTable, frame: &Value) -> Option<Match> {
    let id = pending_id(table, top_id(frame))?;
    extract_outcome(frame).map(|o| matched(id, o))
}

fn top_level_id_nested_outcome(table: &PendingTable, frame: &Value) -> Option<Match> {
    let id = pending_id(table, top_id(frame))?;
    message_of(frame).and_then(extract_outcome).map(|o| matched(id, o))
}

fn nested_id_outcome(table: &PendingTable, frame: &Value) -> Option<Match> {
    let message = message_of(frame)?;
    let id = pending_id(table, str_field(message, "id"))?;
    extract_outcome(message).map(|o| matched(id, o))
}

/// The nested message itself is the result, unless it only echoes the id.
fn nested_message_as_result(table: &PendingTable, frame: &Value) -> Option<Match> {
    let id = pending_id(table, top_id(frame))?;
    let message = message_of(frame)?;
    let is_echo = message
        .as_object()
        .is_some_and(|obj| obj.is_empty() || (obj.len() == 1 && obj.contains_key("id")));
    if is_echo || message.is_null() {
        return None;
    }
    Some(matched(id, ResponseOutcome::Result(message.clone())))
}

fn fuzzy_id(table: &PendingTable, frame: &Value) -> Option<Match> {
    let incoming: Vec<&str> = [top_id(frame), nested_id(frame)].into_iter().flatten().collect();
    if incoming.is_empty() {
        return None;
    }
    let outcome = any_outcome(frame)?;
    let candidates: Vec<&PendingEntry> = table
        .entries()
        .filter(|e| {
            incoming
                .iter()
                .any(|inc| e.id.contains(inc) || inc.contains(e.id.as_str()))
        })
        .collect();
    most_recent(candidates, "fuzzy_id").map(|e| matched(&e.id, outcome))
}

const DOCUMENT_HINTS: [&str; 2] = ["document", "root"];

fn looks_like_document(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    obj.get("type").and_then(Value::as_str) == Some("DOCUMENT")
        || obj.contains_key("document")
        || obj.contains_key("root")
}

fn hints_document(entry: &PendingEntry) -> bool {
    let id = entry.id.to_ascii_lowercase();
    let command = entry.command.to_ascii_lowercase();
    DOCUMENT_HINTS
        .iter()
        .any(|hint| id.contains(hint) || command.contains(hint))
}

fn document_shape(table: &PendingTable, frame: &Value) -> Option<Match> {
    let ResponseOutcome::Result(result) = any_outcome(frame)? else {
        return None;
    };
    if !looks_like_document(&result) {
        return None;
    }
    let candidates: Vec<&PendingEntry> = table.entries().filter(|e| hints_document(e)).collect();
    most_recent(candidates, "document_shape")
        .map(|e| matched(&e.id, ResponseOutcome::Result(result)))
}

fn command_name(table: &PendingTable, frame: &Value) -> Option<Match> {
    let command = str_field(frame, "command").or_else(|| message_of(frame).and_then(|m| str_field(m, "command")))?;
    let outcome = any_outcome(frame)?;
    let candidates: Vec<&PendingEntry> = table.entries().filter(|e| e.command == command).collect();
    most_recent(candidates, "command_name").map(|e| matched(&e.id, outcome))
}
