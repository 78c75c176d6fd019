// Local crates
use crate::query::query::{LEVEL_TAG, MESSAGE_TAG, SERVICE_NAME_TAG};
use crate::stream::models::{FieldValue, LogsEvent};

// External crates
use chrono::DateTime;
use std::collections::HashSet;

/// Tag holding the Kubernetes pod of a log row.
pub const POD_NAME_TAG: &str = "resource.k8s.pod.name";

const TAG_PREFIX: &str = "_cardinalhq.";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Split a `--columns` argument on commas and whitespace.
pub fn parse_columns(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// The fields of a log row the default output shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: String,
    pub level: String,
    pub service: String,
    pub pod: String,
    pub message: String,
}

impl LogLine {
    pub fn from_event(event: &LogsEvent) -> Self {
        let tag = |key: &str| event.tag_str(key).unwrap_or_default().to_string();

        Self {
            timestamp: event
                .timestamp_ms()
                .map(format_timestamp)
                .unwrap_or_default(),
            level: tag(LEVEL_TAG),
            service: tag(SERVICE_NAME_TAG),
            pod: tag(POD_NAME_TAG),
            message: tag(MESSAGE_TAG),
        }
    }

    /// `[timestamp] level service pod: message`
    pub fn render(&self) -> String {
        format!(
            "[{}] {} {} {}: {}",
            self.timestamp, self.level, self.service, self.pod, self.message
        )
    }
}

/// Millisecond epoch to `YYYY-MM-DD HH:MM:SS` UTC, at second precision.
pub fn format_timestamp(ms: i64) -> String {
    DateTime::from_timestamp(ms.div_euclid(1000), 0)
        .map(|t| t.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_default()
}

/// Render the selected columns of a log row, separated by single spaces.
///
/// `timestamp`, `level`, `message`, `service` and `pod` are known columns.
/// Any other column is looked up in the row tags, first as given and then
/// with the `_cardinalhq.` prefix.
pub fn render_columns(event: &LogsEvent, columns: &[String]) -> String {
    let line = LogLine::from_event(event);

    columns
        .iter()
        .map(|column| match column.to_lowercase().as_str() {
            "timestamp" => line.timestamp.clone(),
            "level" => line.level.clone(),
            "message" => line.message.clone(),
            "service" => line.service.clone(),
            "pod" => line.pod.clone(),
            _ => tag_column(event, column),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn tag_column(event: &LogsEvent, column: &str) -> String {
    let Some(tags) = event.tags() else {
        return String::new();
    };

    let scalar = |value: &FieldValue| match value {
        FieldValue::String(_) | FieldValue::Int(_) | FieldValue::Float(_) | FieldValue::Bool(_) => {
            Some(value.to_string())
        }
        _ => None,
    };

    tags.get(column)
        .and_then(scalar)
        .or_else(|| tags.get(&format!("{TAG_PREFIX}{column}")).and_then(scalar))
        .unwrap_or_default()
}

/// Collects distinct strings in first-seen order.
#[derive(Debug, Default)]
pub struct DistinctValues {
    seen: HashSet<String>,
}

impl DistinctValues {
    /// Returns `true` the first time a non-empty `value` is offered.
    pub fn insert(&mut self, value: &str) -> bool {
        !value.is_empty() && self.seen.insert(value.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Attribute names carried by a tags response row. Internal `_cardinalhq`
/// attributes are hidden. Sorted for stable output within one row.
pub fn attribute_names(event: &LogsEvent) -> Vec<&str> {
    let mut names: Vec<&str> = event
        .payload
        .keys()
        .map(String::as_str)
        .filter(|name| !name.starts_with("_cardinalhq"))
        .collect();
    names.sort_unstable();
    names
}

/// Value of `tag` carried by a tag-values response row.
pub fn tag_value<'a>(event: &'a LogsEvent, tag: &str) -> Option<&'a str> {
    event.payload.get(tag).and_then(FieldValue::as_str)
}
