//! File names, column names and field defaults shared by every subsystem.

pub const CONFIG_FILE_NAME: &str = "ledger.toml";
pub const AUDIT_LOG_NAME: &str = "ledger.events.jsonl";
pub const DEFAULT_DATA_FILE: &str = "incidents.csv";

pub const COL_ID: &str = "id";
pub const COL_SUBJECT: &str = "subjectName";
pub const COL_GROUP: &str = "group";
pub const COL_REPORTER: &str = "reporter";
pub const COL_KIND: &str = "kind";
pub const COL_CATEGORY: &str = "category";
pub const COL_NOTE: &str = "note";
pub const COL_OCCURRED_ON: &str = "occurredOn";
pub const COL_RESOLVED: &str = "resolved";

/// Header written on every persist, in column order.
pub const CANONICAL_HEADER: [&str; 9] = [
    COL_ID,
    COL_SUBJECT,
    COL_GROUP,
    COL_REPORTER,
    COL_KIND,
    COL_CATEGORY,
    COL_NOTE,
    COL_OCCURRED_ON,
    COL_RESOLVED,
];

pub const UNKNOWN: &str = "Unknown";
pub const NO_COMMENT: &str = "No comment";

/// `occurredOn` wire format.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "schema",
        "version": "0.1.0",
        "description": "Backing file layout",
        "columns": CANONICAL_HEADER,
        "date_format": "YYYY-MM-DD",
        "storage": [DEFAULT_DATA_FILE, CONFIG_FILE_NAME, AUDIT_LOG_NAME]
    })
}
