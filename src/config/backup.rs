//! Backup wrappers: `{ "backup_info": {sequence, timestamp, version, description}, "config": <snapshot> }`
//! stored as `backup_<sequence>_<version>[_<description>].json`.
//!
//! `sequence` is one past the highest sequence already in the directory, so
//! it keeps growing across reboots. `timestamp` is uptime in ms and only
//! meaningful within one boot.

use serde::Serialize;
use serde_json::{Value, json};

pub const PREFIX: &str = "backup_";
pub const SUFFIX: &str = ".json";
pub const MAX_DESCRIPTION: usize = 48;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupRecord {
    pub filename: String,
    /// Creation order; higher is newer.
    pub sequence: u64,
    pub timestamp: u64,
    pub version: String,
    pub size: u64,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Keep `[A-Za-z0-9_-]`, map spaces to `_`, drop the rest.
pub fn sanitize_description(desc: &str) -> String {
    desc.chars()
        .filter_map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' | '-' => Some(c),
            ' ' => Some('_'),
            _ => None,
        })
        .take(MAX_DESCRIPTION)
        .collect()
}

pub fn filename(sequence: u64, version: &str, description: Option<&str>) -> String {
    let version: String = version
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    match description.map(sanitize_description).filter(|d| !d.is_empty()) {
        Some(d) => format!("{PREFIX}{sequence}_{version}_{d}{SUFFIX}"),
        None => format!("{PREFIX}{sequence}_{version}{SUFFIX}"),
    }
}

/// Visible `*.json` entries.
pub fn is_backup_file(name: &str) -> bool {
    !name.starts_with('.') && name.ends_with(SUFFIX) && name.len() > SUFFIX.len()
}

pub fn wrap(
    snapshot: &Value,
    sequence: u64,
    timestamp: u64,
    version: &str,
    description: Option<&str>,
) -> Value {
    json!({
        "backup_info": {
            "sequence": sequence,
            "timestamp": timestamp,
            "version": version,
            "description": description.unwrap_or(""),
        },
        "config": snapshot,
    })
}

/// The snapshot inside a wrapper; documents without one are treated as a
/// bare config.
pub fn unwrap_config(mut doc: Value) -> Value {
    match doc.as_object_mut().and_then(|o| o.remove("config")) {
        Some(config) => config,
        None => doc,
    }
}

/// Number encoded in a `backup_<n>_...` filename.
fn sequence_from_name(name: &str) -> Option<u64> {
    name.strip_prefix(PREFIX)?.split('_').next()?.parse().ok()
}

/// Build a record from a file's bytes. Unparseable files are still listed,
/// with `valid = false`.
pub fn parse_record(filename: &str, bytes: &[u8]) -> BackupRecord {
    let mut record = BackupRecord {
        filename: filename.to_string(),
        sequence: sequence_from_name(filename).unwrap_or(0),
        timestamp: 0,
        version: "unknown".to_string(),
        size: bytes.len() as u64,
        valid: false,
        description: None,
    };
    let Ok(doc) = serde_json::from_slice::<Value>(bytes) else {
        return record;
    };
    let Some(info) = doc.get("backup_info").filter(|i| i.is_object()) else {
        return record;
    };
    record.valid = doc.get("config").is_some_and(Value::is_object);
    if let Some(seq) = info.get("sequence").and_then(Value::as_u64) {
        record.sequence = seq;
    }
    if let Some(ts) = info.get("timestamp").and_then(Value::as_u64) {
        record.timestamp = ts;
    }
    if let Some(v) = info.get("version").and_then(Value::as_str) {
        record.version = v.to_string();
    }
    record.description = info
        .get("description")
        .and_then(Value::as_str)
        .filter(|d| !d.is_empty())
        .map(str::to_string);
    record
}
