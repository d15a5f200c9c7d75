//! Data models for Ferry
//!
//! Defines the syncable tables, the entity record shape shared by all of
//! them, and the bookkeeping types of the sync protocol: queue items and
//! per-table cursors.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Provenance stamped on records written by a pull
pub const SERVER_DEVICE_ID: &str = "server";

/// Cursor value meaning "beginning of time"
pub const BEGINNING_OF_TIME: i64 = 0;

/// A syncable entity table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Patients,
    Appointments,
    ClinicalNotes,
    Medications,
    Allergies,
    Messages,
    Documents,
}

impl Table {
    /// Every syncable table, in pull order
    pub const ALL: [Table; 7] = [
        Table::Patients,
        Table::Appointments,
        Table::ClinicalNotes,
        Table::Medications,
        Table::Allergies,
        Table::Messages,
        Table::Documents,
    ];

    /// SQL table name (also the wire name)
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Patients => "patients",
            Table::Appointments => "appointments",
            Table::ClinicalNotes => "clinical_notes",
            Table::Medications => "medications",
            Table::Allergies => "allergies",
            Table::Messages => "messages",
            Table::Documents => "documents",
        }
    }

    /// Field that identifies a record outside of its primary key
    pub fn natural_key_field(&self) -> Option<&'static str> {
        match self {
            Table::Patients => Some("email"),
            Table::Appointments => Some("booking_ref"),
            Table::Documents => Some("checksum"),
            _ => None,
        }
    }

    /// Field linking a child record to its patient
    pub fn parent_field(&self) -> Option<&'static str> {
        match self {
            Table::Patients => None,
            _ => Some("patient_id"),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown table name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown table: '{0}'")]
pub struct UnknownTable(pub String);

impl FromStr for Table {
    type Err = UnknownTable;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Table::ALL
            .into_iter()
            .find(|table| table.as_str() == s)
            .ok_or_else(|| UnknownTable(s.to_string()))
    }
}

/// An entity record
///
/// Domain fields live in `fields`; the remaining members are the
/// synchronization columns every table carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Primary key
    pub id: String,
    /// Last write time, authoritative for ordering on pull merge
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    /// Whether the server has acknowledged this version
    #[serde(rename = "_synced", default)]
    pub synced: bool,
    /// Device that last wrote the authoritative copy
    #[serde(rename = "_device_id", default)]
    pub device_id: String,
    /// Tombstone marker
    #[serde(rename = "_deleted", alias = "deleted", default)]
    pub deleted: bool,
    /// Domain fields
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create a new record with a random ID
    pub fn new(fields: Map<String, Value>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), fields)
    }

    /// Create a record with a specific ID
    pub fn with_id(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            updated_at: Utc::now(),
            synced: false,
            device_id: String::new(),
            deleted: false,
            fields,
        }
    }

    /// Build a record from a JSON object
    ///
    /// An `id` member, when present, becomes the primary key.
    pub fn from_json(value: Value) -> Option<Self> {
        let Value::Object(mut fields) = value else {
            return None;
        };
        let id = match fields.remove("id") {
            Some(Value::String(id)) => id,
            Some(other) => other.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        Some(Self::with_id(id, fields))
    }

    /// Get a domain field
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Get a domain field as a string
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }

    /// Set a domain field
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(field.into(), value.into());
        self.updated_at = Utc::now();
    }

    /// Whether this copy came from the server
    pub fn is_from_server(&self) -> bool {
        self.device_id == SERVER_DEVICE_ID
    }
}

/// Intent recorded in the sync queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueAction {
    Create,
    Update,
    Delete,
}

impl QueueAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueAction::Create => "create",
            QueueAction::Update => "update",
            QueueAction::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(QueueAction::Create),
            "update" => Some(QueueAction::Update),
            "delete" => Some(QueueAction::Delete),
            _ => None,
        }
    }
}

/// Delivery state of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Synced,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Synced => "synced",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "synced" => Some(QueueStatus::Synced),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

/// A locally originated change waiting for acknowledgment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueItem {
    /// Queue position (assigned by the store)
    pub id: i64,
    pub table: Table,
    pub record_id: String,
    pub action: QueueAction,
    /// Snapshot of the record at enqueue time
    pub payload: Record,
    pub device_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "synced")]
    pub status: QueueStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Watermark of the last successful pull for a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub table: Table,
    pub last_pull_timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_table_round_trips_through_name() {
        for table in Table::ALL {
            assert_eq!(table.as_str().parse::<Table>().unwrap(), table);
        }
        assert!("invoices".parse::<Table>().is_err());
    }

    #[test]
    fn test_parent_and_natural_key_fields() {
        assert_eq!(Table::Patients.natural_key_field(), Some("email"));
        assert_eq!(Table::Patients.parent_field(), None);
        assert_eq!(Table::Allergies.parent_field(), Some("patient_id"));
        assert_eq!(Table::Allergies.natural_key_field(), None);
    }

    #[test]
    fn test_record_from_json_uses_id_member() {
        let record = Record::from_json(json!({"id": "p-1", "name": "Ada"})).unwrap();
        assert_eq!(record.id, "p-1");
        assert_eq!(record.get_str("name"), Some("Ada"));
        assert!(record.get("id").is_none());
        assert!(!record.synced);
    }

    #[test]
    fn test_record_from_json_rejects_non_objects() {
        assert!(Record::from_json(json!(["not", "an", "object"])).is_none());
    }

    #[test]
    fn test_record_wire_format_is_flat() {
        let mut record = Record::with_id("p-1", Map::new());
        record.set("name", "Ada");
        record.device_id = "dev".to_string();

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["id"], "p-1");
        assert_eq!(value["name"], "Ada");
        assert_eq!(value["_device_id"], "dev");
        assert_eq!(value["_synced"], false);
        assert!(value["updated_at"].is_i64());
    }

    #[test]
    fn test_server_record_deleted_alias() {
        let record: Record = serde_json::from_value(json!({
            "id": "m-1",
            "updated_at": 1_700_000_000_000_i64,
            "deleted": true,
            "dose": "5mg"
        }))
        .unwrap();

        assert!(record.deleted);
        assert_eq!(record.get_str("dose"), Some("5mg"));
        assert!(record.device_id.is_empty());
    }

    #[test]
    fn test_queue_enum_names() {
        assert_eq!(QueueAction::parse("update"), Some(QueueAction::Update));
        assert_eq!(QueueStatus::parse("failed"), Some(QueueStatus::Failed));
        assert_eq!(QueueStatus::Synced.as_str(), "synced");
        assert!(QueueAction::parse("upsert").is_none());
    }
}
