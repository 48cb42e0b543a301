//! Units of work accepted by the write-behind queue.
//!
//! An [`Operation`] is immutable once built. Each payload shape is a concrete
//! [`Record`] variant, and its [`RecordKey`] names the row a sink merges into.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Table a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Codes,
    Users,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Table::Codes => write!(f, "codes"),
            Table::Users => write!(f, "users"),
        }
    }
}

/// Identity a sink merges on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub table: Table,
    pub id: i64,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.id)
    }
}

/// Per-user opaque content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Code {
    pub id: i64,
    pub content: Option<String>,
    /// Unix seconds of the last update.
    pub updated_at: Option<i64>,
}

/// A user and their shared secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub auth: Option<String>,
}

/// Closed set of persistable payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table")]
pub enum Record {
    #[serde(rename = "codes")]
    Code(Code),
    #[serde(rename = "users")]
    User(User),
}

impl Record {
    pub fn key(&self) -> RecordKey {
        match self {
            Record::Code(c) => RecordKey { table: Table::Codes, id: c.id },
            Record::User(u) => RecordKey { table: Table::Users, id: u.id },
        }
    }
}

impl From<Code> for Record {
    fn from(code: Code) -> Self {
        Record::Code(code)
    }
}

impl From<User> for Record {
    fn from(user: User) -> Self {
        Record::User(user)
    }
}

/// Kind of write. Upsert is the only kind; sinks apply it insert-or-update by key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "record", rename_all = "snake_case")]
pub enum OperationKind {
    Upsert(Record),
}

/// One record to persist, stamped with its submission time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    kind: OperationKind,
    submitted_at: SystemTime,
}

impl Operation {
    pub fn upsert(record: impl Into<Record>) -> Self {
        Self { kind: OperationKind::Upsert(record.into()), submitted_at: SystemTime::now() }
    }

    /// Build the upsert an update-code request produces: content plus a fresh
    /// `updated_at` stamp.
    pub fn upsert_code(id: i64, content: Option<String>) -> Self {
        let submitted_at = SystemTime::now();
        let secs = submitted_at
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or_default();
        let code = Code { id, content, updated_at: Some(secs) };
        Self { kind: OperationKind::Upsert(Record::Code(code)), submitted_at }
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn record(&self) -> &Record {
        match &self.kind {
            OperationKind::Upsert(record) => record,
        }
    }

    pub fn key(&self) -> RecordKey {
        self.record().key()
    }

    pub fn submitted_at(&self) -> SystemTime {
        self.submitted_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_scoped_by_table() {
        let code = Operation::upsert(Code { id: 7, content: None, updated_at: None });
        let user = Operation::upsert(User { id: 7, auth: Some("s3cret".into()) });
        assert_ne!(code.key(), user.key());
        assert_eq!(code.key().to_string(), "codes/7");
        assert_eq!(user.key().to_string(), "users/7");
    }

    #[test]
    fn upsert_code_stamps_update_time() {
        let op = Operation::upsert_code(3, Some("qr-data".into()));
        match op.record() {
            Record::Code(code) => {
                assert_eq!(code.content.as_deref(), Some("qr-data"));
                assert!(code.updated_at.unwrap_or_default() > 0);
            }
            other => panic!("expected code, got {:?}", other),
        }
    }

    #[test]
    fn record_serializes_with_table_tag() {
        let json = serde_json::to_value(Record::User(User { id: 1, auth: None })).unwrap();
        assert_eq!(json["table"], "users");
        assert_eq!(json["id"], 1);
    }

    #[test]
    fn record_tag_matches_table_name() {
        let code = Record::Code(Code { id: 2, content: None, updated_at: None });
        let json = serde_json::to_value(&code).unwrap();
        assert_eq!(json["table"], serde_json::to_value(code.key().table).unwrap());
        assert_eq!(json["table"], code.key().table.to_string());
    }
}
