//! Persisted record types.

use chrono::{DateTime, Utc};
use sea_orm::QueryResult;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

/// JSON document holding an entity's declared fields.
pub type StateDoc = Map<String, Value>;

/// Addressable identity of an entity: the `(type, id)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// A row of the entity state table.
#[derive(Clone, Debug, PartialEq)]
pub struct ObjectRecord {
    pub key: EntityKey,
    pub state: StateDoc,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ObjectRecord {
    pub(crate) fn from_row(row: &QueryResult) -> Result<Self> {
        let state: Value = row.try_get("", "state")?;
        let state = match state {
            Value::Object(map) => map,
            other => {
                return Err(StoreError::Validation(format!(
                    "expected a JSON object, got {other}"
                )));
            }
        };
        Ok(Self {
            key: EntityKey {
                kind: row.try_get("", "type")?,
                id: row.try_get("", "id")?,
            },
            state,
            version: row.try_get("", "version")?,
            created_at: row.try_get("", "created_at")?,
            updated_at: row.try_get("", "updated_at")?,
        })
    }
}

/// A row of the alarm table.
#[derive(Clone, Debug, PartialEq)]
pub struct AlarmRecord {
    pub key: EntityKey,
    pub name: String,
    pub scheduled_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlarmRecord {
    pub(crate) fn from_row(row: &QueryResult) -> Result<Self> {
        Ok(Self {
            key: EntityKey {
                kind: row.try_get("", "type")?,
                id: row.try_get("", "id")?,
            },
            name: row.try_get("", "name")?,
            scheduled_at: row.try_get("", "scheduled_at")?,
            claimed_at: row.try_get("", "claimed_at")?,
            created_at: row.try_get("", "created_at")?,
            updated_at: row.try_get("", "updated_at")?,
        })
    }
}
