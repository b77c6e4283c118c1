use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kind of local mutation a [`ChangeRecord`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Folds a later edit into a still-unflushed one.
    ///
    /// A delete is never reversed. A create stays a create until the server
    /// has seen the document.
    pub fn coalesce(self, later: Operation) -> Operation {
        match (self, later) {
            (Operation::Delete, _) | (_, Operation::Delete) => Operation::Delete,
            (Operation::Create, _) => Operation::Create,
            _ => Operation::Update,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(format!("unknown operation '{}'", other)),
        }
    }
}

/// A local mutation waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub collection: String,
    pub document_id: String,
    pub operation: Operation,
    /// Server version the edit was based on (0 for a create).
    pub expected_version: u64,
    pub payload: serde_json::Value,
    pub local_timestamp: DateTime<Utc>,
    pub device_id: String,
}
