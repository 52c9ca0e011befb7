//! Typed predicate declarations for the ingest graph.
//!
//! Declarations are idempotent: repeating one with the same shape leaves the
//! store unchanged. Exact-match lookups are only valid on predicates declared
//! with [`IndexKind::Exact`].

use std::fmt;

use serde::Serialize;

use crate::models::predicates;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Float,
    DateTime,
    Uid,
}

impl ValueType {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Float => "float",
            ValueType::DateTime => "datetime",
            ValueType::Uid => "uid",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "string" => Some(ValueType::String),
            "float" => Some(ValueType::Float),
            "datetime" => Some(ValueType::DateTime),
            "uid" => Some(ValueType::Uid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Exact,
    Day,
}

impl IndexKind {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            IndexKind::Exact => "exact",
            IndexKind::Day => "day",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SchemaField {
    pub predicate: &'static str,
    pub value_type: ValueType,
    pub list: bool,
    pub index: Option<IndexKind>,
    /// Ask the store to detect conflicting concurrent writes on this predicate.
    pub upsert: bool,
}

impl SchemaField {
    const fn scalar(predicate: &'static str, value_type: ValueType) -> Self {
        Self {
            predicate,
            value_type,
            list: false,
            index: None,
            upsert: false,
        }
    }

    const fn identity(predicate: &'static str) -> Self {
        Self {
            predicate,
            value_type: ValueType::String,
            list: false,
            index: Some(IndexKind::Exact),
            upsert: true,
        }
    }

    const fn uid_list(predicate: &'static str) -> Self {
        Self {
            predicate,
            value_type: ValueType::Uid,
            list: true,
            index: None,
            upsert: false,
        }
    }

    pub fn is_exact_indexed(&self) -> bool {
        self.index == Some(IndexKind::Exact)
    }
}

/// Renders the declaration in Dgraph schema syntax, e.g. `IMEI: string @index(exact) @upsert .`
impl fmt::Display for SchemaField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.predicate)?;
        if self.list {
            write!(f, "[{}]", self.value_type.as_db_value())?;
        } else {
            f.write_str(self.value_type.as_db_value())?;
        }
        if let Some(index) = self.index {
            write!(f, " @index({})", index.as_db_value())?;
        }
        if self.upsert {
            f.write_str(" @upsert")?;
        }
        f.write_str(" .")
    }
}

pub const DEVICE_SCHEMA: &[SchemaField] = &[
    SchemaField::identity(predicates::IMEI),
    SchemaField::uid_list(predicates::LINKED_TO),
    SchemaField::uid_list(predicates::INCOMING_MSDIN),
    SchemaField::uid_list(predicates::OUTGOING_MSDIN),
];

// `imeis_to` is shared with devices and declared there.
pub const ACCOUNT_SCHEMA: &[SchemaField] = &[
    SchemaField::identity(predicates::MSDIN),
    SchemaField::uid_list(predicates::ORIGIN_DEVICES),
];

pub const CALL_SCHEMA: &[SchemaField] = &[
    SchemaField {
        predicate: predicates::CALL_TIME,
        value_type: ValueType::DateTime,
        list: false,
        index: Some(IndexKind::Day),
        upsert: false,
    },
    SchemaField::scalar(predicates::LATITUDE, ValueType::Float),
    SchemaField::scalar(predicates::LONGITUDE, ValueType::Float),
    SchemaField::scalar(predicates::DURATION, ValueType::Float),
    SchemaField::scalar(predicates::CALL_ORIGIN, ValueType::Uid),
    SchemaField::scalar(predicates::CALL_DESTINATION, ValueType::Uid),
    SchemaField::scalar(predicates::CALL_ACCOUNT, ValueType::Uid),
];

/// Every predicate the ingest pipeline writes.
pub fn ingest_schema() -> Vec<SchemaField> {
    DEVICE_SCHEMA
        .iter()
        .chain(ACCOUNT_SCHEMA)
        .chain(CALL_SCHEMA)
        .copied()
        .collect()
}

pub fn render_schema(fields: &[SchemaField]) -> String {
    fields
        .iter()
        .map(|field| field.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_identity_and_list_predicates() {
        assert_eq!(
            SchemaField::identity("IMEI").to_string(),
            "IMEI: string @index(exact) @upsert ."
        );
        assert_eq!(
            SchemaField::uid_list("imeis").to_string(),
            "imeis: [uid] ."
        );
        assert_eq!(CALL_SCHEMA[0].to_string(), "call_time: datetime @index(day) .");
    }

    #[test]
    fn ingest_schema_declares_each_predicate_once() {
        let fields = ingest_schema();
        let mut names = fields.iter().map(|f| f.predicate).collect::<Vec<_>>();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
        assert!(fields.iter().any(|f| f.predicate == "MSDIN" && f.is_exact_indexed()));
    }
}
