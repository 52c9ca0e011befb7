use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Predicate names as they appear on the wire.
pub mod predicates {
    pub const TYPE: &str = "dgraph.type";

    pub const IMEI: &str = "IMEI";
    /// Device to device, written in both directions.
    pub const LINKED_TO: &str = "imeis_to";
    pub const INCOMING_MSDIN: &str = "incoming_msdin";
    pub const OUTGOING_MSDIN: &str = "outgoing_msdin";

    pub const MSDIN: &str = "MSDIN";
    pub const ORIGIN_DEVICES: &str = "imeis";
    pub const DESTINATION_DEVICES: &str = "imeis_to";

    pub const CALL_TIME: &str = "call_time";
    pub const LATITUDE: &str = "latitude";
    pub const LONGITUDE: &str = "longitude";
    pub const DURATION: &str = "duration";
    pub const CALL_ORIGIN: &str = "IMEI_FROM_UID";
    pub const CALL_DESTINATION: &str = "IMEI_TO_UID";
    pub const CALL_ACCOUNT: &str = "MSDIN_UID";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Device,
    Account,
    Call,
}

impl NodeKind {
    pub const fn as_db_value(self) -> &'static str {
        match self {
            NodeKind::Device => "device",
            NodeKind::Account => "account",
            NodeKind::Call => "call",
        }
    }

    pub fn from_db_value(value: &str) -> Option<Self> {
        match value {
            "device" => Some(NodeKind::Device),
            "account" => Some(NodeKind::Account),
            "call" => Some(NodeKind::Call),
            _ => None,
        }
    }

    /// Predicate holding the identity of this kind of node, if it has one.
    pub const fn identity_predicate(self) -> Option<&'static str> {
        match self {
            NodeKind::Device => Some(predicates::IMEI),
            NodeKind::Account => Some(predicates::MSDIN),
            NodeKind::Call => None,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_value())
    }
}

/// Store-assigned node identifier, rendered as `0x<hex>`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Uid(pub u64);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl FromStr for Uid {
    type Err = ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        u64::from_str_radix(digits, 16).map(Self)
    }
}

impl From<u64> for Uid {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// One accepted spreadsheet row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub msdin: String,
    pub imei_from: String,
    pub imei_to: String,
    pub latitude: f64,
    pub longitude: f64,
    pub duration: f64,
    pub call_time: String,
}

/// Origin and destination device of one record after the device upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePair {
    pub origin: Uid,
    pub destination: Uid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    String(String),
    Float(f64),
    DateTime(String),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) | Value::DateTime(value) => Some(value),
            Value::Float(_) => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(value) | Value::DateTime(value) => write!(f, "{value:?}"),
            Value::Float(value) => write!(f, "\"{value}\""),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

/// Point-in-time copy of one node and its outgoing triples.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSnapshot {
    pub uid: Uid,
    pub values: BTreeMap<String, Value>,
    pub edges: BTreeMap<String, BTreeSet<Uid>>,
}

impl NodeSnapshot {
    pub fn kind(&self) -> Option<NodeKind> {
        self.str_value(predicates::TYPE)
            .and_then(NodeKind::from_db_value)
    }

    pub fn str_value(&self, predicate: &str) -> Option<&str> {
        self.values.get(predicate).and_then(Value::as_str)
    }

    pub fn f64_value(&self, predicate: &str) -> Option<f64> {
        self.values.get(predicate).and_then(Value::as_f64)
    }

    pub fn edges(&self, predicate: &str) -> impl Iterator<Item = Uid> + '_ {
        self.edges
            .get(predicate)
            .into_iter()
            .flat_map(|targets| targets.iter().copied())
    }

    pub fn has_edge(&self, predicate: &str, target: Uid) -> bool {
        self.edges
            .get(predicate)
            .is_some_and(|targets| targets.contains(&target))
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeSnapshot>,
}

impl GraphSnapshot {
    pub fn node(&self, uid: Uid) -> Option<&NodeSnapshot> {
        self.nodes.iter().find(|node| node.uid == uid)
    }

    pub fn nodes_of(&self, kind: NodeKind) -> impl Iterator<Item = &NodeSnapshot> + '_ {
        self.nodes
            .iter()
            .filter(move |node| node.kind() == Some(kind))
    }

    pub fn count(&self, kind: NodeKind) -> usize {
        self.nodes_of(kind).count()
    }

    pub fn find(&self, kind: NodeKind, identity: &str) -> Option<&NodeSnapshot> {
        let predicate = kind.identity_predicate()?;
        self.nodes_of(kind)
            .find(|node| node.str_value(predicate) == Some(identity))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphInvariantViolation {
    DuplicateIdentity {
        kind: NodeKind,
        identity: String,
        uids: Vec<Uid>,
    },
    AsymmetricLink {
        from_uid: Uid,
        to_uid: Uid,
    },
    DanglingReference {
        from_uid: Uid,
        predicate: String,
        missing_uid: Uid,
    },
    WrongReferenceKind {
        from_uid: Uid,
        predicate: String,
        target_uid: Uid,
        expected: NodeKind,
    },
    MissingCallReference {
        call_uid: Uid,
        predicate: String,
    },
}

impl GraphInvariantViolation {
    pub const fn error_code(&self) -> &'static str {
        match self {
            GraphInvariantViolation::DuplicateIdentity { .. } => "graph_duplicate_identity",
            GraphInvariantViolation::AsymmetricLink { .. } => "graph_asymmetric_link",
            GraphInvariantViolation::DanglingReference { .. } => "graph_dangling_reference",
            GraphInvariantViolation::WrongReferenceKind { .. } => "graph_wrong_reference_kind",
            GraphInvariantViolation::MissingCallReference { .. } => "graph_missing_call_reference",
        }
    }

    pub const fn public_message(&self) -> &'static str {
        match self {
            GraphInvariantViolation::DuplicateIdentity { .. } => {
                "More than one node carries the same identity"
            }
            GraphInvariantViolation::AsymmetricLink { .. } => {
                "Device link exists in one direction only"
            }
            GraphInvariantViolation::DanglingReference { .. } => {
                "Edge references a node that does not exist"
            }
            GraphInvariantViolation::WrongReferenceKind { .. } => {
                "Edge references a node of the wrong kind"
            }
            GraphInvariantViolation::MissingCallReference { .. } => {
                "Call is missing a device or account reference"
            }
        }
    }
}
