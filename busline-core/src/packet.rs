//! The six packet variants that flow between peers and the dispatcher, plus
//! the definition/field records that describe a peer's capabilities.
//!
//! Payload bodies are opaque key/value maps (`Fields`): the bus is
//! identifier-routed and never interprets `data`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Opaque key/value payload carried by `Event` and `Action` packets.
///
/// A `BTreeMap` keeps field order stable for tests and logging without
/// claiming any semantic meaning for the ordering.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// The primitive scalar types a field may hold. Purely descriptive: the
/// dispatcher does not validate `data` against this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
}

/// Describes a single field of a `Definition`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub units: String,
}

/// Whether a `Definition` describes an action a peer accepts, or an event a
/// peer emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefinitionKind {
    Action,
    Event,
}

/// A single interface contract a peer offers: "I can accept/emit packets
/// tagged with this identifier, shaped like this."
///
/// Immutable once constructed. Two definitions are the same catalog entry
/// iff their `identifier`s match; field divergence is a warning, not an
/// error (see the catalog).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    pub identifier: String,
    pub kind: DefinitionKind,
    #[serde(rename = "isArray", default)]
    pub is_array: bool,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl Definition {
    pub fn new(identifier: impl Into<String>, kind: DefinitionKind) -> Self {
        Self {
            identifier: identifier.into(),
            kind,
            is_array: false,
            fields: Vec::new(),
        }
    }
}

/// Payload shape shared by `Event` and `Action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPacket {
    pub identifier: String,
    #[serde(default)]
    pub data: Fields,
}

/// Payload shape shared by `Sub` and `Unsub`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifierRef {
    pub identifier: String,
}

/// The tagged union of messages carried between a peer and the dispatcher.
///
/// Wire representation is `{"type": "...", "payload": {...}}`; see
/// `busline-codec` for the JSON envelope that (de)serializes this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum Packet {
    Event(DataPacket),
    Action(DataPacket),
    Sub(IdentifierRef),
    Unsub(IdentifierRef),
    Def(Definition),
    Undef(Definition),
}

impl Packet {
    /// The identifier this packet concerns, for the variants that carry one.
    pub fn identifier(&self) -> &str {
        match self {
            Packet::Event(d) | Packet::Action(d) => &d.identifier,
            Packet::Sub(r) | Packet::Unsub(r) => &r.identifier,
            Packet::Def(def) | Packet::Undef(def) => &def.identifier,
        }
    }
}
