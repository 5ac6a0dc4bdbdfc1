//! # Wire Envelope
//!
//! The transport carries typed string attributes plus a free-text body, the
//! same shape publishers use when they enqueue an occupancy report.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attribute names understood by the router.
pub mod attr {
    pub const ID: &str = "ID";
    pub const POSITIVE: &str = "Positive";
    pub const PEOPLE_NUM: &str = "PeopleNum";
    pub const MQ: &str = "Mq";
    pub const TOPIC: &str = "Topic";
    pub const POSITION_X: &str = "PositionX";
    pub const POSITION_Y: &str = "PositionY";
    pub const RADIUS: &str = "Radius";
}

/// Declared type of an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    String,
    Number,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeValue {
    pub data_type: DataType,
    pub value: String,
}

impl AttributeValue {
    pub fn string(value: impl Into<String>) -> Self {
        Self { data_type: DataType::String, value: value.into() }
    }

    pub fn number(value: impl ToString) -> Self {
        Self { data_type: DataType::Number, value: value.to_string() }
    }
}

/// Attributes and body of one message, as it travels on any queue.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub attributes: BTreeMap<String, AttributeValue>,
    pub body: String,
}

impl Envelope {
    pub fn new(body: impl Into<String>) -> Self {
        Self { attributes: BTreeMap::new(), body: body.into() }
    }

    pub fn with_attribute(mut self, name: &str, value: AttributeValue) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(|a| a.value.as_str())
    }
}

/// What the dispatcher hands to `Transport::send` for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEnvelope {
    pub envelope: Envelope,
    /// Ordering stream for a single logical recipient.
    pub group_key: String,
    /// Fresh per send attempt; duplicate suppression is best effort only.
    pub dedup_token: String,
}

/// A message handed out by `Transport::receive`, pending acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub receipt_handle: String,
    pub envelope: Envelope,
}
