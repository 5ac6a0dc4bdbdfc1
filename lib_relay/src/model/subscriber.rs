use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A point on the discrete grid shared by publishers and subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i64,
    pub y: i64,
}

impl Position {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Box (Chebyshev) containment: both coordinate deltas within `radius`.
    pub fn within_box(&self, center: Position, radius: u32) -> bool {
        let r = u64::from(radius);
        self.x.abs_diff(center.x) <= r && self.y.abs_diff(center.y) <= r
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Opaque reference to a delivery destination on the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueRef(pub String);

impl QueueRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// # Subscriber Record
///
/// One entry of the subscriber directory. `id` and `queue_ref` are fixed at
/// registration; `topics` and `position` are mutated by the control plane.
/// No interest is a genuinely empty `topics` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberRecord {
    pub id: String,
    pub queue_ref: QueueRef,
    #[serde(default)]
    pub topics: BTreeSet<String>,
    #[serde(default)]
    pub position: Position,
}

impl SubscriberRecord {
    /// A freshly registered subscriber: no topics, parked at the origin.
    pub fn new(id: impl Into<String>, queue_ref: QueueRef) -> Self {
        Self {
            id: id.into(),
            queue_ref,
            topics: BTreeSet::new(),
            position: Position::default(),
        }
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn at(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.topics.contains(topic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_box_is_inclusive_on_edges() {
        let center = Position::new(0, 0);
        assert!(Position::new(5, 0).within_box(center, 5));
        assert!(Position::new(-5, 5).within_box(center, 5));
        assert!(!Position::new(6, 0).within_box(center, 5));
        assert!(!Position::new(0, -6).within_box(center, 5));
    }

    #[test]
    fn test_within_box_uses_chebyshev_not_euclid() {
        // The corner is ~7.07 away in Euclidean terms but inside the box.
        assert!(Position::new(5, 5).within_box(Position::new(0, 0), 5));
    }

    #[test]
    fn test_zero_radius_only_matches_same_cell() {
        let center = Position::new(3, 3);
        assert!(Position::new(3, 3).within_box(center, 0));
        assert!(!Position::new(3, 4).within_box(center, 0));
    }

    #[test]
    fn test_record_round_trips_with_empty_topics() {
        let record = SubscriberRecord::new("7", QueueRef::new("relay:queue:7"));
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"topics\":[]"));
        let back: SubscriberRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert!(back.topics.is_empty());
    }
}
