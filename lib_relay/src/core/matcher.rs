//! # Matcher
//!
//! Decides who receives an event. Every event falls into exactly one class,
//! checked in this order:
//!
//! 1. **Positive case** (`positive_count > 0`): everyone inside the box of
//!    half-width `positive_radius` around the event, whatever their topics.
//! 2. **Radius bounded** (`radius > 0`): subscribers of the event topic AND
//!    inside the box of half-width `radius`.
//! 3. **Broadcast** (`radius == 0`): every subscriber of the event topic.
//!
//! The class is turned into a `MatchFilter`, a store-agnostic predicate. A
//! directory may push the filter down to its native query language; the
//! matcher re-applies it to whatever comes back, so a lax store can never
//! widen the delivery set.

use crate::connections::Directory;
use crate::core::thresholds::ConfigParameters;
use crate::error::RelayResult;
use crate::model::{Event, Position, QueueRef, SubscriberRecord};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Routing class of an event, first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    PositiveCase,
    RadiusBounded,
    Broadcast,
}

impl EventClass {
    pub fn of(event: &Event) -> Self {
        if event.positive_count > 0 {
            EventClass::PositiveCase
        } else if event.radius > 0 {
            EventClass::RadiusBounded
        } else {
            EventClass::Broadcast
        }
    }
}

/// Square area centred on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub center: Position,
    pub half_width: u32,
}

impl BoundingBox {
    pub fn contains(&self, position: Position) -> bool {
        position.within_box(self.center, self.half_width)
    }

    /// Inclusive `(min, max)` range on the x axis, handy for store pushdown.
    pub fn x_range(&self) -> (i64, i64) {
        let r = i64::from(self.half_width);
        (self.center.x.saturating_sub(r), self.center.x.saturating_add(r))
    }

    /// Inclusive `(min, max)` range on the y axis.
    pub fn y_range(&self) -> (i64, i64) {
        let r = i64::from(self.half_width);
        (self.center.y.saturating_sub(r), self.center.y.saturating_add(r))
    }
}

/// Conjunction of an optional topic condition and an optional spatial condition.
/// A filter with neither condition matches every record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchFilter {
    pub topic: Option<String>,
    pub area: Option<BoundingBox>,
}

impl MatchFilter {
    pub fn for_event(event: &Event, params: &ConfigParameters) -> Self {
        match EventClass::of(event) {
            EventClass::PositiveCase => Self {
                topic: None,
                area: Some(BoundingBox { center: event.position, half_width: params.positive_radius }),
            },
            EventClass::RadiusBounded => Self {
                topic: Some(event.topic.clone()),
                area: Some(BoundingBox { center: event.position, half_width: event.radius }),
            },
            EventClass::Broadcast => Self {
                topic: Some(event.topic.clone()),
                area: None,
            },
        }
    }

    pub fn matches(&self, record: &SubscriberRecord) -> bool {
        let topic_ok = self
            .topic
            .as_deref()
            .map_or(true, |topic| record.is_subscribed(topic));
        let area_ok = self.area.map_or(true, |area| area.contains(record.position));
        topic_ok && area_ok
    }
}

/// Deduplicated recipients of one event, keyed by subscriber id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeliverySet {
    recipients: BTreeMap<String, QueueRef>,
}

impl DeliverySet {
    /// Adds a recipient; returns `false` if the subscriber was already present.
    pub fn insert(&mut self, subscriber_id: String, queue_ref: QueueRef) -> bool {
        self.recipients.insert(subscriber_id, queue_ref).is_none()
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }

    pub fn contains(&self, subscriber_id: &str) -> bool {
        self.recipients.contains_key(subscriber_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.recipients.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &QueueRef)> {
        self.recipients.iter().map(|(id, queue)| (id.as_str(), queue))
    }
}

/// Pure matching over an in-memory directory snapshot.
pub fn match_snapshot<'a, I>(event: &Event, records: I, params: &ConfigParameters) -> DeliverySet
where
    I: IntoIterator<Item = &'a SubscriberRecord>,
{
    let filter = MatchFilter::for_event(event, params);
    collect(&filter, records)
}

fn collect<'a, I>(filter: &MatchFilter, records: I) -> DeliverySet
where
    I: IntoIterator<Item = &'a SubscriberRecord>,
{
    let mut set = DeliverySet::default();
    for record in records.into_iter().filter(|r| filter.matches(r)) {
        set.insert(record.id.clone(), record.queue_ref.clone());
    }
    set
}

/// Matches events against a live directory.
pub struct Matcher {
    directory: Arc<dyn Directory>,
}

impl Matcher {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Computes the delivery set. A directory failure is returned as an error,
    /// never as an empty set.
    pub async fn match_event(&self, event: &Event, params: &ConfigParameters) -> RelayResult<DeliverySet> {
        let filter = MatchFilter::for_event(event, params);
        let records = self.directory.scan(&filter).await?;
        let set = collect(&filter, &records);
        log::debug!(
            "{:?} event from {} matched {} of {} scanned subscribers",
            EventClass::of(event),
            event.source_id,
            set.len(),
            records.len()
        );
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::MemoryDirectory;
    use crate::error::RelayError;
    use async_trait::async_trait;

    fn event(topic: &str, radius: u32, at: (i64, i64), positive: u64) -> Event {
        Event {
            source_id: "src".into(),
            topic: topic.into(),
            positive_count: positive,
            people_count: 10,
            area: 100,
            position: Position::new(at.0, at.1),
            radius,
            body: String::new(),
        }
    }

    fn sub(id: &str, topics: &[&str], at: (i64, i64)) -> SubscriberRecord {
        SubscriberRecord::new(id, QueueRef::new(format!("q-{}", id)))
            .with_topics(topics.iter().copied())
            .at(Position::new(at.0, at.1))
    }

    fn params(positive_radius: u32) -> ConfigParameters {
        ConfigParameters { density_threshold: 2.5, positive_radius }
    }

    fn directory() -> Vec<SubscriberRecord> {
        vec![
            sub("a", &["Farmacia"], (5, 5)),
            sub("b", &[], (5, 0)),
            sub("c", &["Farmacia", "Uffici"], (40, 40)),
            sub("d", &["Uffici"], (6, 7)),
        ]
    }

    #[test]
    fn test_classification_precedence() {
        assert_eq!(EventClass::of(&event("t", 3, (0, 0), 1)), EventClass::PositiveCase);
        assert_eq!(EventClass::of(&event("t", 0, (0, 0), 2)), EventClass::PositiveCase);
        assert_eq!(EventClass::of(&event("t", 3, (0, 0), 0)), EventClass::RadiusBounded);
        assert_eq!(EventClass::of(&event("t", 0, (0, 0), 0)), EventClass::Broadcast);
    }

    #[test]
    fn test_radius_bounded_requires_topic_and_box() {
        let dir = directory();
        let set = match_snapshot(&event("Farmacia", 3, (6, 6), 0), &dir, &params(5));
        assert_eq!(set.ids().collect::<Vec<_>>(), vec!["a"]);

        let other_topic = match_snapshot(&event("Altro", 3, (6, 6), 0), &dir, &params(5));
        assert!(other_topic.is_empty());

        // c subscribes to the topic but is far away: no implicit OR.
        assert!(!set.contains("c"));
        // d is nearby but not subscribed.
        assert!(!set.contains("d"));
    }

    #[test]
    fn test_broadcast_ignores_position() {
        let dir = directory();
        let set = match_snapshot(&event("Farmacia", 0, (1000, -1000), 0), &dir, &params(5));
        assert_eq!(set.ids().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn test_positive_case_ignores_topic() {
        let dir = directory();
        let set = match_snapshot(&event("Farmacia", 0, (0, 0), 2), &dir, &params(5));
        // b has no topics at all and still gets the health alert.
        assert_eq!(set.ids().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn test_positive_case_independent_of_radius_and_topic() {
        let dir = directory();
        let base = match_snapshot(&event("Farmacia", 0, (3, 3), 1), &dir, &params(4));
        let wider = match_snapshot(&event("Farmacia", 50, (3, 3), 1), &dir, &params(4));
        let other = match_snapshot(&event("Altro", 1, (3, 3), 1), &dir, &params(4));
        assert_eq!(base, wider);
        assert_eq!(base, other);
    }

    #[test]
    fn test_empty_topics_never_match_topic_classes() {
        let dir = vec![sub("lonely", &[], (0, 0))];
        assert!(match_snapshot(&event("Farmacia", 0, (0, 0), 0), &dir, &params(5)).is_empty());
        assert!(match_snapshot(&event("Farmacia", 2, (0, 0), 0), &dir, &params(5)).is_empty());
    }

    #[test]
    fn test_duplicate_records_are_collapsed() {
        let dir = vec![sub("a", &["t"], (0, 0)), sub("a", &["t"], (0, 0))];
        let set = match_snapshot(&event("t", 0, (0, 0), 0), &dir, &params(5));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_matching_is_repeatable() {
        let dir = directory();
        let e = event("Uffici", 10, (5, 5), 0);
        assert_eq!(match_snapshot(&e, &dir, &params(5)), match_snapshot(&e, dir.iter().rev(), &params(5)));
    }

    #[test]
    fn test_bounding_box_ranges_saturate() {
        let bbox = BoundingBox { center: Position::new(i64::MAX, 0), half_width: 3 };
        assert_eq!(bbox.x_range(), (i64::MAX - 3, i64::MAX));
        assert_eq!(bbox.y_range(), (-3, 3));
    }

    #[tokio::test]
    async fn test_matcher_against_memory_directory() {
        let dir = Arc::new(MemoryDirectory::default());
        for record in directory() {
            dir.insert(record);
        }
        let matcher = Matcher::new(dir);
        let set = matcher.match_event(&event("Farmacia", 3, (6, 6), 0), &params(5)).await.unwrap();
        assert_eq!(set.ids().collect::<Vec<_>>(), vec!["a"]);
    }

    struct LaxDirectory(Vec<SubscriberRecord>);

    #[async_trait]
    impl Directory for LaxDirectory {
        async fn scan(&self, _filter: &MatchFilter) -> RelayResult<Vec<SubscriberRecord>> {
            Ok(self.0.clone())
        }
        async fn get(&self, _id: &str) -> RelayResult<Option<SubscriberRecord>> {
            Ok(None)
        }
        async fn put_new(&self, _record: SubscriberRecord) -> RelayResult<()> {
            Ok(())
        }
        async fn update(&self, _record: SubscriberRecord) -> RelayResult<()> {
            Ok(())
        }
        async fn delete(&self, _id: &str) -> RelayResult<()> {
            Ok(())
        }
        async fn list(&self) -> RelayResult<Vec<SubscriberRecord>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_matcher_reapplies_filter_to_store_results() {
        let matcher = Matcher::new(Arc::new(LaxDirectory(directory())));
        let set = matcher.match_event(&event("Uffici", 0, (0, 0), 0), &params(5)).await.unwrap();
        assert_eq!(set.ids().collect::<Vec<_>>(), vec!["c", "d"]);
    }

    struct BrokenDirectory;

    #[async_trait]
    impl Directory for BrokenDirectory {
        async fn scan(&self, _filter: &MatchFilter) -> RelayResult<Vec<SubscriberRecord>> {
            Err(RelayError::Directory("scan timed out".into()))
        }
        async fn get(&self, _id: &str) -> RelayResult<Option<SubscriberRecord>> {
            Err(RelayError::Directory("down".into()))
        }
        async fn put_new(&self, _record: SubscriberRecord) -> RelayResult<()> {
            Err(RelayError::Directory("down".into()))
        }
        async fn update(&self, _record: SubscriberRecord) -> RelayResult<()> {
            Err(RelayError::Directory("down".into()))
        }
        async fn delete(&self, _id: &str) -> RelayResult<()> {
            Err(RelayError::Directory("down".into()))
        }
        async fn list(&self) -> RelayResult<Vec<SubscriberRecord>> {
            Err(RelayError::Directory("down".into()))
        }
    }

    #[tokio::test]
    async fn test_directory_failure_is_not_an_empty_set() {
        let matcher = Matcher::new(Arc::new(BrokenDirectory));
        let result = matcher.match_event(&event("t", 0, (0, 0), 1), &params(5)).await;
        assert!(matches!(result, Err(RelayError::Directory(_))));
    }
}
