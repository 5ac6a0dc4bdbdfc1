//! # Dynamic Configuration
//!
//! The relay's runtime parameters live in the `ConfigSource` as plain
//! `(field_name, field_value)` string pairs. A reload cycle reads them all,
//! builds a complete `ConfigSnapshot` and swaps it in. Any unknown field or
//! unparsable value fails the cycle, and the previous snapshot stays in place.
//!
//! A reloader given a transport also bootstraps the inbound queue in every
//! cycle that finds `inbound_queue` unset, so resetting the field to `none`
//! at runtime re-resolves the queue instead of stalling the router.

use crate::connections::{ConfigSource, Transport};
use crate::core::thresholds::{ConfigSnapshot, SharedThresholds};
use crate::error::{RelayError, RelayResult};
use crate::model::QueueRef;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const DENSITY_THRESHOLD: &str = "density_threshold";
pub const POSITIVE_RADIUS: &str = "positive_radius";
pub const RECEIVE_DELAY_SECS: &str = "receive_delay_secs";
pub const RELOAD_DELAY_SECS: &str = "reload_delay_secs";
pub const INBOUND_QUEUE: &str = "inbound_queue";

/// Value of `inbound_queue` asking bootstrap to create the queue.
pub const UNSET_QUEUE: &str = "none";
/// Name given to the shared inbound queue when bootstrap creates it.
pub const INBOUND_QUEUE_NAME: &str = "relay-inbound";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigEntry {
    pub field_name: String,
    pub field_value: String,
}

impl ConfigEntry {
    pub fn new(field_name: impl Into<String>, field_value: impl Into<String>) -> Self {
        Self { field_name: field_name.into(), field_value: field_value.into() }
    }
}

/// Entries seeded into an empty store.
pub fn default_entries() -> Vec<ConfigEntry> {
    let defaults = ConfigSnapshot::default();
    vec![
        ConfigEntry::new(DENSITY_THRESHOLD, defaults.params.density_threshold.to_string()),
        ConfigEntry::new(POSITIVE_RADIUS, defaults.params.positive_radius.to_string()),
        ConfigEntry::new(RECEIVE_DELAY_SECS, defaults.delays.receive_delay.as_secs().to_string()),
        ConfigEntry::new(RELOAD_DELAY_SECS, defaults.delays.reload_delay.as_secs().to_string()),
        ConfigEntry::new(INBOUND_QUEUE, UNSET_QUEUE),
    ]
}

fn parse<T: FromStr>(entry: &ConfigEntry) -> RelayResult<T> {
    entry.field_value.trim().parse::<T>().map_err(|_| {
        RelayError::Config(format!("invalid value {:?} for {}", entry.field_value, entry.field_name))
    })
}

/// Applies `entries` on top of `previous` (or the defaults on a first load).
///
/// Fields absent from `entries` keep their previous value. A first load that
/// carries neither numeric parameter is rejected.
pub fn assign_parameters(entries: &[ConfigEntry], previous: Option<&ConfigSnapshot>) -> RelayResult<ConfigSnapshot> {
    let mut next = previous.cloned().unwrap_or_default();
    let mut saw_parameter = false;

    for entry in entries {
        match entry.field_name.as_str() {
            DENSITY_THRESHOLD => {
                let value: f64 = parse(entry)?;
                if !value.is_finite() || value <= 0.0 {
                    return Err(RelayError::Config(format!("{} must be a positive number", DENSITY_THRESHOLD)));
                }
                next.params.density_threshold = value;
                saw_parameter = true;
            }
            POSITIVE_RADIUS => {
                next.params.positive_radius = parse(entry)?;
                saw_parameter = true;
            }
            RECEIVE_DELAY_SECS => {
                next.delays.receive_delay = Duration::from_secs(parse(entry)?);
            }
            RELOAD_DELAY_SECS => {
                let secs: u64 = parse(entry)?;
                if secs == 0 {
                    return Err(RelayError::Config(format!("{} must be at least 1", RELOAD_DELAY_SECS)));
                }
                next.delays.reload_delay = Duration::from_secs(secs);
            }
            INBOUND_QUEUE => {
                let value = entry.field_value.trim();
                next.inbound_queue = if value.is_empty() || value.eq_ignore_ascii_case(UNSET_QUEUE) {
                    None
                } else {
                    Some(QueueRef::new(value))
                };
            }
            unknown => {
                return Err(RelayError::Config(format!("unknown configuration field {:?}", unknown)));
            }
        }
    }

    if previous.is_none() && !saw_parameter {
        return Err(RelayError::Config(format!(
            "initial configuration carries neither {} nor {}",
            DENSITY_THRESHOLD, POSITIVE_RADIUS
        )));
    }
    Ok(next)
}

/// Pulls entries from the source into the shared thresholds.
pub struct ConfigReloader {
    source: Arc<dyn ConfigSource>,
    thresholds: Arc<SharedThresholds>,
    transport: Option<Arc<dyn Transport>>,
}

impl ConfigReloader {
    pub fn new(source: Arc<dyn ConfigSource>, thresholds: Arc<SharedThresholds>) -> Self {
        Self { source, thresholds, transport: None }
    }

    /// Lets reload cycles create and persist the inbound queue when it is unset.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn thresholds(&self) -> &Arc<SharedThresholds> {
        &self.thresholds
    }

    pub async fn entries(&self) -> RelayResult<Vec<ConfigEntry>> {
        self.source.entries().await
    }

    /// One reload cycle. Returns the generation installed. On error nothing changes.
    pub async fn reload_once(&self) -> RelayResult<u64> {
        let entries = self.source.entries().await?;
        // Generation 0 is the built-in default, not a loaded configuration.
        let current = self.thresholds.snapshot();
        let previous = (self.thresholds.generation() > 0).then_some(current.as_ref());
        let mut next = assign_parameters(&entries, previous)?;
        if next.inbound_queue.is_none() {
            if let Some(transport) = &self.transport {
                next.inbound_queue = Some(bootstrap(self.source.as_ref(), transport.as_ref()).await?);
            }
        }
        let generation = self.thresholds.replace(next);
        log::debug!("Configuration generation {} installed", generation);
        Ok(generation)
    }

    /// Conditional write of a single field followed by a reload.
    pub async fn update_field(&self, field_name: &str, field_value: &str) -> RelayResult<u64> {
        // Validate before persisting so a bad value cannot poison later cycles.
        let probe = [ConfigEntry::new(field_name, field_value)];
        assign_parameters(&probe, Some(self.thresholds.snapshot().as_ref()))?;

        self.source.update_entry(field_name, field_value).await?;
        log::info!("Configuration field {} set to {:?}", field_name, field_value);
        self.reload_once().await
    }

    /// Reloads every `reload_delay` until shutdown. Failures are logged and the
    /// last good snapshot remains active.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        log::info!("Configuration reloader started.");
        loop {
            let delay = self.thresholds.snapshot().delays.reload_delay;
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(e) = self.reload_once().await {
                log::error!("Configuration reload failed, keeping previous values: {}", e);
            }
        }
        log::info!("Configuration reloader received shutdown signal.");
    }
}

async fn bootstrap(source: &dyn ConfigSource, transport: &dyn Transport) -> RelayResult<QueueRef> {
    let queue = transport.ensure_queue(INBOUND_QUEUE_NAME).await?;
    source.update_entry(INBOUND_QUEUE, queue.as_str()).await?;
    log::info!("Inbound queue bootstrapped at {}", queue);
    Ok(queue)
}

/// Makes sure the shared inbound queue exists and its reference is persisted.
/// Must run after the first successful load.
pub async fn ensure_inbound_queue(reloader: &ConfigReloader, transport: &dyn Transport) -> RelayResult<QueueRef> {
    if let Some(queue) = reloader.thresholds.snapshot().inbound_queue.clone() {
        return Ok(queue);
    }
    let queue = bootstrap(reloader.source.as_ref(), transport).await?;
    reloader.reload_once().await?;
    Ok(queue)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::{MemoryConfigSource, MemoryTransport};

    fn entries(pairs: &[(&str, &str)]) -> Vec<ConfigEntry> {
        pairs.iter().map(|(n, v)| ConfigEntry::new(*n, *v)).collect()
    }

    #[test]
    fn test_defaults_round_trip_through_assign() {
        let snapshot = assign_parameters(&default_entries(), None).unwrap();
        assert_eq!(snapshot, ConfigSnapshot::default());
    }

    #[test]
    fn test_missing_fields_keep_previous_values() {
        let first = assign_parameters(&entries(&[(DENSITY_THRESHOLD, "3.5"), (POSITIVE_RADIUS, "7")]), None).unwrap();
        let second = assign_parameters(&entries(&[(POSITIVE_RADIUS, "2")]), Some(&first)).unwrap();
        assert_eq!(second.params.density_threshold, 3.5);
        assert_eq!(second.params.positive_radius, 2);
    }

    #[test]
    fn test_bad_entries_fail_the_cycle() {
        let prev = ConfigSnapshot::default();
        for bad in [
            entries(&[(DENSITY_THRESHOLD, "abc")]),
            entries(&[(DENSITY_THRESHOLD, "-1")]),
            entries(&[(POSITIVE_RADIUS, "-3")]),
            entries(&[(RELOAD_DELAY_SECS, "0")]),
            entries(&[("colour", "blue")]),
        ] {
            assert!(matches!(assign_parameters(&bad, Some(&prev)), Err(RelayError::Config(_))), "{:?}", bad);
        }
    }

    #[test]
    fn test_first_load_requires_parameters() {
        let err = assign_parameters(&entries(&[(RECEIVE_DELAY_SECS, "1")]), None).unwrap_err();
        assert!(matches!(err, RelayError::Config(_)));
        assert!(assign_parameters(&[], Some(&ConfigSnapshot::default())).is_ok());
    }

    #[test]
    fn test_inbound_queue_values() {
        let prev = ConfigSnapshot::default();
        let set = assign_parameters(&entries(&[(INBOUND_QUEUE, "memory://relay-inbound")]), Some(&prev)).unwrap();
        assert_eq!(set.inbound_queue, Some(QueueRef::new("memory://relay-inbound")));
        let unset = assign_parameters(&entries(&[(INBOUND_QUEUE, "NONE")]), Some(&set)).unwrap();
        assert_eq!(unset.inbound_queue, None);
    }

    #[tokio::test]
    async fn test_failed_reload_retains_last_good() {
        let source = Arc::new(MemoryConfigSource::new(&default_entries()));
        let thresholds = Arc::new(SharedThresholds::default());
        let reloader = ConfigReloader::new(source.clone(), thresholds.clone());

        source.set(DENSITY_THRESHOLD, "4");
        assert_eq!(reloader.reload_once().await.unwrap(), 1);

        source.set(DENSITY_THRESHOLD, "not-a-number");
        source.set(POSITIVE_RADIUS, "9");
        assert!(reloader.reload_once().await.is_err());

        let snap = thresholds.snapshot();
        assert_eq!(snap.params.density_threshold, 4.0);
        assert_eq!(snap.params.positive_radius, 5);
        assert_eq!(thresholds.generation(), 1);
    }

    #[tokio::test]
    async fn test_update_field_validates_before_writing() {
        let source = Arc::new(MemoryConfigSource::new(&default_entries()));
        let reloader = ConfigReloader::new(source.clone(), Arc::new(SharedThresholds::default()));
        reloader.reload_once().await.unwrap();

        assert!(reloader.update_field(POSITIVE_RADIUS, "ten").await.is_err());
        assert!(matches!(reloader.update_field("colour", "1").await, Err(RelayError::Config(_))));

        reloader.update_field(POSITIVE_RADIUS, "10").await.unwrap();
        assert_eq!(reloader.thresholds().snapshot().params.positive_radius, 10);
        assert!(source.entries().await.unwrap().contains(&ConfigEntry::new(POSITIVE_RADIUS, "10")));
    }

    #[tokio::test]
    async fn test_bootstrap_creates_and_persists_inbound_queue() {
        let source = Arc::new(MemoryConfigSource::new(&default_entries()));
        let transport = MemoryTransport::default();
        let reloader = ConfigReloader::new(source.clone(), Arc::new(SharedThresholds::default()));
        reloader.reload_once().await.unwrap();

        let queue = ensure_inbound_queue(&reloader, &transport).await.unwrap();
        assert!(transport.has_queue(&queue));
        assert_eq!(reloader.thresholds().snapshot().inbound_queue, Some(queue.clone()));
        assert!(source.entries().await.unwrap().contains(&ConfigEntry::new(INBOUND_QUEUE, queue.as_str())));

        // Second call reuses the stored reference.
        assert_eq!(ensure_inbound_queue(&reloader, &transport).await.unwrap(), queue);
        assert_eq!(transport.queue_count(), 1);
    }

    #[tokio::test]
    async fn test_reset_inbound_queue_is_bootstrapped_again() {
        let source = Arc::new(MemoryConfigSource::new(&default_entries()));
        let transport = Arc::new(MemoryTransport::default());
        let reloader =
            ConfigReloader::new(source.clone(), Arc::new(SharedThresholds::default())).with_transport(transport.clone());

        reloader.reload_once().await.unwrap();
        let queue = reloader.thresholds().snapshot().inbound_queue.clone().unwrap();
        assert!(transport.has_queue(&queue));

        reloader.update_field(INBOUND_QUEUE, UNSET_QUEUE).await.unwrap();
        assert_eq!(reloader.thresholds().snapshot().inbound_queue, Some(queue.clone()));
        assert!(source.entries().await.unwrap().contains(&ConfigEntry::new(INBOUND_QUEUE, queue.as_str())));
        assert_eq!(transport.queue_count(), 1);
    }

    #[tokio::test]
    async fn test_reload_loop_picks_up_changes_and_stops() {
        let source = Arc::new(MemoryConfigSource::new(&default_entries()));
        source.set(RELOAD_DELAY_SECS, "1");
        let thresholds = Arc::new(SharedThresholds::default());
        let reloader = Arc::new(ConfigReloader::new(source.clone(), thresholds.clone()));
        reloader.reload_once().await.unwrap();

        source.set(DENSITY_THRESHOLD, "6");
        let (tx, rx) = broadcast::channel(1);
        let handle = {
            let reloader = Arc::clone(&reloader);
            tokio::spawn(async move { reloader.run(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(1300)).await;
        assert_eq!(thresholds.snapshot().params.density_threshold, 6.0);

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
