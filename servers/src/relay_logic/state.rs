use lib_relay::configs::ConfigReloader;
use lib_relay::core::{SharedThresholds, SubscriberRegistry};
use std::sync::Arc;

/// Handles shared by the control-plane handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SubscriberRegistry>,
    pub reloader: Arc<ConfigReloader>,
}

impl AppState {
    pub fn new(registry: Arc<SubscriberRegistry>, reloader: Arc<ConfigReloader>) -> Self {
        Self { registry, reloader }
    }

    pub fn thresholds(&self) -> &Arc<SharedThresholds> {
        self.reloader.thresholds()
    }
}
