//! # Configuration Modules
//!
//! Runtime (hot-reloadable) configuration of the relay. The static settings
//! of the server binary live with the binary itself.

/// Stored configuration entries, the reload cycle and inbound queue bootstrap.
pub mod config_dynamic;

pub use config_dynamic::{assign_parameters, default_entries, ensure_inbound_queue, ConfigEntry, ConfigReloader};
