//! # Core Engine Module
//!
//! Everything between "a message arrived on the inbound queue" and "copies sit
//! on the recipient queues".
//!
//! ## Core Components:
//!
//! - **`matcher`**: classifies an event and computes its deduplicated delivery set.
//! - **`dispatcher`**: fans the event out, one send per recipient, isolating failures.
//! - **`alerts`**: density and positive-case notices for operators.
//! - **`thresholds`**: the hot-swappable configuration snapshot.
//! - **`router`**: the receive / route / acknowledge loop.
//! - **`registry`**: subscriber lifecycle used by the control plane.

/// Density and positive-case notices.
pub mod alerts;
/// Per-recipient fan-out onto the transport.
pub mod dispatcher;
/// Event classification and recipient selection.
pub mod matcher;
/// Subscriber lifecycle operations.
pub mod registry;
/// Inbound poll loop.
pub mod router;
/// Atomically replaceable configuration snapshot.
pub mod thresholds;

// --- Public API Re-exports ---
pub use alerts::{AlertNotice, AlertSink, LogAlertSink};
pub use dispatcher::{DispatchReport, Dispatcher};
pub use matcher::{BoundingBox, DeliverySet, EventClass, MatchFilter, Matcher};
pub use registry::{Registration, SubscriberRegistry};
pub use router::{PollSummary, ReceiveSettings, Router};
pub use thresholds::{ConfigParameters, ConfigSnapshot, OperationalDelays, SharedThresholds};
