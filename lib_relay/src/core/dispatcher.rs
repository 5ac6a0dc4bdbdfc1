//! # Fan-out Dispatcher
//!
//! Takes one routed `Event` and its `DeliverySet` and enqueues a copy of the
//! event on every recipient queue.
//!
//! ## Delivery rules:
//!
//! 1.  **One envelope, many sends**: the outbound envelope is built once from the
//!     event (all eight attributes, verbatim body) and cloned per recipient.
//! 2.  **Per-recipient ordering**: each send carries a group key derived from the
//!     recipient queue reference, so messages for one subscriber keep their order.
//! 3.  **Best-effort dedup**: each send attempt gets a fresh dedup token. The
//!     token is not derived from the recipient, so it only suppresses exact
//!     retransmissions inside the transport's window.
//! 4.  **Failure isolation**: a failed send is recorded and the fan-out continues
//!     with the next recipient. Nothing is retried here.

use crate::connections::Transport;
use crate::core::matcher::DeliverySet;
use crate::error::RelayError;
use crate::model::{Event, OutboundEnvelope, QueueRef};
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

static NON_ALPHANUMERIC: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9]+").expect("valid regex"));

const GROUP_SUFFIX: &str = "groupID";

/// Ordering-group key for a recipient: the queue reference with every
/// non-alphanumeric character removed, followed by `groupID`.
pub fn group_key(queue_ref: &QueueRef) -> String {
    let stripped = NON_ALPHANUMERIC.replace_all(queue_ref.as_str(), "");
    format!("{}{}", stripped, GROUP_SUFFIX)
}

/// Source of dedup tokens. Combines the wall clock in nanoseconds with a
/// process-wide counter so two sends in the same nanosecond still differ.
#[derive(Debug, Default)]
pub struct DedupTokens {
    counter: AtomicU64,
}

impl DedupTokens {
    pub fn next_token(&self) -> String {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", nanos, seq)
    }
}

/// Outcome of a single recipient send.
#[derive(Debug)]
pub struct SendOutcome {
    pub subscriber_id: String,
    pub queue_ref: QueueRef,
    pub result: Result<(), RelayError>,
}

/// Everything that happened during one fan-out.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<SendOutcome>,
}

impl DispatchReport {
    /// Subscriber ids whose send succeeded.
    pub fn delivered(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_ok())
            .map(|o| o.subscriber_id.as_str())
            .collect()
    }

    /// Subscriber ids whose send failed.
    pub fn failed(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.subscriber_id.as_str())
            .collect()
    }

    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }
}

/// # Core Dispatcher
///
/// Holds the transport and the dedup token source. Stateless otherwise, so one
/// instance is shared by the router for its whole lifetime.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    tokens: DedupTokens,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport, tokens: DedupTokens::default() }
    }

    /// # Dispatch
    ///
    /// Sends the event to every member of `recipients`, exactly one attempt each.
    /// An empty delivery set sends nothing and returns an empty report.
    pub async fn dispatch(&self, event: &Event, recipients: &DeliverySet) -> DispatchReport {
        let envelope = event.to_envelope();
        let mut report = DispatchReport { outcomes: Vec::with_capacity(recipients.len()) };

        for (subscriber_id, queue_ref) in recipients.iter() {
            let outbound = OutboundEnvelope {
                envelope: envelope.clone(),
                group_key: group_key(queue_ref),
                dedup_token: self.tokens.next_token(),
            };
            let result = self.transport.send(queue_ref, outbound).await;
            if let Err(e) = &result {
                log::error!("Delivery to subscriber '{}' on {} failed: {}", subscriber_id, queue_ref, e);
            }
            report.outcomes.push(SendOutcome {
                subscriber_id: subscriber_id.to_string(),
                queue_ref: queue_ref.clone(),
                result,
            });
        }

        report
    }
}
