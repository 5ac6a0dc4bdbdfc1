//! # Alert Evaluator
//!
//! Produces operator notices for each routed event. Notices are independent of
//! recipient matching and are handed to an `AlertSink`; they never influence
//! delivery.

use crate::core::thresholds::ConfigParameters;
use crate::model::Event;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum AlertNotice {
    /// People per square metre reached the configured threshold.
    Density { source_id: String, ratio: f64, threshold: f64 },
    /// The report carried new positive cases.
    PositiveCases { source_id: String, count: u64 },
}

impl fmt::Display for AlertNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertNotice::Density { source_id, ratio, threshold } => write!(
                f,
                "density at source {} is {:.2} people/m2 (threshold {:.2})",
                source_id, ratio, threshold
            ),
            AlertNotice::PositiveCases { source_id, count } => {
                write!(f, "{} new positive case(s) reported by source {}", count, source_id)
            }
        }
    }
}

/// Zero, one or two notices. The threshold comparison is inclusive. People
/// reported on a zero area always breach it.
pub fn evaluate(event: &Event, params: &ConfigParameters) -> Vec<AlertNotice> {
    let mut notices = Vec::new();
    let ratio = event.density();
    if ratio >= params.density_threshold {
        notices.push(AlertNotice::Density {
            source_id: event.source_id.clone(),
            ratio,
            threshold: params.density_threshold,
        });
    }
    if event.positive_count > 0 {
        notices.push(AlertNotice::PositiveCases {
            source_id: event.source_id.clone(),
            count: event.positive_count,
        });
    }
    notices
}

/// Destination for operator notices.
pub trait AlertSink: Send + Sync {
    fn notify(&self, notice: &AlertNotice);
}

/// Writes notices to the log at `warn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, notice: &AlertNotice) {
        log::warn!("[ALERT] {}", notice);
    }
}
