//! # lib_relay
//!
//! Routing core of the geo-aware occupancy relay. Publishers push occupancy
//! reports into one shared inbound queue; the router matches every report
//! against the subscriber directory, fans it out to the private queue of each
//! interested, nearby subscriber and raises density / positive-case alerts.
//!
//! Folder layout mirrors the responsibilities:
//!
//! - **`model`**: events, subscriber records and the wire envelope.
//! - **`core`**: matcher, dispatcher, alert evaluator, thresholds, the router
//!   loop and the subscriber registry.
//! - **`connections`**: collaborator traits, in-memory implementations and
//!   (with the `connections` feature) the Redis adapters.
//! - **`configs`**: the dynamic configuration entries and the reload cycle.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Dynamic configuration entries and the periodic reload task.
pub mod configs;
/// Directory, transport and configuration collaborators.
pub mod connections;
/// The matching-and-fan-out engine.
pub mod core;
/// Crate-wide error type.
pub mod error;
/// Domain types shared by every layer.
pub mod model;

pub use error::{RelayError, RelayResult};
pub use model::{Envelope, Event, Position, QueueRef, SubscriberRecord};
