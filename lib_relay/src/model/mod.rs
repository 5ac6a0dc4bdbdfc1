//! # Domain Model
//!
//! Plain data shared by the routing core and the collaborators.

pub mod envelope;
pub mod event;
pub mod subscriber;

pub use envelope::{attr, AttributeValue, DataType, Envelope, OutboundEnvelope, ReceivedMessage};
pub use event::Event;
pub use subscriber::{Position, QueueRef, SubscriberRecord};
