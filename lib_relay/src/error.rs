//! # Relay Errors
//!
//! One error enum for the whole library. The variants follow the failure
//! classes the router distinguishes: collaborator faults are transient and
//! retried by re-entering the poll loop, malformed input only drops the single
//! event, configuration faults only abort one reload cycle.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors raised by the routing engine and its collaborators.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The subscriber directory could not be queried or mutated.
    #[error("Directory error: {0}")]
    Directory(String),

    /// The queueing substrate rejected or failed an operation.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An inbound event could not be turned into a valid `Event`.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// A dynamic configuration entry is unknown or unparsable.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A conditional operation required an existing item.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A conditional create collided with an existing item.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Registration gave up after the configured number of id collisions.
    #[error("Registration failed after {0} attempts")]
    RegistrationExhausted(u32),

    /// Low-level Redis failure.
    #[cfg(feature = "connections")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A stored document or request body could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RelayError {
    /// Returns `true` for collaborator faults that a later poll cycle may not hit again.
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::Directory(_) | RelayError::Transport(_) => true,
            #[cfg(feature = "connections")]
            RelayError::Redis(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RelayError::Directory("timeout".into()).is_transient());
        assert!(RelayError::Transport("throttled".into()).is_transient());
        assert!(!RelayError::MalformedEvent("Radius".into()).is_transient());
        assert!(!RelayError::Config("mq".into()).is_transient());
        assert!(!RelayError::NotFound("42".into()).is_transient());
    }

    #[test]
    fn test_display_carries_detail() {
        let err = RelayError::RegistrationExhausted(3);
        assert_eq!(err.to_string(), "Registration failed after 3 attempts");
    }
}
