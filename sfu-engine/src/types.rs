//! Common types used throughout the engine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Free-form application data attached to entities
pub type AppData = serde_json::Map<String, serde_json::Value>;

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Fresh random (UUID v4) id
            #[must_use]
            pub fn random() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

entity_id!(
    /// Unique identifier for a router
    RouterId
);
entity_id!(
    /// Unique identifier for a transport
    TransportId
);
entity_id!(
    /// Unique identifier for a producer
    ProducerId
);
entity_id!(
    /// Unique identifier for a consumer
    ConsumerId
);
entity_id!(
    /// Unique identifier for a data producer
    DataProducerId
);
entity_id!(
    /// Unique identifier for a data consumer
    DataConsumerId
);

/// Why an entity reached the closed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Caller invoked `close()`
    Explicit,
    WorkerClosed,
    RouterClosed,
    TransportClosed,
    ProducerClosed,
    DataProducerClosed,
}
