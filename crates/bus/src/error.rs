use thiserror::Error;

use crate::address::NodeType;

/// Why an inbound protocol event was rejected by the validation pipeline.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("Event sender node echoes this engine's own address")]
    SelfEcho,

    #[error("Event type is out of range")]
    UnknownEventType,

    #[error("Event {field} address is malformed: {address}")]
    InvalidAddress {
        field: &'static str,
        address: String,
    },

    #[error("Event {field} must not be set for this event type")]
    UnexpectedAddress { field: &'static str },

    #[error("Event {field} is required for this event type")]
    MissingAddress { field: &'static str },

    #[error("Event {field} node type {kind} is not allowed for this event type")]
    DisallowedNodeType { field: &'static str, kind: NodeType },

    #[error("Event {field} references {address} which has no instance on this node")]
    UnknownEntity {
        field: &'static str,
        address: String,
    },
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Failed to encode protocol event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode protocol event: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Bus adapter '{0}' is disconnected")]
    Disconnected(String),
}

pub type Result<T> = std::result::Result<T, BusError>;
