//! # volition-bus
//!
//! The protocol layer between engine nodes: bus addresses, wire events,
//! the inbound validation rule table, the adapter seam (with an in-memory
//! adapter for same-process meshes) and the heartbeat directory.

pub mod address;
pub mod adapter;
pub mod directory;
pub mod error;
pub mod protocol;
pub mod rules;

pub use address::{BusAddress, NodeType};
pub use adapter::{BusAdapter, InMemoryBus, InMemoryBusAdapter};
pub use directory::{BusDirectory, DirectoryEntry};
pub use error::{BusError, ProtocolViolation};
pub use protocol::{
    ActionStatus, BdiLogLevel, BdiLogPayload, BdiLogResult, BdiLogType, ControlCommand,
    DelegationStatus, DropMode, EventType, ProtocolBody, ProtocolEvent,
};
pub use rules::{base_protocol_event_check, rule_for, CheckRule, Presence};
