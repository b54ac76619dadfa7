use serde::{Deserialize, Serialize};
use std::fmt;

use volition_core::UniqueId;

/// The kind of entity an address refers to. Discriminants are part of the
/// wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    #[default]
    Generic = 0,
    Node = 1,
    Service = 2,
    Agent = 3,
    Team = 4,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Generic => "GENERIC",
            NodeType::Node => "NODE",
            NodeType::Service => "SERVICE",
            NodeType::Agent => "AGENT",
            NodeType::Team => "TEAM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GENERIC" => Some(NodeType::Generic),
            "NODE" => Some(NodeType::Node),
            "SERVICE" => Some(NodeType::Service),
            "AGENT" => Some(NodeType::Agent),
            "TEAM" => Some(NodeType::Team),
            _ => None,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifies an addressable entity on the protocol bus. Addresses compare
/// by id only; the name travels for readability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusAddress {
    #[serde(rename = "type")]
    pub kind: NodeType,
    pub id: UniqueId,
    pub name: String,
}

impl BusAddress {
    pub fn new(kind: NodeType, id: UniqueId, name: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            name: name.into(),
        }
    }

    /// A bus address is valid when it is zero-initialised, or both name and
    /// id are set.
    pub fn valid(&self) -> bool {
        (self.id.valid() && !self.name.is_empty()) || (!self.id.valid() && self.name.is_empty())
    }

    /// Whether the address points at a specific entity.
    pub fn is_set(&self) -> bool {
        self.id.valid() && !self.name.is_empty()
    }

    /// Compact printable form, `type/name/id`.
    pub fn to_compact_string(&self) -> String {
        format!("{}/{}/{}", self.kind, self.name, self.id)
    }

    /// Parse the compact `type/name/id` form. The input is untrusted; any
    /// malformed segment yields `None`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '/');
        let kind = NodeType::parse(parts.next()?)?;
        let name = parts.next()?.to_string();
        let id = UniqueId::parse(parts.next()?)?;
        let address = Self { kind, id, name };
        address.valid().then_some(address)
    }
}

impl PartialEq for BusAddress {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for BusAddress {}

impl std::hash::Hash for BusAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_compact_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_address_is_valid_but_not_set() {
        let addr = BusAddress::default();
        assert!(addr.valid());
        assert!(!addr.is_set());
    }

    #[test]
    fn half_set_address_is_invalid() {
        let addr = BusAddress {
            kind: NodeType::Agent,
            id: UniqueId::random(),
            name: String::new(),
        };
        assert!(!addr.valid());
    }

    #[test]
    fn compact_string_round_trip() {
        let addr = BusAddress::new(NodeType::Team, UniqueId::random(), "alpha");
        let parsed = BusAddress::parse(&addr.to_compact_string()).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(parsed.kind, NodeType::Team);
        assert_eq!(parsed.name, "alpha");
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(BusAddress::parse("AGENT/onlytwo").is_none());
        assert!(BusAddress::parse("WHAT/name/id").is_none());
        assert!(BusAddress::parse("AGENT/name/not-a-uuid").is_none());
    }

    #[test]
    fn addresses_compare_by_id() {
        let id = UniqueId::random();
        let a = BusAddress::new(NodeType::Agent, id, "a");
        let b = BusAddress::new(NodeType::Team, id, "b");
        assert_eq!(a, b);
    }
}
