//! Base validation of inbound protocol events: a per-event-type rule table
//! enforcing sender/recipient presence and node type, plus self-echo
//! suppression.

use crate::address::{BusAddress, NodeType};
use crate::error::ProtocolViolation;
use crate::protocol::{EventType, ProtocolEvent};

/// Whether an address field must, may, or must not be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Empty,
    Optional,
    Required,
}

/// Bitmask of allowed node types for an address field.
pub type TypeMask = u8;

pub const CHECK_NONE: TypeMask = 0;
pub const CHECK_GENERIC: TypeMask = 1 << 0;
pub const CHECK_NODE: TypeMask = 1 << 1;
pub const CHECK_SERVICE: TypeMask = 1 << 2;
pub const CHECK_AGENT: TypeMask = 1 << 3;
pub const CHECK_TEAM: TypeMask = 1 << 4;
pub const CHECK_AGENT_TYPES: TypeMask = CHECK_AGENT | CHECK_TEAM;
pub const CHECK_BDI: TypeMask = CHECK_AGENT_TYPES | CHECK_SERVICE;

fn mask_bit(kind: NodeType) -> TypeMask {
    match kind {
        NodeType::Generic => CHECK_GENERIC,
        NodeType::Node => CHECK_NODE,
        NodeType::Service => CHECK_SERVICE,
        NodeType::Agent => CHECK_AGENT,
        NodeType::Team => CHECK_TEAM,
    }
}

/// Requirements for one protocol event type.
#[derive(Debug, Clone, Copy)]
pub struct CheckRule {
    pub recipient: Presence,
    pub recipient_type: TypeMask,
    pub sender: Presence,
    pub sender_type: TypeMask,
}

/// The rule table. `None` events are rejected before lookup.
pub fn rule_for(event_type: EventType) -> CheckRule {
    use Presence::*;
    match event_type {
        EventType::Control => CheckRule {
            recipient: Required,
            recipient_type: CHECK_BDI,
            sender: Optional,
            sender_type: CHECK_NONE,
        },
        EventType::Percept | EventType::Message => CheckRule {
            recipient: Optional,
            recipient_type: CHECK_BDI,
            sender: Optional,
            sender_type: CHECK_NONE,
        },
        EventType::Pursue => CheckRule {
            recipient: Required,
            recipient_type: CHECK_AGENT_TYPES,
            sender: Optional,
            sender_type: CHECK_NONE,
        },
        EventType::Drop => CheckRule {
            recipient: Required,
            recipient_type: CHECK_BDI,
            sender: Optional,
            sender_type: CHECK_NONE,
        },
        EventType::Delegation => CheckRule {
            recipient: Required,
            recipient_type: CHECK_AGENT_TYPES,
            sender: Required,
            sender_type: CHECK_AGENT_TYPES,
        },
        EventType::Register
        | EventType::Deregister
        | EventType::AgentJoinTeam
        | EventType::AgentLeaveTeam
        | EventType::BdiLog => CheckRule {
            recipient: Optional,
            recipient_type: CHECK_NONE,
            sender: Optional,
            sender_type: CHECK_NONE,
        },
        EventType::ActionBegin => CheckRule {
            recipient: Required,
            recipient_type: CHECK_BDI,
            sender: Required,
            sender_type: CHECK_BDI,
        },
        EventType::ActionUpdate => CheckRule {
            recipient: Required,
            recipient_type: CHECK_AGENT_TYPES,
            sender: Required,
            sender_type: CHECK_BDI,
        },
        EventType::None => CheckRule {
            recipient: Empty,
            recipient_type: CHECK_NONE,
            sender: Empty,
            sender_type: CHECK_NONE,
        },
    }
}

fn check_address(
    which: &'static str,
    address: &BusAddress,
    presence: Presence,
    mask: TypeMask,
    exists: &dyn Fn(&BusAddress) -> bool,
) -> Result<(), ProtocolViolation> {
    if !address.valid() {
        return Err(ProtocolViolation::InvalidAddress {
            field: which,
            address: address.to_compact_string(),
        });
    }
    match presence {
        Presence::Empty if address.is_set() => {
            return Err(ProtocolViolation::UnexpectedAddress { field: which })
        }
        Presence::Required if !address.is_set() => {
            return Err(ProtocolViolation::MissingAddress { field: which })
        }
        _ => {}
    }
    if address.is_set() {
        if mask != CHECK_NONE && mask & mask_bit(address.kind) == 0 {
            return Err(ProtocolViolation::DisallowedNodeType {
                field: which,
                kind: address.kind,
            });
        }
        // Concrete BDI entities must exist on this node to be addressed.
        if matches!(
            address.kind,
            NodeType::Agent | NodeType::Team | NodeType::Service
        ) && !exists(address)
        {
            return Err(ProtocolViolation::UnknownEntity {
                field: which,
                address: address.to_compact_string(),
            });
        }
    }
    Ok(())
}

/// Validate an inbound event against the rule table.
///
/// `exists` answers whether a concrete BDI instance for the address lives
/// on this node. On failure the caller logs and drops the event.
pub fn base_protocol_event_check(
    event: &ProtocolEvent,
    engine_address: &BusAddress,
    exists: &dyn Fn(&BusAddress) -> bool,
) -> Result<(), ProtocolViolation> {
    if !event.sender_node.is_set() {
        return Err(ProtocolViolation::MissingAddress {
            field: "sender_node",
        });
    }
    if event.sender_node == *engine_address {
        return Err(ProtocolViolation::SelfEcho);
    }
    if event.event_type() == EventType::None {
        return Err(ProtocolViolation::UnknownEventType);
    }

    let rule = rule_for(event.event_type());
    check_address(
        "recipient",
        &event.recipient,
        rule.recipient,
        rule.recipient_type,
        exists,
    )?;
    check_address("sender", &event.sender, rule.sender, rule.sender_type, exists)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ControlCommand, DropMode, ProtocolBody};
    use volition_core::UniqueId;

    fn node(name: &str) -> BusAddress {
        BusAddress::new(NodeType::Node, UniqueId::random(), name)
    }

    fn agent(name: &str) -> BusAddress {
        BusAddress::new(NodeType::Agent, UniqueId::random(), name)
    }

    #[test]
    fn self_echo_is_rejected() {
        let me = node("engine");
        let mut event = ProtocolEvent::new(ProtocolBody::Register {
            proxy: true,
            address: agent("a"),
            template_type: "T".into(),
            start: false,
            team: BusAddress::default(),
        });
        event.sender_node = me.clone();
        let err = base_protocol_event_check(&event, &me, &|_| true).unwrap_err();
        assert!(matches!(err, ProtocolViolation::SelfEcho));
    }

    #[test]
    fn pursue_requires_agent_recipient() {
        let me = node("engine");
        let mut event = ProtocolEvent::new(ProtocolBody::Pursue {
            goal: "G".into(),
            persistent: false,
            message: None,
            goal_id: None,
        });
        event.sender_node = node("other");

        // Missing recipient.
        let err = base_protocol_event_check(&event, &me, &|_| true).unwrap_err();
        assert!(matches!(err, ProtocolViolation::MissingAddress { .. }));

        // Service recipient is the wrong node type.
        event.recipient = BusAddress::new(NodeType::Service, UniqueId::random(), "svc");
        let err = base_protocol_event_check(&event, &me, &|_| true).unwrap_err();
        assert!(matches!(err, ProtocolViolation::DisallowedNodeType { .. }));

        // Agent recipient passes when it exists on this node.
        event.recipient = agent("a");
        assert!(base_protocol_event_check(&event, &me, &|_| true).is_ok());
        let err = base_protocol_event_check(&event, &me, &|_| false).unwrap_err();
        assert!(matches!(err, ProtocolViolation::UnknownEntity { .. }));
    }

    #[test]
    fn delegation_requires_both_ends() {
        let me = node("engine");
        let mut event = ProtocolEvent::new(ProtocolBody::Delegation {
            status: crate::protocol::DelegationStatus::Pending,
            goal: "G".into(),
            goal_id: String::new(),
            message: None,
            analyse: true,
            score: 0.0,
            team: "team".into(),
            team_id: String::new(),
            schedule_id: 0,
        });
        event.sender_node = node("other");
        event.recipient = agent("member");
        let err = base_protocol_event_check(&event, &me, &|_| true).unwrap_err();
        assert!(matches!(
            err,
            ProtocolViolation::MissingAddress { field: "sender" }
        ));

        event.sender = BusAddress::new(NodeType::Team, UniqueId::random(), "team");
        assert!(base_protocol_event_check(&event, &me, &|_| true).is_ok());
    }

    #[test]
    fn control_and_drop_accept_any_bdi_recipient() {
        let me = node("engine");
        for body in [
            ProtocolBody::Control {
                command: ControlCommand::Start,
            },
            ProtocolBody::Drop {
                goal: "G".into(),
                goal_id: String::new(),
                mode: DropMode::Force,
                reason: String::new(),
            },
        ] {
            let mut event = ProtocolEvent::new(body);
            event.sender_node = node("other");
            event.recipient = BusAddress::new(NodeType::Service, UniqueId::random(), "svc");
            assert!(base_protocol_event_check(&event, &me, &|_| true).is_ok());
        }
    }
}
