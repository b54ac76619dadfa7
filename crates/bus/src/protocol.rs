//! Wire-level protocol events. The structure is JSON-compatible and
//! normative; concrete serialisation is adapter-specific.

use serde::{Deserialize, Serialize};
use std::fmt;

use volition_core::{Message, UniqueId, Value};

use crate::address::BusAddress;

/// Stable identifiers for every protocol event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    None = 0,
    Control,
    Percept,
    Pursue,
    Drop,
    Delegation,
    Message,
    Register,
    Deregister,
    AgentJoinTeam,
    AgentLeaveTeam,
    ActionBegin,
    ActionUpdate,
    BdiLog,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::None => "NONE",
            EventType::Control => "CONTROL",
            EventType::Percept => "PERCEPT",
            EventType::Pursue => "PURSUE",
            EventType::Drop => "DROP",
            EventType::Delegation => "DELEGATION",
            EventType::Message => "MESSAGE",
            EventType::Register => "REGISTER",
            EventType::Deregister => "DEREGISTER",
            EventType::AgentJoinTeam => "AGENT_JOIN_TEAM",
            EventType::AgentLeaveTeam => "AGENT_LEAVE_TEAM",
            EventType::ActionBegin => "ACTION_BEGIN",
            EventType::ActionUpdate => "ACTION_UPDATE",
            EventType::BdiLog => "BDI_LOG",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlCommand {
    Start = 0,
    Pause,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DropMode {
    /// Drops intention and goal only when the goal is not persistent.
    #[default]
    Normal = 0,
    /// Drops intention and goal unconditionally.
    Force = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DelegationStatus {
    Pending = 0,
    Failed = 1,
    Success = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Success = 0,
    Feedback = 1,
    Failed = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BdiLogLevel {
    Normal = 0,
    Important,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BdiLogType {
    GoalStarted = 0,
    GoalFinished,
    SubGoalStarted,
    SubGoalFinished,
    IntentionStarted,
    IntentionFinished,
    ActionStarted,
    ActionFinished,
    SleepStarted,
    SleepFinished,
    Condition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BdiLogResult {
    Failed = 0,
    Success = 1,
    Dropped = 2,
}

/// Type-specific payload of a BDI log event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BdiLogPayload {
    Goal {
        goal: String,
        goal_id: String,
        /// Set for sub-goal entries, empty otherwise.
        intention_id: String,
        task_id: String,
        drop_reason: String,
        result: Option<BdiLogResult>,
    },
    Intention {
        goal: String,
        goal_id: String,
        intention_id: String,
        plan: String,
        result: Option<BdiLogResult>,
    },
    Action {
        goal: String,
        goal_id: String,
        intention_id: String,
        plan: String,
        task_id: String,
        action: String,
        success: bool,
    },
    Sleep {
        goal: String,
        goal_id: String,
        intention_id: String,
        plan: String,
        task_id: String,
        sleep_ms: u64,
    },
    Condition {
        goal: String,
        goal_id: String,
        intention_id: String,
        plan: String,
        task_id: String,
        condition: String,
        success: bool,
    },
}

/// The type-specific body of a protocol event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolBody {
    Control {
        command: ControlCommand,
    },
    Percept {
        belief_set: String,
        field: String,
        value: Value,
    },
    Pursue {
        goal: String,
        persistent: bool,
        message: Option<Message>,
        /// Pre-specified goal id; pursue is idempotent when set.
        goal_id: Option<UniqueId>,
    },
    Drop {
        goal: String,
        goal_id: String,
        mode: DropMode,
        reason: String,
    },
    Delegation {
        status: DelegationStatus,
        goal: String,
        goal_id: String,
        message: Option<Message>,
        /// True when this is an auction and a cost should be computed.
        analyse: bool,
        /// The bid; lowest wins. Meaningful when `analyse` bounces back.
        score: f32,
        team: String,
        team_id: String,
        /// The schedule generation the auction belongs to.
        schedule_id: u64,
    },
    Message {
        data: Message,
    },
    Register {
        /// Instantiate as a proxy mirroring a remote entity.
        proxy: bool,
        address: BusAddress,
        template_type: String,
        start: bool,
        /// Starting team membership, when set.
        team: BusAddress,
    },
    Deregister {
        id: String,
        node_type: crate::address::NodeType,
    },
    AgentJoinTeam {
        team: BusAddress,
        agent: BusAddress,
    },
    AgentLeaveTeam {
        team: BusAddress,
        agent: BusAddress,
    },
    ActionBegin {
        name: String,
        task_id: String,
        goal: String,
        goal_id: String,
        intention_id: String,
        plan: String,
        message: Option<Message>,
        resource_locks: Vec<String>,
    },
    ActionUpdate {
        name: String,
        task_id: String,
        goal: String,
        goal_id: String,
        intention_id: String,
        plan: String,
        status: ActionStatus,
        reply: Option<Message>,
    },
    BdiLog {
        level: BdiLogLevel,
        log_type: BdiLogType,
        payload: BdiLogPayload,
    },
}

impl ProtocolBody {
    pub fn event_type(&self) -> EventType {
        match self {
            ProtocolBody::Control { .. } => EventType::Control,
            ProtocolBody::Percept { .. } => EventType::Percept,
            ProtocolBody::Pursue { .. } => EventType::Pursue,
            ProtocolBody::Drop { .. } => EventType::Drop,
            ProtocolBody::Delegation { .. } => EventType::Delegation,
            ProtocolBody::Message { .. } => EventType::Message,
            ProtocolBody::Register { .. } => EventType::Register,
            ProtocolBody::Deregister { .. } => EventType::Deregister,
            ProtocolBody::AgentJoinTeam { .. } => EventType::AgentJoinTeam,
            ProtocolBody::AgentLeaveTeam { .. } => EventType::AgentLeaveTeam,
            ProtocolBody::ActionBegin { .. } => EventType::ActionBegin,
            ProtocolBody::ActionUpdate { .. } => EventType::ActionUpdate,
            ProtocolBody::BdiLog { .. } => EventType::BdiLog,
        }
    }
}

/// A wire event: common header plus type-specific body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEvent {
    /// Microsecond timestamp; monotonically non-decreasing per sender
    /// engine.
    pub timestamp_us: u64,
    pub event_id: UniqueId,
    /// The engine node that sent the event.
    pub sender_node: BusAddress,
    /// The entity within the node that sent the event, when relevant.
    pub sender: BusAddress,
    /// Empty recipient means everyone listening on the bus.
    pub recipient: BusAddress,
    pub body: ProtocolBody,
}

impl ProtocolEvent {
    pub fn new(body: ProtocolBody) -> Self {
        Self {
            timestamp_us: 0,
            event_id: UniqueId::random(),
            sender_node: BusAddress::default(),
            sender: BusAddress::default(),
            recipient: BusAddress::default(),
            body,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.body.event_type()
    }

    pub fn with_sender(mut self, sender: BusAddress) -> Self {
        self.sender = sender;
        self
    }

    pub fn with_recipient(mut self, recipient: BusAddress) -> Self {
        self.recipient = recipient;
        self
    }
}

impl fmt::Display for ProtocolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{} -> {}, t={}us]",
            self.event_type(),
            self.sender_node,
            self.recipient,
            self.timestamp_us
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NodeType;

    fn sample_event() -> ProtocolEvent {
        let mut msg = Message::new("Hanoi");
        msg.set("peg1", 7u8);
        let mut event = ProtocolEvent::new(ProtocolBody::Pursue {
            goal: "SolvePuzzleGoal".into(),
            persistent: true,
            message: Some(msg),
            goal_id: Some(UniqueId::random()),
        });
        event.timestamp_us = 1234;
        event.sender_node =
            BusAddress::new(NodeType::Node, UniqueId::random(), "node-a");
        event.recipient =
            BusAddress::new(NodeType::Agent, UniqueId::random(), "agent1");
        event
    }

    #[test]
    fn json_round_trip_is_field_wise_equal() {
        let event = sample_event();
        let json = serde_json::to_string(&event).unwrap();
        let back: ProtocolEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.timestamp_us, event.timestamp_us);
        assert_eq!(back.event_id, event.event_id);
        assert_eq!(back.sender_node.name, event.sender_node.name);
        assert_eq!(back, event);
    }

    #[test]
    fn every_body_maps_to_its_event_type() {
        let event = sample_event();
        assert_eq!(event.event_type(), EventType::Pursue);

        let log = ProtocolEvent::new(ProtocolBody::BdiLog {
            level: BdiLogLevel::Normal,
            log_type: BdiLogType::GoalFinished,
            payload: BdiLogPayload::Goal {
                goal: "G".into(),
                goal_id: String::new(),
                intention_id: String::new(),
                task_id: String::new(),
                drop_reason: String::new(),
                result: Some(BdiLogResult::Success),
            },
        });
        assert_eq!(log.event_type(), EventType::BdiLog);
    }
}
