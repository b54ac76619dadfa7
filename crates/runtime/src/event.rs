//! Engine-internal events. External stimuli (bus frames) and internal
//! transitions (action dispatch, timers, auctions) all flow through the
//! same queue and are routed once per tick.

use volition_bus::{
    ActionStatus, BusAddress, ControlCommand, DelegationStatus, DropMode, NodeType,
};
use volition_core::{
    AgentHandle, GoalHandle, GoalPersistence, IntentionId, Message, ParentLink, TaskId, UniqueId,
    Value,
};

/// An in-flight dispatched action, allowing deferred completion from a
/// handler via `Engine::finish_action_handle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionHandle {
    pub action: String,
    pub agent: BusAddress,
    pub intention_id: IntentionId,
    pub task_id: TaskId,
}

/// An action invocation travelling from an intention to a handler.
#[derive(Debug, Clone)]
pub struct ActionEvent {
    pub name: String,
    pub request: Message,
    pub goal: GoalHandle,
    pub plan: String,
    pub intention_id: IntentionId,
    pub task_id: TaskId,
    pub resource_locks: Vec<String>,
    /// Set when the invocation arrived over the bus; completion is
    /// reported back as an ACTION_UPDATE to this address.
    pub remote_requester: Option<BusAddress>,
}

impl ActionEvent {
    pub fn handle(&self, agent: BusAddress) -> ActionHandle {
        ActionHandle {
            action: self.name.clone(),
            agent,
            intention_id: self.intention_id,
            task_id: self.task_id,
        }
    }
}

#[derive(Debug, Clone)]
pub enum EventBody {
    Control {
        command: ControlCommand,
    },
    Percept {
        belief_set: String,
        field: String,
        value: Value,
    },
    Message {
        msg: Message,
        /// Re-broadcast onto the bus after applying locally.
        broadcast: bool,
    },
    Pursue {
        goal: String,
        persistence: GoalPersistence,
        message: Option<Message>,
        /// Pre-specified id makes the pursue idempotent.
        goal_id: Option<UniqueId>,
        /// Sub-goal linkage back to the spawning task.
        parent: Option<ParentLink>,
        /// Set when a team delegated this goal to the recipient.
        delegated_by: Option<AgentHandle>,
    },
    Drop {
        goal: String,
        /// Nil id drops by goal name.
        goal_id: UniqueId,
        mode: DropMode,
        reason: String,
    },
    Delegation {
        status: DelegationStatus,
        goal: GoalHandle,
        message: Option<Message>,
        /// True when this is an auction probe and a bid is expected back.
        analyse: bool,
        team: AgentHandle,
        schedule_id: u64,
    },
    /// A member's bid answering an auction probe.
    AuctionBid {
        goal: GoalHandle,
        schedule_id: u64,
        bidder: AgentHandle,
        score: f32,
    },
    Action(ActionEvent),
    ActionComplete {
        intention_id: IntentionId,
        task_id: TaskId,
        status: ActionStatus,
        reply: Option<Message>,
    },
    /// Select the active tactic for its goal on the recipient agent.
    Tactic {
        tactic: String,
    },
    /// Request a wake-up call for a sleeping task.
    TimerRequest {
        fire_at_ms: u64,
        agent: BusAddress,
        intention_id: IntentionId,
        task_id: TaskId,
    },
    /// A member's contribution to a role-shared belief set.
    ShareBeliefSet {
        belief_set: String,
        beliefs: Message,
        member: AgentHandle,
    },
    /// Register an entity (locally queued or mapped from the bus).
    Register {
        proxy: bool,
        address: BusAddress,
        template_type: String,
        start: bool,
        team: Option<BusAddress>,
    },
    Deregister {
        id: UniqueId,
        node_type: NodeType,
    },
    AgentJoinTeam {
        team: BusAddress,
        agent: BusAddress,
    },
    AgentLeaveTeam {
        team: BusAddress,
        agent: BusAddress,
    },
    /// BDI-level trace record, forwarded onto the bus when adapters are
    /// attached.
    BdiLog {
        level: volition_bus::BdiLogLevel,
        log_type: volition_bus::BdiLogType,
        payload: volition_bus::BdiLogPayload,
    },
    /// Deferred agent creation, usable from inside an action handler.
    CreateAgent {
        template: String,
        name: String,
        uuid: Option<UniqueId>,
        start: bool,
        team: Option<AgentHandle>,
    },
}

impl EventBody {
    pub fn kind(&self) -> &'static str {
        match self {
            EventBody::Control { .. } => "CONTROL",
            EventBody::Percept { .. } => "PERCEPT",
            EventBody::Message { .. } => "MESSAGE",
            EventBody::Pursue { .. } => "PURSUE",
            EventBody::Drop { .. } => "DROP",
            EventBody::Delegation { .. } => "DELEGATION",
            EventBody::AuctionBid { .. } => "AUCTION",
            EventBody::Action(_) => "ACTION",
            EventBody::ActionComplete { .. } => "ACTION_COMPLETE",
            EventBody::Tactic { .. } => "TACTIC",
            EventBody::TimerRequest { .. } => "TIMER",
            EventBody::ShareBeliefSet { .. } => "SHARE_BELIEFSET",
            EventBody::Register { .. } => "REGISTER",
            EventBody::Deregister { .. } => "DEREGISTER",
            EventBody::AgentJoinTeam { .. } => "AGENT_JOIN_TEAM",
            EventBody::AgentLeaveTeam { .. } => "AGENT_LEAVE_TEAM",
            EventBody::BdiLog { .. } => "BDI_LOG",
            EventBody::CreateAgent { .. } => "CREATE_AGENT",
        }
    }
}

/// One queued event: type-specific body plus source and optional target.
#[derive(Debug, Clone)]
pub struct Event {
    pub caller: Option<BusAddress>,
    /// Direct delivery when set; fan-out per event type otherwise.
    pub recipient: Option<BusAddress>,
    pub body: EventBody,
    /// True when this event arrived through a bus adapter; such events are
    /// never re-broadcast.
    pub from_bus: bool,
}

impl Event {
    pub fn new(body: EventBody) -> Self {
        Self {
            caller: None,
            recipient: None,
            body,
            from_bus: false,
        }
    }

    pub fn to(body: EventBody, recipient: BusAddress) -> Self {
        Self {
            caller: None,
            recipient: Some(recipient),
            body,
            from_bus: false,
        }
    }

    pub fn from(mut self, caller: BusAddress) -> Self {
        self.caller = Some(caller);
        self
    }
}
