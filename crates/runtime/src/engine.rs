//! The engine: one node's tick loop. Owns the committed templates, the
//! live agents and services, the thread-safe event queue, timers, bus
//! adapters and the heartbeat directory.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use volition_bus::{
    base_protocol_event_check, ActionStatus, BusAddress, BusAdapter, BusDirectory, EventType,
    NodeType, ProtocolBody, ProtocolEvent,
};
use volition_core::{
    builtin_tactic_name, ActionDef, AgentHandle, CommitError, Goal, GoalPersistence, Message,
    MessageSchema, Plan, Resource, Role, ServiceHandle, Tactic, TaskId, UniqueId,
};

use crate::agent::{Agent, AgentTemplate};
use crate::error::{Result, RuntimeError};
use crate::event::{ActionEvent, ActionHandle, Event, EventBody};
use crate::queue::EventQueue;
use crate::service::{Service, ServiceTemplate};

/// Outgoing bus events are backlogged until this many polls have run, so
/// adapters that need subscriber discovery do not drop the first burst.
const QUEUE_BUS_EVENTS_PRIOR_TO_THIS_POLL_COUNT: u64 = 1;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub heartbeat_period_ms: u64,
    pub on_idle_sleep_ms: u64,
    pub auction_timeout_ms: u64,
    /// Actions no attached service handles fall back to the first
    /// applicable service on the node.
    pub unhandled_actions_forwarded_to_first_applicable_service: bool,
    /// `execute()` returns once no agent is running or executing.
    pub exit_when_done: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            heartbeat_period_ms: 1_000,
            on_idle_sleep_ms: 10,
            auction_timeout_ms: 1_000,
            unhandled_actions_forwarded_to_first_applicable_service: true,
            exit_when_done: false,
        }
    }
}

/// Every committed template, shared read-mostly with agents.
#[derive(Default)]
pub struct Registries {
    pub goals: HashMap<String, Arc<Goal>>,
    pub plans: HashMap<String, Arc<Plan>>,
    pub tactics: HashMap<String, Arc<Tactic>>,
    pub roles: HashMap<String, Role>,
    pub schemas: HashMap<String, MessageSchema>,
    pub actions: HashMap<String, ActionDef>,
    pub resources: HashMap<String, Resource>,
    pub agent_templates: HashMap<String, AgentTemplate>,
    pub service_templates: HashMap<String, ServiceTemplate>,
}

/// Scheduling-relevant facts about an agent, readable without borrowing
/// the agent itself (teams consult these when picking delegates).
#[derive(Clone, Default)]
pub struct AgentMeta {
    pub handle: Option<AgentHandle>,
    pub team: bool,
    pub proxy: bool,
    pub running: bool,
    pub roles: Vec<String>,
    pub action_names: std::collections::HashSet<String>,
    pub attached_services: Vec<ServiceHandle>,
    pub members: Vec<AgentHandle>,
}

#[derive(Clone, Default)]
pub struct ServiceMeta {
    pub handle: Option<ServiceHandle>,
    pub proxy: bool,
    pub available: bool,
    pub actions: std::collections::HashSet<String>,
}

#[derive(Default)]
pub struct SharedDirectory {
    pub agents: HashMap<UniqueId, AgentMeta>,
    pub services: HashMap<UniqueId, ServiceMeta>,
}

/// Cloneable handle bundle threaded into every agent and service instead
/// of a global engine pointer.
#[derive(Clone)]
pub struct EngineShared {
    pub queue: Arc<EventQueue>,
    pub registries: Arc<RwLock<Registries>>,
    pub directory: Arc<RwLock<SharedDirectory>>,
    pub node_address: BusAddress,
    pub settings: Arc<EngineSettings>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollResult {
    pub agents_running: usize,
    pub agents_executing: usize,
}

struct TimerEntry {
    fire_at_ms: u64,
    agent: BusAddress,
    intention_id: volition_core::IntentionId,
    task_id: TaskId,
}

pub struct Engine {
    name: String,
    address: BusAddress,
    shared: EngineShared,
    agents: Vec<Agent>,
    services: Vec<Service>,
    adapters: Vec<Box<dyn BusAdapter>>,
    bus_directory: BusDirectory,
    clock_ms: u64,
    last_poll: Option<Instant>,
    poll_count: u64,
    heartbeat_remaining_ms: i64,
    pending_bus: Vec<ProtocolEvent>,
    last_timestamp_us: u64,
    timers: Vec<TimerEntry>,
    exit: Arc<AtomicBool>,
    scratch_events: Vec<Event>,
    scratch_frames: Vec<ProtocolEvent>,
}

impl Engine {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_settings(name, EngineSettings::default())
    }

    pub fn with_settings(name: impl Into<String>, settings: EngineSettings) -> Self {
        let name = name.into();
        let address = BusAddress::new(NodeType::Node, UniqueId::random(), name.clone());
        let shared = EngineShared {
            queue: Arc::new(EventQueue::new()),
            registries: Arc::new(RwLock::new(Registries::default())),
            directory: Arc::new(RwLock::new(SharedDirectory::default())),
            node_address: address.clone(),
            settings: Arc::new(settings),
        };
        Self {
            name,
            address,
            shared,
            agents: Vec::new(),
            services: Vec::new(),
            adapters: Vec::new(),
            bus_directory: BusDirectory::new(),
            clock_ms: 0,
            last_poll: None,
            poll_count: 0,
            heartbeat_remaining_ms: 0,
            pending_bus: Vec::new(),
            last_timestamp_us: 0,
            timers: Vec::new(),
            exit: Arc::new(AtomicBool::new(false)),
            scratch_events: Vec::new(),
            scratch_frames: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &BusAddress {
        &self.address
    }

    pub fn poll_count(&self) -> u64 {
        self.poll_count
    }

    pub fn internal_clock_ms(&self) -> u64 {
        self.clock_ms
    }

    pub fn bus_directory(&self) -> &BusDirectory {
        &self.bus_directory
    }

    pub fn exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }

    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        self.exit.clone()
    }

    /* ********************************************************************
     * Template commits
     * ********************************************************************/

    pub fn commit_goal(&mut self, goal: Goal) -> Result<()> {
        if goal.name.is_empty() {
            return Err(CommitError::EmptyName.into());
        }
        let mut registries = self.shared.registries.write();
        let builtin = Tactic {
            name: builtin_tactic_name(&goal.name),
            goal_name: goal.name.clone(),
            plans: Vec::new(),
            plan_order: volition_core::PlanOrder::ChooseBestPlan,
            loop_plans_count: 1,
            uses_plan_list: false,
        };
        registries
            .tactics
            .insert(builtin.name.clone(), Arc::new(builtin));
        registries.goals.insert(goal.name.clone(), Arc::new(goal));
        Ok(())
    }

    pub fn commit_plan(&mut self, plan: Plan) -> Result<()> {
        if plan.name.is_empty() {
            return Err(CommitError::EmptyName.into());
        }
        if plan.goal_name.is_empty() {
            return Err(CommitError::PlanWithoutGoal { plan: plan.name }.into());
        }
        let mut registries = self.shared.registries.write();
        registries.plans.insert(plan.name.clone(), Arc::new(plan));
        Ok(())
    }

    pub fn commit_tactic(&mut self, mut tactic: Tactic) -> Result<()> {
        if tactic.name.is_empty() {
            return Err(CommitError::EmptyName.into());
        }
        let mut registries = self.shared.registries.write();
        if !registries.goals.contains_key(&tactic.goal_name) {
            return Err(CommitError::UnknownGoal {
                tactic: tactic.name,
                goal: tactic.goal_name,
            }
            .into());
        }
        for plan_name in &tactic.plans {
            let Some(plan) = registries.plans.get(plan_name) else {
                return Err(CommitError::UnknownPlan {
                    tactic: tactic.name.clone(),
                    plan: plan_name.clone(),
                }
                .into());
            };
            if plan.goal_name != tactic.goal_name {
                return Err(CommitError::PlanHandlesOtherGoal {
                    tactic: tactic.name.clone(),
                    plan: plan_name.clone(),
                    goal: tactic.goal_name.clone(),
                    handles: plan.goal_name.clone(),
                }
                .into());
            }
        }
        tactic.normalise();
        registries
            .tactics
            .insert(tactic.name.clone(), Arc::new(tactic));
        Ok(())
    }

    pub fn commit_role(&mut self, role: Role) -> Result<()> {
        if role.name.is_empty() {
            return Err(CommitError::EmptyName.into());
        }
        let mut registries = self.shared.registries.write();
        registries.roles.insert(role.name.clone(), role);
        Ok(())
    }

    pub fn commit_message_schema(&mut self, schema: MessageSchema) -> Result<()> {
        schema.validate().map_err(CommitError::Schema)?;
        let mut registries = self.shared.registries.write();
        registries.schemas.insert(schema.name.clone(), schema);
        Ok(())
    }

    pub fn commit_action(&mut self, action: ActionDef) -> Result<()> {
        if action.name.is_empty() {
            return Err(CommitError::EmptyName.into());
        }
        let mut registries = self.shared.registries.write();
        registries.actions.insert(action.name.clone(), action);
        Ok(())
    }

    pub fn commit_resource(&mut self, resource: Resource) -> Result<()> {
        if resource.name.is_empty() {
            return Err(CommitError::EmptyName.into());
        }
        let mut registries = self.shared.registries.write();
        registries
            .resources
            .insert(resource.name.clone(), resource);
        Ok(())
    }

    pub fn commit_agent(&mut self, template: AgentTemplate) -> Result<()> {
        if template.name.is_empty() {
            return Err(CommitError::EmptyName.into());
        }
        let mut registries = self.shared.registries.write();
        registries
            .agent_templates
            .insert(template.name.clone(), template);
        Ok(())
    }

    pub fn commit_team(&mut self, mut template: AgentTemplate) -> Result<()> {
        template.team = true;
        self.commit_agent(template)
    }

    pub fn commit_service(&mut self, template: ServiceTemplate) -> Result<()> {
        if template.name.is_empty() {
            return Err(CommitError::EmptyName.into());
        }
        let mut registries = self.shared.registries.write();
        registries
            .service_templates
            .insert(template.name.clone(), template);
        Ok(())
    }

    pub fn create_message(&self, schema_name: &str) -> Option<Message> {
        self.shared
            .registries
            .read()
            .schemas
            .get(schema_name)
            .map(MessageSchema::instantiate)
    }

    /* ********************************************************************
     * Instances
     * ********************************************************************/

    fn register_agent_meta(&self, agent: &Agent) {
        let mut directory = self.shared.directory.write();
        directory.agents.insert(
            agent.handle().id,
            AgentMeta {
                handle: Some(agent.handle().clone()),
                team: agent.is_team(),
                proxy: agent.is_proxy(),
                running: agent.running() || agent.is_proxy(),
                roles: agent.roles().to_vec(),
                action_names: agent.action_names().cloned().collect(),
                attached_services: agent.attached_services().to_vec(),
                members: agent.members().to_vec(),
            },
        );
    }

    fn register_service_meta(&self, service: &Service) {
        let mut directory = self.shared.directory.write();
        directory.services.insert(
            service.handle().id,
            ServiceMeta {
                handle: Some(service.handle().clone()),
                proxy: service.is_proxy(),
                available: service.is_available(),
                actions: service.action_names().cloned().collect(),
            },
        );
    }

    /// Clone the named template into a live agent. Publishes a REGISTER
    /// (with `proxy=true`) so peer nodes mirror it.
    pub fn create_agent(
        &mut self,
        template_name: &str,
        agent_name: &str,
        uuid: Option<UniqueId>,
    ) -> Result<AgentHandle> {
        let template = {
            let registries = self.shared.registries.read();
            registries
                .agent_templates
                .get(template_name)
                .cloned()
                .ok_or_else(|| RuntimeError::UnknownTemplate {
                    kind: "agent",
                    name: template_name.to_string(),
                })?
        };
        let id = uuid.unwrap_or_else(UniqueId::random);
        if self.agent_by_uuid(&id).is_some() {
            return Err(RuntimeError::AgentAlreadyExists(agent_name.to_string()));
        }
        let mut agent = Agent::new(&template, agent_name, id, false, self.shared.clone());

        // Attach services named by the template, matching on template name.
        let service_handles: Vec<ServiceHandle> = template
            .services
            .iter()
            .filter_map(|svc_template| {
                self.services
                    .iter()
                    .find(|s| s.template_name() == svc_template)
                    .map(|s| s.handle().clone())
            })
            .collect();
        for handle in service_handles {
            agent.attach_service(handle, false);
        }

        let handle = agent.handle().clone();
        self.register_agent_meta(&agent);
        let register = ProtocolEvent::new(ProtocolBody::Register {
            proxy: true,
            address: agent.address().clone(),
            template_type: template_name.to_string(),
            start: false,
            team: BusAddress::default(),
        });
        self.agents.push(agent);
        if !self.adapters.is_empty() {
            self.send_bus_event(register);
        }
        tracing::info!(engine = %self.name, agent = %handle, "Created agent");
        Ok(handle)
    }

    /// Instantiate a local stand-in for an agent living on another node.
    pub fn create_proxy_agent(
        &mut self,
        template_name: &str,
        agent_name: &str,
        uuid: UniqueId,
        team: bool,
    ) -> Result<AgentHandle> {
        let mut template = {
            let registries = self.shared.registries.read();
            registries
                .agent_templates
                .get(template_name)
                .cloned()
                .unwrap_or_else(|| AgentTemplate::new(template_name))
        };
        template.team = template.team || team;
        let agent = Agent::new(&template, agent_name, uuid, true, self.shared.clone());
        let handle = agent.handle().clone();
        self.register_agent_meta(&agent);
        self.agents.push(agent);
        tracing::info!(engine = %self.name, agent = %handle, "Created proxy agent");
        Ok(handle)
    }

    /// Queue agent creation as an event, usable from inside handlers.
    pub fn queue_create_agent(
        &mut self,
        template_name: &str,
        agent_name: &str,
        uuid: Option<UniqueId>,
        start: bool,
        team: Option<AgentHandle>,
    ) -> AgentHandle {
        let id = uuid.unwrap_or_else(UniqueId::random);
        self.shared.queue.push(Event::new(EventBody::CreateAgent {
            template: template_name.to_string(),
            name: agent_name.to_string(),
            uuid: Some(id),
            start,
            team,
        }));
        AgentHandle::with_id(agent_name, id)
    }

    pub fn destroy_agent(&mut self, handle: &AgentHandle) -> bool {
        let Some(index) = self.agents.iter().position(|a| a.handle() == handle) else {
            return false;
        };
        let agent = self.agents.remove(index);
        self.shared.directory.write().agents.remove(&handle.id);
        self.bus_directory.remove(agent.address());
        if !self.adapters.is_empty() {
            let deregister = ProtocolEvent::new(ProtocolBody::Deregister {
                id: handle.id.to_string(),
                node_type: if agent.is_team() {
                    NodeType::Team
                } else {
                    NodeType::Agent
                },
            });
            self.send_bus_event(deregister);
        }
        true
    }

    pub fn create_service(
        &mut self,
        template_name: &str,
        service_name: &str,
        proxy: bool,
        uuid: Option<UniqueId>,
    ) -> Result<ServiceHandle> {
        let template = {
            let registries = self.shared.registries.read();
            registries
                .service_templates
                .get(template_name)
                .cloned()
                .unwrap_or_else(|| ServiceTemplate::new(template_name))
        };
        let id = uuid.unwrap_or_else(UniqueId::random);
        let service = Service::new(&template, service_name, id, proxy, self.shared.clone());
        let handle = service.handle().clone();
        self.register_service_meta(&service);
        let register = ProtocolEvent::new(ProtocolBody::Register {
            proxy: true,
            address: service.address().clone(),
            template_type: template_name.to_string(),
            start: false,
            team: BusAddress::default(),
        });
        self.services.push(service);
        if !self.adapters.is_empty() {
            self.send_bus_event(register);
        }
        Ok(handle)
    }

    pub fn agent(&self, handle: &AgentHandle) -> Option<&Agent> {
        self.agents.iter().find(|a| a.handle() == handle)
    }

    pub fn agent_mut(&mut self, handle: &AgentHandle) -> Option<&mut Agent> {
        self.agents.iter_mut().find(|a| a.handle() == handle)
    }

    pub fn agent_by_uuid(&self, id: &UniqueId) -> Option<&Agent> {
        self.agents.iter().find(|a| a.handle().id == *id)
    }

    pub fn agent_by_name(&self, name: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.handle().name == name)
    }

    pub fn agent_by_name_mut(&mut self, name: &str) -> Option<&mut Agent> {
        self.agents.iter_mut().find(|a| a.handle().name == name)
    }

    pub fn agent_list(&self) -> Vec<AgentHandle> {
        self.agents.iter().map(|a| a.handle().clone()).collect()
    }

    pub fn service(&self, handle: &ServiceHandle) -> Option<&Service> {
        self.services.iter().find(|s| s.handle() == handle)
    }

    pub fn service_mut(&mut self, handle: &ServiceHandle) -> Option<&mut Service> {
        self.services.iter_mut().find(|s| s.handle() == handle)
    }

    pub fn service_list(&self) -> Vec<ServiceHandle> {
        self.services.iter().map(|s| s.handle().clone()).collect()
    }

    pub fn tactic_list(&self) -> Vec<String> {
        self.shared.registries.read().tactics.keys().cloned().collect()
    }

    /// Inject a percept: a single typed fact landing in the named belief
    /// set. Broadcast to every agent unless a recipient is given.
    pub fn send_percept(
        &mut self,
        belief_set: &str,
        field: &str,
        value: volition_core::Value,
        recipient: Option<BusAddress>,
    ) {
        let mut event = Event::new(EventBody::Percept {
            belief_set: belief_set.to_string(),
            field: field.to_string(),
            value,
        });
        event.recipient = recipient;
        self.shared.queue.push(event);
    }

    /// Complete a deferred action from outside the handler.
    pub fn finish_action_handle(
        &mut self,
        handle: &ActionHandle,
        success: bool,
        reply: Option<Message>,
    ) {
        self.shared.queue.push(
            Event::to(
                EventBody::ActionComplete {
                    intention_id: handle.intention_id,
                    task_id: handle.task_id,
                    status: if success {
                        ActionStatus::Success
                    } else {
                        ActionStatus::Failed
                    },
                    reply,
                },
                handle.agent.clone(),
            ),
        );
    }

    /* ********************************************************************
     * Bus
     * ********************************************************************/

    pub fn add_bus_adapter(&mut self, adapter: Box<dyn BusAdapter>) {
        tracing::info!(engine = %self.name, adapter = %adapter.name(), "Bus adapter attached");
        self.adapters.push(adapter);
    }

    pub fn remove_bus_adapter(&mut self, name: &str) -> bool {
        let before = self.adapters.len();
        self.adapters.retain(|a| a.name() != name);
        before != self.adapters.len()
    }

    pub fn have_bus_adapter(&self) -> bool {
        !self.adapters.is_empty()
    }

    fn next_timestamp_us(&mut self) -> u64 {
        let candidate = self.clock_ms * 1_000;
        let ts = candidate.max(self.last_timestamp_us + 1);
        debug_assert!(ts >= self.last_timestamp_us, "engine never time-travels");
        self.last_timestamp_us = ts;
        ts
    }

    /// Stamp and broadcast a protocol event through every adapter. During
    /// the first poll the event is backlogged and flushed on the second.
    pub fn send_bus_event(&mut self, mut event: ProtocolEvent) {
        event.timestamp_us = self.next_timestamp_us();
        event.sender_node = self.address.clone();
        if self.poll_count <= QUEUE_BUS_EVENTS_PRIOR_TO_THIS_POLL_COUNT {
            self.pending_bus.push(event);
            return;
        }
        for adapter in &mut self.adapters {
            if let Err(err) = adapter.send(&event) {
                tracing::warn!(adapter = %adapter.name(), error = %err, "Bus send failed");
            }
        }
    }

    /// Map an internal event onto the wire, for proxy forwarding and
    /// broadcasts. `None` for purely local event kinds.
    fn protocol_from_event(event: &Event) -> Option<ProtocolBody> {
        let body = match &event.body {
            EventBody::Control { command } => ProtocolBody::Control { command: *command },
            EventBody::Percept {
                belief_set,
                field,
                value,
            } => ProtocolBody::Percept {
                belief_set: belief_set.clone(),
                field: field.clone(),
                value: value.clone(),
            },
            EventBody::Message { msg, .. } => ProtocolBody::Message { data: msg.clone() },
            EventBody::Pursue {
                goal,
                persistence,
                message,
                goal_id,
                ..
            } => ProtocolBody::Pursue {
                goal: goal.clone(),
                persistent: persistence.is_persistent(),
                message: message.clone(),
                goal_id: *goal_id,
            },
            EventBody::Drop {
                goal,
                goal_id,
                mode,
                reason,
            } => ProtocolBody::Drop {
                goal: goal.clone(),
                goal_id: goal_id.to_string(),
                mode: *mode,
                reason: reason.clone(),
            },
            EventBody::Delegation {
                status,
                goal,
                message,
                analyse,
                team,
                schedule_id,
            } => ProtocolBody::Delegation {
                status: *status,
                goal: goal.name.clone(),
                goal_id: goal.id.to_string(),
                message: message.clone(),
                analyse: *analyse,
                score: 0.0,
                team: team.name.clone(),
                team_id: team.id.to_string(),
                schedule_id: *schedule_id,
            },
            EventBody::AuctionBid {
                goal,
                schedule_id,
                bidder: _,
                score,
            } => ProtocolBody::Delegation {
                status: volition_bus::DelegationStatus::Pending,
                goal: goal.name.clone(),
                goal_id: goal.id.to_string(),
                message: None,
                analyse: true,
                score: *score,
                team: String::new(),
                team_id: String::new(),
                schedule_id: *schedule_id,
            },
            EventBody::ActionComplete {
                intention_id,
                task_id,
                status,
                reply,
            } => ProtocolBody::ActionUpdate {
                name: String::new(),
                task_id: task_id.0.to_string(),
                goal: String::new(),
                goal_id: String::new(),
                intention_id: intention_id.0.to_string(),
                plan: String::new(),
                status: *status,
                reply: reply.clone(),
            },
            EventBody::BdiLog {
                level,
                log_type,
                payload,
            } => ProtocolBody::BdiLog {
                level: *level,
                log_type: *log_type,
                payload: payload.clone(),
            },
            EventBody::AgentJoinTeam { team, agent } => ProtocolBody::AgentJoinTeam {
                team: team.clone(),
                agent: agent.clone(),
            },
            EventBody::AgentLeaveTeam { team, agent } => ProtocolBody::AgentLeaveTeam {
                team: team.clone(),
                agent: agent.clone(),
            },
            _ => return None,
        };
        Some(body)
    }

    fn forward_to_bus(&mut self, event: &Event) {
        let Some(body) = Self::protocol_from_event(event) else {
            tracing::warn!(kind = event.body.kind(), "Event kind cannot travel the bus");
            return;
        };
        let mut protocol_event = ProtocolEvent::new(body);
        if let Some(caller) = &event.caller {
            protocol_event.sender = caller.clone();
        }
        if let Some(recipient) = &event.recipient {
            protocol_event.recipient = recipient.clone();
        }
        self.send_bus_event(protocol_event);
    }

    /* ********************************************************************
     * Tick
     * ********************************************************************/

    /// One engine tick. `delta` defaults to wall-clock time since the
    /// previous poll.
    pub fn poll(&mut self, delta: Option<Duration>) -> PollResult {
        let now = Instant::now();
        let dt_ms = match delta {
            Some(delta) => delta.as_millis() as u64,
            None => self
                .last_poll
                .map(|last| now.duration_since(last).as_millis() as u64)
                .unwrap_or(0),
        };
        self.last_poll = Some(now);

        if self.poll_count > QUEUE_BUS_EVENTS_PRIOR_TO_THIS_POLL_COUNT && !self.pending_bus.is_empty()
        {
            let backlog = std::mem::take(&mut self.pending_bus);
            for mut event in backlog {
                // Timestamps were assigned at queue time; keep them.
                event.sender_node = self.address.clone();
                for adapter in &mut self.adapters {
                    if let Err(err) = adapter.send(&event) {
                        tracing::warn!(adapter = %adapter.name(), error = %err, "Bus send failed");
                    }
                }
            }
        }

        if !self.adapters.is_empty() {
            self.heartbeat_remaining_ms -= dt_ms as i64;
            if self.heartbeat_remaining_ms <= 0 {
                self.heartbeat_remaining_ms = self.shared.settings.heartbeat_period_ms as i64;
                let register = ProtocolEvent::new(ProtocolBody::Register {
                    proxy: false,
                    address: self.address.clone(),
                    template_type: String::new(),
                    start: false,
                    team: BusAddress::default(),
                });
                self.send_bus_event(register);
            }
        }

        let mut frames = std::mem::take(&mut self.scratch_frames);
        frames.clear();
        for adapter in &mut self.adapters {
            adapter.poll(&mut frames);
        }
        for frame in frames.drain(..) {
            self.protocol_event_handler(frame);
        }
        self.scratch_frames = frames;

        self.clock_ms += dt_ms;

        let due: Vec<usize> = self
            .timers
            .iter()
            .enumerate()
            .filter(|(_, t)| t.fire_at_ms <= self.clock_ms)
            .map(|(i, _)| i)
            .collect();
        for index in due.into_iter().rev() {
            let timer = self.timers.swap_remove(index);
            self.shared.queue.push(Event::to(
                EventBody::ActionComplete {
                    intention_id: timer.intention_id,
                    task_id: timer.task_id,
                    status: ActionStatus::Success,
                    reply: None,
                },
                timer.agent,
            ));
        }

        let mut events = std::mem::take(&mut self.scratch_events);
        events.clear();
        self.shared.queue.drain_into(&mut events);
        for event in events.drain(..) {
            self.event_dispatch(event);
        }
        self.scratch_events = events;

        let mut result = PollResult::default();
        let clock = self.clock_ms;
        for agent in &mut self.agents {
            agent.process_events(clock);
            let (running, executing) = agent.run(clock);
            if running {
                result.agents_running += 1;
            }
            if executing {
                result.agents_executing += 1;
            }
        }
        for service in &mut self.services {
            service.process_events();
            service.run();
        }

        self.poll_count += 1;
        result
    }

    /// Run `poll` in a loop until `exit()` or, with `exit_when_done`, until
    /// nothing is running. Sleeps while idle, bounded by the nearest
    /// pending timer.
    pub fn execute(&mut self) {
        while !self.exit.load(Ordering::SeqCst) {
            let result = self.poll(None);
            if self.shared.settings.exit_when_done
                && result.agents_running == 0
                && result.agents_executing == 0
            {
                break;
            }
            if result.agents_executing == 0 {
                let idle = self.shared.settings.on_idle_sleep_ms;
                let until_timer = self
                    .timers
                    .iter()
                    .map(|t| t.fire_at_ms.saturating_sub(self.clock_ms))
                    .min()
                    .unwrap_or(idle);
                std::thread::sleep(Duration::from_millis(idle.min(until_timer).max(1)));
            }
        }
    }

    /// Move the engine onto its own thread.
    pub fn start(self) -> EngineThread {
        let exit = self.exit.clone();
        let handle = std::thread::spawn(move || {
            let mut engine = self;
            engine.execute();
            engine
        });
        EngineThread { handle, exit }
    }

    /* ********************************************************************
     * Dispatch
     * ********************************************************************/

    fn agent_index_by_id(&self, id: &UniqueId) -> Option<usize> {
        self.agents.iter().position(|a| a.handle().id == *id)
    }

    fn service_index_by_id(&self, id: &UniqueId) -> Option<usize> {
        self.services.iter().position(|s| s.handle().id == *id)
    }

    fn event_dispatch(&mut self, event: Event) {
        if let Some(recipient) = event.recipient.clone() {
            if let Some(index) = self.agent_index_by_id(&recipient.id) {
                if self.agents[index].is_proxy() {
                    if event.from_bus {
                        // The real agent lives on another node; the proxy
                        // mirror stays silent.
                        return;
                    }
                    if self.have_bus_adapter() {
                        self.forward_to_bus(&event);
                    } else {
                        tracing::warn!(
                            agent = %recipient,
                            kind = event.body.kind(),
                            "Proxy has no bus adapter to forward through"
                        );
                    }
                    return;
                }
                self.agents[index].route_event(event);
                return;
            }
            if let Some(index) = self.service_index_by_id(&recipient.id) {
                self.services[index].route_event(event);
                return;
            }
            // Unknown locally: completions may belong to a remote
            // requester.
            if matches!(event.body, EventBody::ActionComplete { .. })
                && self.have_bus_adapter()
                && !event.from_bus
            {
                self.forward_to_bus(&event);
                return;
            }
            tracing::warn!(
                recipient = %recipient,
                kind = event.body.kind(),
                "Dropping event for unknown recipient"
            );
            return;
        }

        match &event.body {
            EventBody::Register { .. } => self.handle_register_event(event),
            EventBody::Deregister { id, .. } => {
                let addresses: Vec<BusAddress> = self
                    .bus_directory
                    .iter()
                    .filter(|(addr, _)| addr.id == *id)
                    .map(|(addr, _)| addr.clone())
                    .collect();
                for address in addresses {
                    self.bus_directory.remove(&address);
                }
            }
            EventBody::AgentJoinTeam { team, agent } => {
                let (team, agent) = (team.clone(), agent.clone());
                self.join_team(&team, &agent, true);
                if self.have_bus_adapter() && !event.from_bus {
                    self.forward_to_bus(&event);
                }
            }
            EventBody::AgentLeaveTeam { team, agent } => {
                let (team, agent) = (team.clone(), agent.clone());
                self.join_team(&team, &agent, false);
                if self.have_bus_adapter() && !event.from_bus {
                    self.forward_to_bus(&event);
                }
            }
            EventBody::Message { broadcast, .. } => {
                let broadcast_out = *broadcast && !event.from_bus && self.have_bus_adapter();
                self.fan_out_to_agents(&event);
                if broadcast_out {
                    self.forward_to_bus(&event);
                }
            }
            EventBody::Percept { .. } => {
                self.fan_out_to_agents(&event);
            }
            EventBody::Action(_) => self.dispatch_action(event),
            EventBody::TimerRequest {
                fire_at_ms,
                agent,
                intention_id,
                task_id,
            } => {
                self.timers.push(TimerEntry {
                    fire_at_ms: *fire_at_ms,
                    agent: agent.clone(),
                    intention_id: *intention_id,
                    task_id: *task_id,
                });
            }
            EventBody::BdiLog { .. } => {
                if self.have_bus_adapter() && !event.from_bus {
                    self.forward_to_bus(&event);
                }
            }
            EventBody::CreateAgent {
                template,
                name,
                uuid,
                start,
                team,
            } => {
                let template = template.clone();
                let name = name.clone();
                let uuid = *uuid;
                let start = *start;
                let team = team.clone();
                match self.create_agent(&template, &name, uuid) {
                    Ok(handle) => {
                        if let Some(team) = team {
                            let team_addr =
                                BusAddress::new(NodeType::Team, team.id, team.name.clone());
                            let agent_addr =
                                BusAddress::new(NodeType::Agent, handle.id, handle.name.clone());
                            self.join_team(&team_addr, &agent_addr, true);
                        }
                        if start {
                            if let Some(agent) = self.agent_mut(&handle) {
                                agent.start();
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(template = %template, error = %err, "Queued agent creation failed")
                    }
                }
            }
            other => {
                tracing::warn!(kind = other.kind(), "Unroutable event without recipient");
            }
        }
    }

    /// PERCEPT/MESSAGE fan-out: all agents by default; service senders
    /// reach only agents attached to them.
    fn fan_out_to_agents(&mut self, event: &Event) {
        let service_sender = event
            .caller
            .as_ref()
            .filter(|c| c.kind == NodeType::Service)
            .map(|c| c.id);
        for agent in &mut self.agents {
            if agent.is_proxy() {
                continue;
            }
            if let Some(service_id) = service_sender {
                let attached = agent
                    .attached_services()
                    .iter()
                    .any(|s| s.id == service_id);
                if !attached {
                    continue;
                }
            }
            agent.route_event(event.clone());
        }
    }

    /// Find a handler for an ACTION: the calling agent's own handlers,
    /// its attached services, then (by policy) any applicable service.
    fn dispatch_action(&mut self, event: Event) {
        let (action_name, intention_id, task_id) = match &event.body {
            EventBody::Action(action) => {
                (action.name.clone(), action.intention_id, action.task_id)
            }
            _ => return,
        };
        let caller = event.caller.clone();

        let caller_agent = caller
            .as_ref()
            .and_then(|c| self.agent_index_by_id(&c.id));
        if let Some(index) = caller_agent {
            if self.agents[index].handles_action(&action_name) {
                self.agents[index].route_event(event);
                return;
            }
        }

        let attached: Vec<ServiceHandle> = caller_agent
            .map(|index| self.agents[index].attached_services().to_vec())
            .unwrap_or_default();
        for service_handle in attached {
            if let Some(index) = self.service_index_by_id(&service_handle.id) {
                if self.services[index].is_available()
                    && self.services[index].handles_action(&action_name)
                {
                    self.services[index].route_event(event);
                    return;
                }
            }
        }

        if self
            .shared
            .settings
            .unhandled_actions_forwarded_to_first_applicable_service
        {
            if let Some(index) = self
                .services
                .iter()
                .position(|s| s.is_available() && s.handles_action(&action_name))
            {
                self.services[index].route_event(event);
                return;
            }
        }

        tracing::error!(
            action = %action_name,
            caller = ?caller,
            "No suitable handler for action"
        );
        if let Some(caller) = caller {
            self.shared.queue.push(Event::to(
                EventBody::ActionComplete {
                    intention_id,
                    task_id,
                    status: ActionStatus::Failed,
                    reply: None,
                },
                caller,
            ));
        }
    }

    fn join_team(&mut self, team: &BusAddress, agent: &BusAddress, join: bool) {
        let team_handle = AgentHandle::with_id(team.name.clone(), team.id);
        let agent_handle = AgentHandle::with_id(agent.name.clone(), agent.id);

        if let Some(index) = self.agent_index_by_id(&team.id) {
            if self.agents[index].is_team() {
                if join {
                    self.agents[index].add_member_agent(agent_handle.clone());
                } else {
                    self.agents[index].remove_member_agent(&agent_handle);
                }
            } else {
                tracing::warn!(team = %team, "Join target is not a team");
            }
        }
        if let Some(index) = self.agent_index_by_id(&agent.id) {
            if join {
                self.agents[index].add_membership(team_handle);
            } else {
                self.agents[index].remove_membership(&team_handle);
            }
        }
    }

    fn handle_register_event(&mut self, event: Event) {
        let EventBody::Register {
            proxy,
            address,
            template_type,
            start,
            team,
        } = event.body
        else {
            return;
        };

        match address.kind {
            NodeType::Agent | NodeType::Team => {
                if self.agent_index_by_id(&address.id).is_some() {
                    tracing::debug!(address = %address, "Register for an agent that already exists");
                } else {
                    let created = if proxy {
                        self.create_proxy_agent(
                            &template_type,
                            &address.name,
                            address.id,
                            address.kind == NodeType::Team,
                        )
                    } else {
                        self.create_agent(&template_type, &address.name, Some(address.id))
                    };
                    match created {
                        Ok(handle) => {
                            if start {
                                if let Some(agent) = self.agent_mut(&handle) {
                                    agent.start();
                                }
                            }
                            if let Some(team) = &team {
                                let agent_addr = BusAddress::new(
                                    address.kind,
                                    handle.id,
                                    handle.name.clone(),
                                );
                                self.join_team(team, &agent_addr, true);
                            }
                        }
                        Err(err) => {
                            tracing::warn!(address = %address, error = %err, "Register could not instantiate agent")
                        }
                    }
                }
            }
            NodeType::Service => {
                if self.service_index_by_id(&address.id).is_none() {
                    if let Err(err) = self.create_service(
                        &template_type,
                        &address.name,
                        proxy,
                        Some(address.id),
                    ) {
                        tracing::warn!(address = %address, error = %err, "Register could not instantiate service");
                    }
                }
            }
            NodeType::Node | NodeType::Generic => {}
        }

        self.bus_directory.record(address, self.clock_ms);
    }

    /* ********************************************************************
     * Protocol ingress
     * ********************************************************************/

    fn protocol_event_handler(&mut self, event: ProtocolEvent) {
        let check = {
            let agents = &self.agents;
            let services = &self.services;
            let exists = |addr: &BusAddress| {
                agents.iter().any(|a| a.handle().id == addr.id)
                    || services.iter().any(|s| s.handle().id == addr.id)
            };
            base_protocol_event_check(&event, &self.address, &exists)
        };
        if let Err(violation) = check {
            tracing::warn!(event = %event, error = %violation, "Rejected bus event");
            return;
        }

        // Commands addressed to one of our proxies belong to the real
        // agent on its own node.
        if matches!(
            event.event_type(),
            EventType::Pursue | EventType::Drop | EventType::Delegation
        ) {
            if let Some(index) = self.agent_index_by_id(&event.recipient.id) {
                if self.agents[index].is_proxy() {
                    return;
                }
            }
        }

        let caller = event.sender.is_set().then(|| event.sender.clone());
        let recipient = event.recipient.is_set().then(|| event.recipient.clone());
        let sender_node = event.sender_node.clone();

        let body = match event.body {
            ProtocolBody::Control { command } => EventBody::Control { command },
            ProtocolBody::Percept {
                belief_set,
                field,
                value,
            } => EventBody::Percept {
                belief_set,
                field,
                value,
            },
            ProtocolBody::Message { data } => EventBody::Message {
                msg: data,
                broadcast: false,
            },
            ProtocolBody::Pursue {
                goal,
                persistent,
                message,
                goal_id,
            } => EventBody::Pursue {
                goal,
                persistence: if persistent {
                    GoalPersistence::Yes
                } else {
                    GoalPersistence::No
                },
                message,
                goal_id,
                parent: None,
                delegated_by: None,
            },
            ProtocolBody::Drop {
                goal,
                goal_id,
                mode,
                reason,
            } => EventBody::Drop {
                goal,
                goal_id: UniqueId::parse(&goal_id).unwrap_or_else(UniqueId::nil),
                mode,
                reason,
            },
            ProtocolBody::Delegation {
                status,
                goal,
                goal_id,
                message,
                analyse,
                score,
                team,
                team_id,
                schedule_id,
            } => {
                let goal_handle = volition_core::GoalHandle::with_id(
                    goal,
                    UniqueId::parse(&goal_id).unwrap_or_else(UniqueId::nil),
                );
                // A bid travels back to the team; a probe travels out to a
                // member.
                if analyse && event.recipient.kind == NodeType::Team {
                    EventBody::AuctionBid {
                        goal: goal_handle,
                        schedule_id,
                        bidder: AgentHandle::with_id(
                            event.sender.name.clone(),
                            event.sender.id,
                        ),
                        score,
                    }
                } else {
                    EventBody::Delegation {
                        status,
                        goal: goal_handle,
                        message,
                        analyse,
                        team: AgentHandle::with_id(
                            team,
                            UniqueId::parse(&team_id).unwrap_or_else(UniqueId::nil),
                        ),
                        schedule_id,
                    }
                }
            }
            ProtocolBody::Register {
                proxy,
                address,
                template_type,
                start,
                team,
            } => EventBody::Register {
                proxy,
                address,
                template_type,
                start,
                team: team.is_set().then_some(team),
            },
            ProtocolBody::Deregister { id, node_type } => EventBody::Deregister {
                id: UniqueId::parse(&id).unwrap_or_else(UniqueId::nil),
                node_type,
            },
            ProtocolBody::AgentJoinTeam { team, agent } => {
                EventBody::AgentJoinTeam { team, agent }
            }
            ProtocolBody::AgentLeaveTeam { team, agent } => {
                EventBody::AgentLeaveTeam { team, agent }
            }
            ProtocolBody::ActionBegin {
                name,
                task_id,
                goal,
                goal_id,
                intention_id,
                plan,
                message,
                resource_locks,
            } => EventBody::Action(ActionEvent {
                name,
                request: message.unwrap_or_default(),
                goal: volition_core::GoalHandle::with_id(
                    goal,
                    UniqueId::parse(&goal_id).unwrap_or_else(UniqueId::nil),
                ),
                plan,
                intention_id: parse_intention_id(&intention_id),
                task_id: parse_task_id(&task_id),
                resource_locks,
                remote_requester: Some(sender_node.clone()),
            }),
            ProtocolBody::ActionUpdate {
                task_id,
                intention_id,
                status,
                reply,
                ..
            } => EventBody::ActionComplete {
                intention_id: parse_intention_id(&intention_id),
                task_id: parse_task_id(&task_id),
                status,
                reply,
            },
            ProtocolBody::BdiLog { .. } => {
                // Remote traces are observability data, not commands.
                return;
            }
        };

        let mut internal = Event {
            caller: caller.or(Some(sender_node)),
            recipient,
            body,
            from_bus: true,
        };
        // REGISTER and team events act on the engine; everything else
        // routes like a local event.
        match &internal.body {
            EventBody::Register { .. }
            | EventBody::Deregister { .. }
            | EventBody::AgentJoinTeam { .. }
            | EventBody::AgentLeaveTeam { .. } => {
                internal.recipient = None;
                self.event_dispatch(internal);
            }
            _ => self.event_dispatch(internal),
        }
    }
}

fn parse_intention_id(s: &str) -> volition_core::IntentionId {
    let raw = s.strip_prefix("intention:").unwrap_or(s);
    uuid::Uuid::parse_str(raw)
        .map(volition_core::IntentionId)
        .unwrap_or_default()
}

fn parse_task_id(s: &str) -> TaskId {
    let raw = s.strip_prefix("task:").unwrap_or(s);
    uuid::Uuid::parse_str(raw).map(TaskId).unwrap_or_default()
}

/// Owner of an engine running on its own thread.
pub struct EngineThread {
    handle: std::thread::JoinHandle<Engine>,
    exit: Arc<AtomicBool>,
}

impl EngineThread {
    pub fn exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }

    pub fn join(self) -> Engine {
        self.handle.join().expect("engine thread panicked")
    }
}
