//! Agents hold beliefs and desires, drive the scheduling cadence, and own
//! their executor. Teams are agents that additionally delegate goals to
//! members through cost auctions. Proxies are local stand-ins whose
//! commands the engine forwards over the bus.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use volition_bus::{
    ActionStatus, BdiLogLevel, BdiLogPayload, BdiLogResult, BdiLogType, BusAddress, ControlCommand,
    DelegationStatus, DropMode, NodeType,
};
use volition_core::{
    builtin_tactic_name, AgentHandle, BeliefContext, Desire, FinishState, Goal, GoalHandle,
    GoalPersistence, Message, PlanOrder, ServiceHandle, Tactic, UniqueId,
};

use crate::engine::{EngineShared, Registries, SharedDirectory};
use crate::event::{ActionEvent, Event, EventBody};
use crate::executor::{AgentExecutor, PlanResult, RunningState, TickCtx};
use crate::promise::{GoalPromise, GoalPursue, PromiseState};
use crate::schedule::{
    AuctionProbe, PlannerGoalInput, Schedule, ScheduleInputs, FAILED_COST,
};
use crate::service::{ActionContext, ActionHandler, ActionResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Stopped,
    Running,
    Stopping,
}

/// Template an agent or team is cloned from.
#[derive(Clone, Default)]
pub struct AgentTemplate {
    pub name: String,
    /// Plan names this agent may use; empty means every committed plan.
    pub plans: Vec<String>,
    /// Goals pursued automatically when the agent starts.
    pub initial_desires: Vec<String>,
    pub roles: Vec<String>,
    /// Message schemas instantiated into the initial belief context.
    pub beliefs: Vec<String>,
    /// Services attached at creation, by template name.
    pub services: Vec<String>,
    pub action_handlers: HashMap<String, ActionHandler>,
    /// Tactics selected at creation.
    pub tactics: Vec<String>,
    pub team: bool,
}

impl AgentTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// One member's contribution to a role-shared belief set.
#[derive(Clone)]
pub struct SharedBeliefEntry {
    pub member: AgentHandle,
    pub beliefs: Message,
    pub last_updated_ms: u64,
}

pub struct Agent {
    handle: AgentHandle,
    template: String,
    address: BusAddress,
    state: AgentState,
    proxy: bool,
    team: bool,
    pub(crate) beliefs: BeliefContext,
    desires: Vec<Desire>,
    executor: AgentExecutor,
    attached_services: Vec<ServiceHandle>,
    action_handlers: HashMap<String, ActionHandler>,
    plans: Vec<String>,
    roles: Vec<String>,
    /// Active tactic per goal name; absent goals use the builtin tactic.
    tactics: HashMap<String, String>,
    members: Vec<AgentHandle>,
    memberships: Vec<AgentHandle>,
    shared_belief_sets: HashMap<String, Vec<SharedBeliefEntry>>,
    inbox: VecDeque<Event>,
    schedule_dirty: bool,
    schedule_id_counter: u64,
    /// A schedule still searching or waiting on auction bids.
    pending_schedule: Option<Schedule>,
    promises: HashMap<UniqueId, GoalPromise>,
    initial_desires: Vec<String>,
    shared: EngineShared,
}

impl Agent {
    pub(crate) fn new(
        template: &AgentTemplate,
        name: impl Into<String>,
        id: UniqueId,
        proxy: bool,
        shared: EngineShared,
    ) -> Self {
        let name = name.into();
        let handle = AgentHandle::with_id(name.clone(), id);
        let kind = if template.team {
            NodeType::Team
        } else {
            NodeType::Agent
        };
        let mut beliefs = BeliefContext::new();
        {
            let registries = shared.registries.read();
            for schema_name in &template.beliefs {
                match registries.schemas.get(schema_name) {
                    Some(schema) => beliefs.set_message(schema_name.clone(), schema.instantiate()),
                    None => tracing::warn!(schema = %schema_name, "Agent template names unknown belief schema"),
                }
            }
            for resource in registries.resources.values() {
                beliefs.add_resource(resource.clone());
            }
        }
        beliefs.set_agent_context(handle.clone());

        let mut tactics = HashMap::new();
        {
            let registries = shared.registries.read();
            for tactic_name in &template.tactics {
                if let Some(tactic) = registries.tactics.get(tactic_name) {
                    tactics.insert(tactic.goal_name.clone(), tactic_name.clone());
                }
            }
        }

        Self {
            address: BusAddress::new(kind, id, name),
            handle,
            template: template.name.clone(),
            state: AgentState::Stopped,
            proxy,
            team: template.team,
            beliefs,
            desires: Vec::new(),
            executor: AgentExecutor::new(),
            attached_services: Vec::new(),
            action_handlers: template.action_handlers.clone(),
            plans: template.plans.clone(),
            roles: template.roles.clone(),
            tactics,
            members: Vec::new(),
            memberships: Vec::new(),
            shared_belief_sets: HashMap::new(),
            inbox: VecDeque::new(),
            schedule_dirty: false,
            schedule_id_counter: 0,
            pending_schedule: None,
            promises: HashMap::new(),
            initial_desires: template.initial_desires.clone(),
            shared,
        }
    }

    pub fn handle(&self) -> &AgentHandle {
        &self.handle
    }

    pub fn address(&self) -> &BusAddress {
        &self.address
    }

    pub fn template_name(&self) -> &str {
        &self.template
    }

    pub fn is_team(&self) -> bool {
        self.team
    }

    pub fn is_proxy(&self) -> bool {
        self.proxy
    }

    pub fn running(&self) -> bool {
        self.state == AgentState::Running
    }

    pub fn stopped(&self) -> bool {
        self.state == AgentState::Stopped
    }

    pub fn context(&self) -> &BeliefContext {
        &self.beliefs
    }

    pub fn desires(&self) -> &[Desire] {
        &self.desires
    }

    pub fn members(&self) -> &[AgentHandle] {
        &self.members
    }

    pub fn memberships(&self) -> &[AgentHandle] {
        &self.memberships
    }

    pub fn attached_services(&self) -> &[ServiceHandle] {
        &self.attached_services
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn handles_action(&self, action: &str) -> bool {
        self.action_handlers.contains_key(action)
    }

    pub fn action_names(&self) -> impl Iterator<Item = &String> {
        self.action_handlers.keys()
    }

    pub fn shared_belief_sets(&self) -> &HashMap<String, Vec<SharedBeliefEntry>> {
        &self.shared_belief_sets
    }

    pub fn executor(&self) -> &AgentExecutor {
        &self.executor
    }

    /// Pursue the initial desires from the template and start running.
    pub fn start(&mut self) {
        if self.state == AgentState::Running {
            return;
        }
        self.state = AgentState::Running;
        self.schedule_dirty = true;
        let initial: Vec<String> = self.initial_desires.clone();
        for goal in initial {
            self.pursue(&goal, GoalPersistence::Yes, None, None);
        }
        self.sync_meta();
    }

    pub fn stop(&mut self) {
        if self.state != AgentState::Running {
            return;
        }
        self.state = AgentState::Stopping;
        self.sync_meta();
    }

    /// Add a desire (or re-attach to an existing one when `id` matches).
    /// Proxies forward the pursue to the real agent over the bus.
    pub fn pursue(
        &mut self,
        goal: &str,
        persistence: GoalPersistence,
        message: Option<Message>,
        id: Option<UniqueId>,
    ) -> GoalPursue {
        let goal_id = id.unwrap_or_else(UniqueId::random);
        let promise = self
            .promises
            .entry(goal_id)
            .or_insert_with(GoalPromise::new)
            .clone();

        self.shared.queue.push(
            Event::to(
                EventBody::Pursue {
                    goal: goal.to_string(),
                    persistence,
                    message,
                    goal_id: Some(goal_id),
                    parent: None,
                    delegated_by: None,
                },
                self.address.clone(),
            )
            .from(self.address.clone()),
        );

        GoalPursue {
            handle: GoalHandle::with_id(goal, goal_id),
            promise,
        }
    }

    pub fn drop_goal(&mut self, handle: &GoalHandle, reason: impl Into<String>) {
        self.drop_with_mode(handle, DropMode::Normal, reason);
    }

    pub fn drop_with_mode(
        &mut self,
        handle: &GoalHandle,
        mode: DropMode,
        reason: impl Into<String>,
    ) {
        self.shared.queue.push(
            Event::to(
                EventBody::Drop {
                    goal: handle.name.clone(),
                    goal_id: handle.id,
                    mode,
                    reason: reason.into(),
                },
                self.address.clone(),
            )
            .from(self.address.clone()),
        );
    }

    /// Update the belief store; optionally rebroadcast onto the bus.
    pub fn send_message(&mut self, msg: Message, broadcast_to_bus: bool) {
        let schema = msg.schema().to_string();
        self.beliefs.set_message(schema.clone(), msg.clone());
        self.schedule_dirty = true;
        self.share_beliefs(&schema);
        if broadcast_to_bus {
            self.shared.queue.push(
                Event::new(EventBody::Message {
                    msg,
                    broadcast: true,
                })
                .from(self.address.clone()),
            );
        }
    }

    pub fn attach_service(&mut self, service: ServiceHandle, force: bool) {
        if !force && self.attached_services.contains(&service) {
            return;
        }
        self.attached_services.retain(|s| *s != service);
        self.attached_services.push(service);
        self.schedule_dirty = true;
        self.sync_meta();
    }

    /// Select the active tactic for the goal it names.
    pub fn select_tactic(&mut self, tactic_name: &str) -> bool {
        let goal = {
            let registries = self.shared.registries.read();
            registries
                .tactics
                .get(tactic_name)
                .map(|t| t.goal_name.clone())
        };
        match goal {
            Some(goal) => {
                self.tactics.insert(goal, tactic_name.to_string());
                self.schedule_dirty = true;
                true
            }
            None => {
                tracing::warn!(agent = %self.handle, tactic = %tactic_name, "Unknown tactic");
                false
            }
        }
    }

    /// Enrol a member. The join event updates the member's own membership
    /// list and announces the change on the bus.
    pub fn add_member_agent(&mut self, member: AgentHandle) {
        if !self.team {
            tracing::warn!(agent = %self.handle, "Only teams take members");
            return;
        }
        if self.members.contains(&member) {
            return;
        }
        self.members.push(member.clone());
        self.schedule_dirty = true;
        self.sync_meta();
        self.shared.queue.push(
            Event::new(EventBody::AgentJoinTeam {
                team: self.address.clone(),
                agent: BusAddress::new(NodeType::Agent, member.id, member.name.clone()),
            })
            .from(self.address.clone()),
        );
    }

    pub fn remove_member_agent(&mut self, member: &AgentHandle) {
        if !self.members.contains(member) {
            return;
        }
        self.members.retain(|m| m != member);
        self.schedule_dirty = true;
        self.sync_meta();
        self.shared.queue.push(
            Event::new(EventBody::AgentLeaveTeam {
                team: self.address.clone(),
                agent: BusAddress::new(NodeType::Agent, member.id, member.name.clone()),
            })
            .from(self.address.clone()),
        );
    }

    pub(crate) fn add_membership(&mut self, team: AgentHandle) {
        if !self.memberships.contains(&team) {
            self.memberships.push(team);
        }
    }

    pub(crate) fn remove_membership(&mut self, team: &AgentHandle) {
        self.memberships.retain(|t| t != team);
    }

    pub(crate) fn route_event(&mut self, event: Event) {
        self.inbox.push_back(event);
    }

    /// Mirror scheduling-relevant agent facts into the engine directory
    /// that teams consult for delegation.
    fn sync_meta(&self) {
        let mut directory = self.shared.directory.write();
        if let Some(meta) = directory.agents.get_mut(&self.handle.id) {
            meta.running = self.state == AgentState::Running;
            meta.roles = self.roles.clone();
            meta.attached_services = self.attached_services.clone();
            meta.action_names = self.action_handlers.keys().cloned().collect();
            meta.members = self.members.clone();
        }
    }

    fn emit_goal_started(&self, desire: &Desire) {
        let (log_type, intention_id, task_id) = match &desire.parent {
            Some(parent) => (
                BdiLogType::SubGoalStarted,
                parent.intention_id.to_string(),
                parent.task_id.to_string(),
            ),
            None => (BdiLogType::GoalStarted, String::new(), String::new()),
        };
        self.shared.queue.push(
            Event::new(EventBody::BdiLog {
                level: BdiLogLevel::Normal,
                log_type,
                payload: BdiLogPayload::Goal {
                    goal: desire.handle.name.clone(),
                    goal_id: desire.handle.id.to_string(),
                    intention_id,
                    task_id,
                    drop_reason: String::new(),
                    result: None,
                },
            })
            .from(self.address.clone()),
        );
    }

    /// Drain and handle every routed event.
    pub(crate) fn process_events(&mut self, now_ms: u64) {
        while let Some(event) = self.inbox.pop_front() {
            let caller = event.caller.clone();
            match event.body {
                EventBody::Control { command } => match command {
                    ControlCommand::Start => self.start(),
                    ControlCommand::Stop => self.stop(),
                    ControlCommand::Pause => {
                        tracing::debug!(agent = %self.handle, "Pause is not supported, ignoring")
                    }
                },
                EventBody::Percept {
                    belief_set,
                    field,
                    value,
                } => {
                    self.beliefs.set_fact_value(&belief_set, field, value);
                    self.schedule_dirty = true;
                    self.share_beliefs(&belief_set);
                }
                EventBody::Message { msg, .. } => {
                    let schema = msg.schema().to_string();
                    self.beliefs.set_message(schema.clone(), msg);
                    self.schedule_dirty = true;
                    self.share_beliefs(&schema);
                }
                EventBody::Pursue {
                    goal,
                    persistence,
                    message,
                    goal_id,
                    parent,
                    delegated_by,
                } => {
                    self.handle_pursue(goal, persistence, message, goal_id, parent, delegated_by);
                }
                EventBody::Drop {
                    goal,
                    goal_id,
                    mode,
                    reason,
                } => {
                    self.handle_drop(&goal, goal_id, mode, &reason, now_ms);
                }
                EventBody::Delegation {
                    status,
                    goal,
                    message,
                    analyse,
                    team,
                    schedule_id,
                } => {
                    if analyse {
                        self.answer_auction(goal, message, team, schedule_id);
                    } else if status == DelegationStatus::Pending {
                        // The team assigned us this goal.
                        self.handle_pursue(
                            goal.name.clone(),
                            GoalPersistence::No,
                            message,
                            Some(goal.id),
                            None,
                            Some(team),
                        );
                    } else {
                        self.handle_delegation_status(&goal, status, now_ms);
                    }
                }
                EventBody::AuctionBid {
                    goal,
                    schedule_id,
                    bidder,
                    score,
                } => {
                    self.handle_auction_bid(goal, schedule_id, bidder, score);
                }
                EventBody::Action(action) => {
                    self.invoke_action_handler(action, caller);
                }
                EventBody::ActionComplete {
                    intention_id,
                    task_id,
                    status,
                    reply,
                } => {
                    let success = status != ActionStatus::Failed;
                    let mut executor = std::mem::take(&mut self.executor);
                    {
                        let mut ctx = TickCtx {
                            beliefs: &mut self.beliefs,
                            handle: &self.handle,
                            address: &self.address,
                            shared: &self.shared,
                            now_ms,
                        };
                        executor.on_action_task_complete(
                            intention_id,
                            task_id,
                            success,
                            reply,
                            &mut ctx,
                        );
                    }
                    self.executor = executor;
                }
                EventBody::Tactic { tactic } => {
                    self.select_tactic(&tactic);
                }
                EventBody::ShareBeliefSet {
                    belief_set,
                    beliefs,
                    member,
                } => {
                    self.handle_shared_beliefs(belief_set, beliefs, member, now_ms);
                }
                other => {
                    tracing::debug!(
                        agent = %self.handle,
                        kind = other.kind(),
                        "Agent ignoring event"
                    );
                }
            }
        }
    }

    fn handle_pursue(
        &mut self,
        goal: String,
        persistence: GoalPersistence,
        message: Option<Message>,
        goal_id: Option<UniqueId>,
        parent: Option<volition_core::ParentLink>,
        delegated_by: Option<AgentHandle>,
    ) {
        // Idempotent re-pursue by id.
        if let Some(id) = goal_id {
            if self.desires.iter().any(|d| d.handle.id == id) {
                return;
            }
        }

        let template: Option<Arc<Goal>> = {
            let registries = self.shared.registries.read();
            registries.goals.get(&goal).cloned()
        };
        let Some(template) = template else {
            tracing::warn!(agent = %self.handle, goal = %goal, "Pursue of unknown goal");
            if let Some(id) = goal_id {
                if let Some(promise) = self.promises.remove(&id) {
                    promise.resolve(PromiseState::Failed(format!("Unknown goal '{goal}'")));
                }
            }
            return;
        };

        if template.delegated && !self.team && delegated_by.is_none() {
            tracing::warn!(agent = %self.handle, goal = %goal, "Delegated goals are pursued by teams");
            if let Some(id) = goal_id {
                if let Some(promise) = self.promises.remove(&id) {
                    promise.resolve(PromiseState::Failed(
                        "Only teams pursue delegated goals".to_string(),
                    ));
                }
            }
            return;
        }

        let mut desire = Desire::new(template, goal_id, message);
        desire.persistence = persistence;
        desire.parent = parent;
        desire.delegated_by = delegated_by;
        tracing::debug!(agent = %self.handle, goal = %desire.handle, "New desire");
        self.emit_goal_started(&desire);
        self.desires.push(desire);
        self.schedule_dirty = true;
    }

    fn handle_drop(
        &mut self,
        goal: &str,
        goal_id: UniqueId,
        mode: DropMode,
        reason: &str,
        now_ms: u64,
    ) {
        let position = self.desires.iter().position(|d| {
            if goal_id.valid() {
                d.handle.id == goal_id
            } else {
                d.handle.name == goal
            }
        });
        let Some(position) = position else {
            tracing::debug!(agent = %self.handle, goal = %goal, "Drop for unknown desire");
            return;
        };

        if mode == DropMode::Normal && self.desires[position].is_persistent() {
            tracing::info!(
                agent = %self.handle,
                goal = %self.desires[position].handle,
                "Refusing normal drop of a persistent goal"
            );
            return;
        }

        let handle = self.desires[position].handle.clone();
        let had_intention = {
            let mut executor = std::mem::take(&mut self.executor);
            let found = {
                let mut ctx = TickCtx {
                    beliefs: &mut self.beliefs,
                    handle: &self.handle,
                    address: &self.address,
                    shared: &self.shared,
                    now_ms,
                };
                executor.internal_drop(&handle, mode, reason, &mut ctx)
            };
            self.executor = executor;
            found
        };

        // A drop always invalidates in-flight planning; late auction bids
        // for the abandoned schedule are ignored as stale.
        self.pending_schedule = None;

        if !had_intention {
            // Nothing running for it: the desire dies on the spot.
            let desire = self.desires.remove(position);
            if let Some(promise) = self.promises.remove(&desire.handle.id) {
                promise.resolve(PromiseState::Failed(reason.to_string()));
            }
            self.shared.queue.push(
                Event::new(EventBody::BdiLog {
                    level: BdiLogLevel::Normal,
                    log_type: if desire.parent.is_some() {
                        BdiLogType::SubGoalFinished
                    } else {
                        BdiLogType::GoalFinished
                    },
                    payload: BdiLogPayload::Goal {
                        goal: desire.handle.name.clone(),
                        goal_id: desire.handle.id.to_string(),
                        intention_id: desire
                            .parent
                            .as_ref()
                            .map(|p| p.intention_id.to_string())
                            .unwrap_or_default(),
                        task_id: desire
                            .parent
                            .as_ref()
                            .map(|p| p.task_id.to_string())
                            .unwrap_or_default(),
                        drop_reason: reason.to_string(),
                        result: Some(BdiLogResult::Dropped),
                    },
                })
                .from(self.address.clone()),
            );
            if let Some(team) = &desire.delegated_by {
                // Tell the team the delegated goal went away.
                self.shared.queue.push(
                    Event::to(
                        EventBody::Delegation {
                            status: DelegationStatus::Failed,
                            goal: desire.handle.clone(),
                            message: None,
                            analyse: false,
                            team: team.clone(),
                            schedule_id: 0,
                        },
                        BusAddress::new(NodeType::Team, team.id, team.name.clone()),
                    )
                    .from(self.address.clone()),
                );
            }
        }
        self.schedule_dirty = true;
    }

    /// A member computes its bid for a delegated goal: the goal heuristic
    /// under its own beliefs, or the failure sentinel when it cannot plan
    /// the goal at all.
    fn answer_auction(
        &mut self,
        goal: GoalHandle,
        message: Option<Message>,
        team: AgentHandle,
        schedule_id: u64,
    ) {
        let score = self.compute_bid(&goal.name, message.as_ref());
        self.shared.queue.push(
            Event::to(
                EventBody::AuctionBid {
                    goal,
                    schedule_id,
                    bidder: self.handle.clone(),
                    score,
                },
                BusAddress::new(NodeType::Team, team.id, team.name.clone()),
            )
            .from(self.address.clone()),
        );
    }

    fn compute_bid(&mut self, goal_name: &str, message: Option<&Message>) -> f32 {
        let registries = self.shared.registries.read();
        let Some(goal) = registries.goals.get(goal_name).cloned() else {
            return FAILED_COST;
        };
        let tactic = self.current_tactic(&registries, goal_name);
        let plans = self.goal_tactic_plans(&registries, &tactic, goal_name);
        drop(registries);

        let supported: Vec<bool> = {
            let directory = self.shared.directory.read();
            plans
                .iter()
                .map(|plan| self.plan_supported(plan, &directory).is_none())
                .collect()
        };
        let mut viable = false;
        for (plan, ok) in plans.iter().zip(supported) {
            if !ok {
                continue;
            }
            self.beliefs.set_goal_context(message.cloned());
            let pre_ok = plan.valid(&self.beliefs);
            self.beliefs.set_goal_context(None);
            if pre_ok {
                viable = true;
                break;
            }
        }

        if !viable {
            return FAILED_COST;
        }
        self.beliefs.set_goal_context(message.cloned());
        let score = goal.heuristic(&self.beliefs);
        self.beliefs.set_goal_context(None);
        score
    }

    fn handle_auction_bid(
        &mut self,
        goal: GoalHandle,
        schedule_id: u64,
        bidder: AgentHandle,
        score: f32,
    ) {
        // Bids only count against the schedule generation that asked for
        // them; anything else could resurrect finished work.
        if let Some(schedule) = self.pending_schedule.as_mut() {
            if schedule.id() == schedule_id {
                schedule.process_auction(&goal, bidder, score);
                return;
            }
        }
        tracing::debug!(
            agent = %self.handle,
            goal = %goal,
            bidder = %bidder,
            schedule_id,
            "Stale auction bid ignored"
        );
    }

    fn handle_delegation_status(
        &mut self,
        goal: &GoalHandle,
        status: DelegationStatus,
        now_ms: u64,
    ) {
        // Delegation results are matched against live desires only; a
        // completed desire cannot be revived by a late status.
        if !self.desires.iter().any(|d| d.handle == *goal) {
            tracing::debug!(agent = %self.handle, goal = %goal, "Delegation status for finished desire");
            return;
        }
        let mut executor = std::mem::take(&mut self.executor);
        {
            let mut ctx = TickCtx {
                beliefs: &mut self.beliefs,
                handle: &self.handle,
                address: &self.address,
                shared: &self.shared,
                now_ms,
            };
            executor.handle_delegation_event(goal, status, &mut ctx);
        }
        self.executor = executor;
        self.schedule_dirty = true;
    }

    /// Run an action handler declared on the agent template itself.
    fn invoke_action_handler(&mut self, action: ActionEvent, caller: Option<BusAddress>) {
        let Some(handler) = self.action_handlers.get(&action.name).cloned() else {
            tracing::warn!(agent = %self.handle, action = %action.name, "No handler for routed action");
            return;
        };

        let reply_schema = {
            let registries = self.shared.registries.read();
            registries
                .actions
                .get(&action.name)
                .and_then(|def| def.reply_schema.clone())
                .and_then(|name| registries.schemas.get(&name).cloned())
        };
        let mut reply = reply_schema
            .map(|schema| schema.instantiate())
            .unwrap_or_else(|| Message::new(format!("{} Reply", action.name)));

        let handle = action.handle(self.address.clone());
        let result = {
            let mut ctx = ActionContext {
                beliefs: &mut self.beliefs,
                request: &action.request,
                reply: &mut reply,
                handle: &handle,
            };
            handler(&mut ctx)
        };
        self.schedule_dirty = true;

        let status = match result {
            ActionResult::Success => ActionStatus::Success,
            ActionResult::Failed => ActionStatus::Failed,
            ActionResult::Pending => return,
        };
        let recipient = action
            .remote_requester
            .clone()
            .or(caller)
            .unwrap_or_else(|| self.address.clone());
        self.shared.queue.push(
            Event::to(
                EventBody::ActionComplete {
                    intention_id: action.intention_id,
                    task_id: action.task_id,
                    status,
                    reply: Some(reply),
                },
                recipient,
            )
            .from(self.address.clone()),
        );
    }

    fn handle_shared_beliefs(
        &mut self,
        belief_set: String,
        beliefs: Message,
        member: AgentHandle,
        now_ms: u64,
    ) {
        if self.team {
            // Record the contribution, then fan it out to read-capable
            // members other than the contributor.
            let entries = self.shared_belief_sets.entry(belief_set.clone()).or_default();
            match entries.iter_mut().find(|e| e.member == member) {
                Some(entry) => {
                    entry.beliefs = beliefs.clone();
                    entry.last_updated_ms = now_ms;
                }
                None => entries.push(SharedBeliefEntry {
                    member: member.clone(),
                    beliefs: beliefs.clone(),
                    last_updated_ms: now_ms,
                }),
            }

            let readers: Vec<AgentHandle> = {
                let registries = self.shared.registries.read();
                let directory = self.shared.directory.read();
                self.members
                    .iter()
                    .filter(|m| **m != member)
                    .filter(|m| {
                        directory
                            .agents
                            .get(&m.id)
                            .map(|meta| {
                                meta.roles.iter().any(|role| {
                                    registries
                                        .roles
                                        .get(role)
                                        .map(|r| r.can_read(&belief_set))
                                        .unwrap_or(false)
                                })
                            })
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            };
            for reader in readers {
                self.shared.queue.push(
                    Event::to(
                        EventBody::ShareBeliefSet {
                            belief_set: belief_set.clone(),
                            beliefs: beliefs.clone(),
                            member: member.clone(),
                        },
                        BusAddress::new(NodeType::Agent, reader.id, reader.name.clone()),
                    )
                    .from(self.address.clone()),
                );
            }
        } else {
            // Another member's contribution arriving through the team.
            self.beliefs.set_message(belief_set, beliefs);
            self.schedule_dirty = true;
        }
    }

    /// Push a write-capable belief change up to every team this agent
    /// belongs to.
    fn share_beliefs(&mut self, schema: &str) {
        if self.memberships.is_empty() {
            return;
        }
        let writable = {
            let registries = self.shared.registries.read();
            self.roles.iter().any(|role| {
                registries
                    .roles
                    .get(role)
                    .map(|r| r.can_write(schema))
                    .unwrap_or(false)
            })
        };
        if !writable {
            return;
        }
        let Some(beliefs) = self.beliefs.message(schema).cloned() else {
            return;
        };
        for team in self.memberships.clone() {
            self.shared.queue.push(
                Event::to(
                    EventBody::ShareBeliefSet {
                        belief_set: schema.to_string(),
                        beliefs: beliefs.clone(),
                        member: self.handle.clone(),
                    },
                    BusAddress::new(NodeType::Team, team.id, team.name.clone()),
                )
                .from(self.address.clone()),
            );
        }
    }

    fn current_tactic(&self, registries: &Registries, goal_name: &str) -> Arc<Tactic> {
        if let Some(tactic_name) = self.tactics.get(goal_name) {
            if let Some(tactic) = registries.tactics.get(tactic_name) {
                return tactic.clone();
            }
        }
        if let Some(tactic) = registries.tactics.get(&builtin_tactic_name(goal_name)) {
            return tactic.clone();
        }
        Arc::new(Tactic::new(builtin_tactic_name(goal_name), goal_name))
    }

    /// The candidate plans for a goal under the active tactic, restricted
    /// to the agent's own plan list when one was authored.
    fn goal_tactic_plans(
        &self,
        registries: &Registries,
        tactic: &Tactic,
        goal_name: &str,
    ) -> Vec<Arc<volition_core::Plan>> {
        let allowed = |name: &str| self.plans.is_empty() || self.plans.iter().any(|p| p == name);

        if tactic.uses_plan_list {
            let mut seen = HashSet::new();
            tactic
                .plans
                .iter()
                .filter(|name| seen.insert((*name).clone()))
                .filter_map(|name| registries.plans.get(name))
                .filter(|plan| plan.goal_name == goal_name && allowed(&plan.name))
                .cloned()
                .collect()
        } else {
            let mut plans: Vec<_> = registries
                .plans
                .values()
                .filter(|plan| plan.goal_name == goal_name && allowed(&plan.name))
                .cloned()
                .collect();
            plans.sort_by(|a, b| a.name.cmp(&b.name));
            plans
        }
    }

    /// `None` when every action the plan references is handled locally or
    /// by an attached (or, by policy, any) available service.
    fn plan_supported(
        &self,
        plan: &volition_core::Plan,
        directory: &SharedDirectory,
    ) -> Option<String> {
        for action in plan.body.action_names() {
            if self.action_handlers.contains_key(action) {
                continue;
            }
            let attached_handles = self
                .attached_services
                .iter()
                .filter_map(|s| directory.services.get(&s.id))
                .any(|meta| meta.available && meta.actions.contains(action));
            if attached_handles {
                continue;
            }
            if self
                .shared
                .settings
                .unhandled_actions_forwarded_to_first_applicable_service
                && directory
                    .services
                    .values()
                    .any(|meta| meta.available && meta.actions.contains(action))
            {
                continue;
            }

            let mut reason = format!(
                "{}: Action '{action}' cannot be executed because no service handles it. Attached services:",
                plan.name
            );
            if self.attached_services.is_empty() {
                reason.push_str(" none");
            }
            for service in &self.attached_services {
                let available = directory
                    .services
                    .get(&service.id)
                    .map(|meta| meta.available)
                    .unwrap_or(false);
                reason.push_str(&format!(
                    "\n  {}: {}",
                    service,
                    if available { "available" } else { "unavailable" }
                ));
            }
            return Some(reason);
        }
        None
    }

    /// Members a delegated goal could be auctioned to: running members
    /// holding a role for the goal whose services cover every action of
    /// every plan handling it.
    fn delegates_for(
        &self,
        registries: &Registries,
        directory: &SharedDirectory,
        goal_name: &str,
    ) -> Vec<AgentHandle> {
        let needed: HashSet<String> = registries
            .plans
            .values()
            .filter(|plan| plan.goal_name == goal_name)
            .flat_map(|plan| plan.body.action_names().map(str::to_string).collect::<Vec<_>>())
            .collect();

        self.members
            .iter()
            .filter(|member| {
                let Some(meta) = directory.agents.get(&member.id) else {
                    return false;
                };
                if !meta.running {
                    return false;
                }
                let has_role = meta.roles.iter().any(|role| {
                    registries
                        .roles
                        .get(role)
                        .map(|r| r.handles_goal(goal_name))
                        .unwrap_or(false)
                });
                if !has_role {
                    return false;
                }
                needed.iter().all(|action| {
                    if meta.action_names.contains(action) {
                        return true;
                    }
                    meta.attached_services.iter().any(|service| {
                        directory
                            .services
                            .get(&service.id)
                            .map(|svc| svc.available && svc.actions.contains(action))
                            .unwrap_or(false)
                    })
                })
            })
            .cloned()
            .collect()
    }

    fn build_schedule(&mut self, now_ms: u64) -> (Schedule, Vec<AuctionProbe>) {
        let registries = self.shared.registries.read();
        let directory = self.shared.directory.read();

        let mut goals = Vec::with_capacity(self.desires.len());
        let mut plan_support = HashMap::new();
        let mut any_delegates = false;

        for desire in &self.desires {
            let tactic = self.current_tactic(&registries, &desire.goal.name);
            let plans = if desire.goal.delegated {
                Vec::new()
            } else {
                self.goal_tactic_plans(&registries, &tactic, &desire.goal.name)
            };
            for plan in &plans {
                plan_support
                    .entry(plan.name.clone())
                    .or_insert_with(|| self.plan_supported(plan, &directory));
            }
            let delegates = if desire.goal.delegated && self.team {
                self.delegates_for(&registries, &directory, &desire.goal.name)
            } else {
                Vec::new()
            };
            any_delegates |= !delegates.is_empty();

            goals.push(PlannerGoalInput {
                handle: desire.handle.clone(),
                goal: desire.goal.clone(),
                message: desire.message.clone(),
                plan_selection: desire.plan_selection.clone(),
                tactic,
                plans,
                delegates,
            });
        }
        drop(directory);
        drop(registries);

        let id = self.schedule_id_counter;
        self.schedule_id_counter += 1;

        Schedule::new(ScheduleInputs {
            id,
            agent: self.handle.clone(),
            context: self.beliefs.clone(),
            goals,
            plan_support,
            auction_deadline_ms: any_delegates
                .then(|| now_ms + self.shared.settings.auction_timeout_ms),
        })
    }

    fn dispatch_probes(&self, probes: Vec<AuctionProbe>) {
        for probe in probes {
            self.shared.queue.push(
                Event::to(
                    EventBody::Delegation {
                        status: DelegationStatus::Pending,
                        goal: probe.goal,
                        message: probe.message,
                        analyse: true,
                        team: self.handle.clone(),
                        schedule_id: probe.schedule_id,
                    },
                    BusAddress::new(
                        NodeType::Agent,
                        probe.delegate.id,
                        probe.delegate.name.clone(),
                    ),
                )
                .from(self.address.clone()),
            );
        }
    }

    /// Desires already satisfied by the current beliefs resolve their
    /// promises; satisfied one-shot desires without a live intention are
    /// finished outright.
    fn check_satisfied_desires(&mut self) {
        let mut finished: Vec<usize> = Vec::new();
        for (idx, desire) in self.desires.iter_mut().enumerate() {
            self.beliefs.set_goal_context(desire.message.clone());
            let satisfied = desire.goal.is_satisfied(&self.beliefs);
            self.beliefs.set_goal_context(None);
            if !satisfied {
                continue;
            }
            if let Some(promise) = self.promises.remove(&desire.handle.id) {
                promise.resolve(PromiseState::Success);
            }
            let has_intention = self
                .executor
                .intentions()
                .iter()
                .any(|i| i.desire_handle == desire.handle);
            if !desire.is_persistent() && !has_intention {
                desire.finished = FinishState::Success;
                finished.push(idx);
            }
        }
        for idx in finished.into_iter().rev() {
            let desire = self.desires.remove(idx);
            tracing::debug!(agent = %self.handle, goal = %desire.handle, "Desire already satisfied");
            self.shared.queue.push(
                Event::new(EventBody::BdiLog {
                    level: BdiLogLevel::Normal,
                    log_type: BdiLogType::GoalFinished,
                    payload: BdiLogPayload::Goal {
                        goal: desire.handle.name.clone(),
                        goal_id: desire.handle.id.to_string(),
                        intention_id: String::new(),
                        task_id: String::new(),
                        drop_reason: String::new(),
                        result: Some(BdiLogResult::Success),
                    },
                })
                .from(self.address.clone()),
            );
            self.schedule_dirty = true;
        }
    }

    /// Fold finished plan bodies back into the desires' plan-selection
    /// state so the next schedule honours the tactic's ordering and loop
    /// limits.
    fn record_plan_results(&mut self, results: Vec<PlanResult>) {
        if results.is_empty() {
            return;
        }
        let registries = self.shared.registries.read();
        for result in results {
            let Some(desire) = self.desires.iter_mut().find(|d| d.handle == result.goal) else {
                continue;
            };
            let tactic = if let Some(name) = self.tactics.get(&desire.goal.name) {
                registries.tactics.get(name).cloned()
            } else {
                registries
                    .tactics
                    .get(&builtin_tactic_name(&desire.goal.name))
                    .cloned()
            };
            let Some(tactic) = tactic else { continue };

            let iteration = desire.plan_selection.plan_loop_iteration;
            let history = desire.plan_selection.find_or_make_history(&result.plan);
            history.last_loop_iteration = iteration;
            if result.success {
                history.success_count += 1;
            } else {
                history.fail_count += 1;
            }

            match tactic.plan_order {
                PlanOrder::Strict if tactic.uses_plan_list && !tactic.plans.is_empty() => {
                    if let Some(pos) = tactic.plans.iter().position(|p| *p == result.plan) {
                        desire.plan_selection.plan_list_index = (pos + 1) % tactic.plans.len();
                        if pos + 1 == tactic.plans.len() {
                            desire.plan_selection.plan_loop_iteration += 1;
                        }
                    }
                }
                PlanOrder::ChooseBestPlan if !result.success => {
                    // The round ends once every candidate failed in it.
                    let candidates: Vec<String> = if tactic.uses_plan_list {
                        tactic.plans.clone()
                    } else {
                        registries
                            .plans
                            .values()
                            .filter(|p| p.goal_name == desire.goal.name)
                            .map(|p| p.name.clone())
                            .collect()
                    };
                    let all_failed = !candidates.is_empty()
                        && candidates.iter().all(|plan| {
                            desire
                                .plan_selection
                                .find_history(plan)
                                .map(|h| {
                                    h.last_loop_iteration == iteration && h.fail_count > 0
                                })
                                .unwrap_or(false)
                        });
                    if all_failed {
                        desire.plan_selection.plan_loop_iteration += 1;
                    }
                }
                _ => {}
            }
        }
    }

    /// The per-tick drive: refresh the schedule when it went stale, then
    /// advance the executor. Returns (running, executing) for the engine's
    /// poll tally.
    pub(crate) fn run(&mut self, now_ms: u64) -> (bool, bool) {
        if self.proxy || self.state == AgentState::Stopped {
            return (false, false);
        }

        self.check_satisfied_desires();

        if self.state == AgentState::Running {
            if let Some(mut schedule) = self.pending_schedule.take() {
                schedule.tick(now_ms);
                if schedule.done() {
                    self.install_schedule(schedule, now_ms);
                } else {
                    self.pending_schedule = Some(schedule);
                }
            } else if (self.schedule_dirty || !self.executor.schedule_valid())
                && !self.desires.is_empty()
            {
                let (mut schedule, probes) = self.build_schedule(now_ms);
                self.dispatch_probes(probes);
                schedule.tick(now_ms);
                if schedule.done() {
                    self.install_schedule(schedule, now_ms);
                } else {
                    self.pending_schedule = Some(schedule);
                }
            } else if self.desires.is_empty() {
                self.schedule_dirty = false;
            }
        }

        let stopping = self.state == AgentState::Stopping;
        if stopping {
            let mut executor = std::mem::take(&mut self.executor);
            {
                let mut ctx = TickCtx {
                    beliefs: &mut self.beliefs,
                    handle: &self.handle,
                    address: &self.address,
                    shared: &self.shared,
                    now_ms,
                };
                executor.stop(&mut ctx, &mut self.desires, &mut self.promises);
            }
            self.executor = executor;
            self.pending_schedule = None;
        }

        let results = {
            let mut executor = std::mem::take(&mut self.executor);
            let results = {
                let mut ctx = TickCtx {
                    beliefs: &mut self.beliefs,
                    handle: &self.handle,
                    address: &self.address,
                    shared: &self.shared,
                    now_ms,
                };
                executor.execute(&mut ctx, &mut self.desires, &mut self.promises, stopping)
            };
            self.executor = executor;
            results
        };
        self.record_plan_results(results);

        if stopping && self.executor.intentions().is_empty() && self.desires.is_empty() {
            self.state = AgentState::Stopped;
            self.sync_meta();
        }

        let executing = self.executor.running_state() == RunningState::Executing;
        (self.state != AgentState::Stopped, executing)
    }

    fn install_schedule(&mut self, schedule: Schedule, now_ms: u64) {
        let mut executor = std::mem::take(&mut self.executor);
        {
            let mut ctx = TickCtx {
                beliefs: &mut self.beliefs,
                handle: &self.handle,
                address: &self.address,
                shared: &self.shared,
                now_ms,
            };
            executor.set_schedule(schedule, &mut ctx, &mut self.desires);
        }
        self.executor = executor;
        self.schedule_dirty = false;
    }
}
