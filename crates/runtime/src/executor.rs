//! Per-agent intention execution: reconciles each new schedule with the
//! running intentions, ticks them under resource locks, and advances the
//! DAG as intentions conclude.

use std::collections::HashMap;

use volition_bus::{
    BdiLogLevel, BdiLogPayload, BdiLogResult, BdiLogType, BusAddress, DelegationStatus, DropMode,
    NodeType,
};
use volition_core::{
    AgentHandle, BeliefContext, Desire, FinishState, GoalHandle, IntentionId, Message, TaskId,
    UniqueId,
};

use crate::dag::IntentionExecutionDag;
use crate::engine::EngineShared;
use crate::event::{Event, EventBody};
use crate::intention::IntentionExecutor;
use crate::promise::{GoalPromise, PromiseState};
use crate::schedule::Schedule;

/// Borrowed slice of agent state threaded through one tick.
pub struct TickCtx<'a> {
    pub beliefs: &'a mut BeliefContext,
    pub handle: &'a AgentHandle,
    pub address: &'a BusAddress,
    pub shared: &'a EngineShared,
    pub now_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningState {
    /// No intentions in the executor.
    Idle,
    Executing,
    /// Every intention is suspended on an external completion.
    BusyWaitingOnExecutor,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ProcessDagNodeMode {
    OnClose,
    OnNewSchedule,
}

/// A finished plan body, handed to the agent for tactic bookkeeping.
pub struct PlanResult {
    pub goal: GoalHandle,
    pub plan: String,
    pub success: bool,
}

#[derive(Default)]
pub struct AgentExecutor {
    dag: IntentionExecutionDag,
    intentions: Vec<IntentionExecutor>,
    /// Which member each delegated goal is currently assigned to.
    delegations: HashMap<GoalHandle, AgentHandle>,
    schedule: Option<Schedule>,
    schedule_valid: bool,
    waiting_count: usize,
    working_count: usize,
}

fn member_address(handle: &AgentHandle) -> BusAddress {
    BusAddress::new(NodeType::Agent, handle.id, handle.name.clone())
}

impl AgentExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    pub fn schedule_mut(&mut self) -> Option<&mut Schedule> {
        self.schedule.as_mut()
    }

    pub fn schedule_valid(&self) -> bool {
        self.schedule_valid
    }

    pub fn invalidate_schedule(&mut self) {
        self.schedule_valid = false;
    }

    pub fn dag(&self) -> &IntentionExecutionDag {
        &self.dag
    }

    pub fn intentions(&self) -> &[IntentionExecutor] {
        &self.intentions
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting_count
    }

    pub fn working_count(&self) -> usize {
        self.working_count
    }

    pub fn running_state(&self) -> RunningState {
        if self.intentions.is_empty() {
            return RunningState::Idle;
        }
        if self.waiting_count == self.intentions.len() {
            RunningState::BusyWaitingOnExecutor
        } else {
            RunningState::Executing
        }
    }

    /// Nothing left to run: the DAG is spent and every executor idles
    /// without a plan.
    pub fn done(&self) -> bool {
        if !self.schedule_valid {
            return true;
        }
        if !self.dag.done() {
            return false;
        }
        self.intentions.iter().all(|i| i.is_waiting_for_plan())
    }

    fn find_intention(&self, handle: &GoalHandle) -> Option<usize> {
        self.intentions
            .iter()
            .position(|i| i.desire_handle == *handle)
    }

    fn find_intention_by_id(&self, id: IntentionId) -> Option<usize> {
        self.intentions.iter().position(|i| i.id == id)
    }

    /// Install a freshly planned schedule: drop goals that proved
    /// unplannable, retire intentions the new plan abandons, revoke stale
    /// delegations and assign executors to the DAG's open frontier.
    pub fn set_schedule(
        &mut self,
        schedule: Schedule,
        ctx: &mut TickCtx<'_>,
        desires: &mut Vec<Desire>,
    ) {
        self.dag.set_schedule(&schedule);
        self.schedule = Some(schedule);
        self.schedule_valid = true;
        let schedule = self.schedule.as_ref().expect("just stored");

        // Unplannable non-persistent goals without an in-flight intention
        // are dead weight; goals with a live intention get to finish on
        // their own terms.
        let mut drops: Vec<(GoalHandle, String)> = Vec::new();
        for (goal_idx, planner_goal) in schedule.planner_goals().iter().enumerate() {
            if planner_goal.can_be_planned || planner_goal.input.goal.persistent {
                continue;
            }
            let handle = &planner_goal.input.handle;
            if self.find_intention(handle).is_some() {
                continue;
            }
            if !desires.iter().any(|d| d.handle == *handle) {
                continue;
            }
            let reason = format!(
                "{} dropped goal {} because it was not plannable (no plans, no available members, or a failed precondition)\n{}",
                ctx.handle.name,
                handle,
                schedule.failure_summary(goal_idx),
            );
            drops.push((handle.clone(), reason));
        }
        for (handle, reason) in drops {
            tracing::info!(agent = %ctx.handle, goal = %handle, "Dropping unplannable goal");
            ctx.shared.queue.push(
                Event::to(
                    EventBody::Drop {
                        goal: handle.name.clone(),
                        goal_id: handle.id,
                        mode: DropMode::Normal,
                        reason,
                    },
                    ctx.address.clone(),
                )
                .from(ctx.address.clone()),
            );
        }

        // Retire intentions the new schedule no longer contains, unless
        // they are finishing, delegated, or still desired and plannable
        // (in-progress work survives a round that merely deprioritised
        // it).
        let mut to_drop: Vec<(GoalHandle, DropMode, String)> = Vec::new();
        for intention in &self.intentions {
            if self.dag.contains_goal(&intention.desire_handle) {
                continue;
            }
            if intention.is_concluded() || intention.is_dropping() {
                continue;
            }
            if intention.delegated {
                continue;
            }
            let schedule = self.schedule.as_ref().expect("stored above");
            let still_desired_and_plannable = schedule.planner_goals().iter().any(|pg| {
                pg.input.handle == intention.desire_handle && pg.can_be_planned
            });
            if still_desired_and_plannable {
                continue;
            }

            let scheduled: Vec<String> = self
                .dag
                .nodes()
                .iter()
                .map(|n| n.goal_handle().name.clone())
                .collect();
            let failure_detail = schedule
                .planner_goals()
                .iter()
                .position(|pg| pg.input.handle == intention.desire_handle)
                .map(|goal_idx| format!("\n{}", schedule.failure_summary(goal_idx)))
                .unwrap_or_default();
            let reason = format!(
                "{} is dropping an intention no longer present in its schedule: {} (plan {}). Scheduled goals: [{}]{}",
                ctx.handle.name,
                intention.desire_handle,
                intention
                    .current_plan()
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| "none".to_string()),
                scheduled.join(", "),
                failure_detail,
            );
            let mode = intention
                .drop_request()
                .map(|req| req.mode)
                .unwrap_or(DropMode::Normal);
            to_drop.push((intention.desire_handle.clone(), mode, reason));
        }
        for (handle, mode, reason) in to_drop {
            self.internal_drop(&handle, mode, &reason, ctx);
        }

        // A delegation reassigned to a new member revokes the old one.
        let open = self.dag.open();
        for &dag_idx in &open {
            let node = self.dag.node(dag_idx);
            let Some(delegate) = node.decision().delegate().cloned() else {
                continue;
            };
            let handle = node.goal_handle().clone();
            if let Some(previous) = self.delegations.get(&handle).cloned() {
                if previous != delegate {
                    self.send_delegation_drop(&handle, &previous, ctx);
                    self.delegations.remove(&handle);
                }
            }
        }

        for dag_idx in open {
            let handle = self.dag.node(dag_idx).goal_handle().clone();
            // A desire dropped while this schedule was still planning (or
            // auctioning) must not come back as a fresh intention.
            if !desires.iter().any(|d| d.handle == handle) {
                tracing::debug!(
                    agent = %ctx.handle,
                    goal = %handle,
                    "Scheduled goal is no longer desired, skipping"
                );
                continue;
            }
            let idx = match self.find_intention(&handle) {
                Some(idx) => idx,
                None => {
                    let idx = self.spawn_executor(&handle, dag_idx, desires);
                    tracing::debug!(
                        agent = %ctx.handle,
                        goal = %handle,
                        intentions = self.intentions.len(),
                        "New intention executor"
                    );
                    idx
                }
            };
            self.process_dag_node(idx, dag_idx, ProcessDagNodeMode::OnNewSchedule, ctx, desires);
        }
    }

    fn spawn_executor(
        &mut self,
        handle: &GoalHandle,
        dag_idx: usize,
        desires: &[Desire],
    ) -> usize {
        let node = self.dag.node(dag_idx);
        let persistence = desires
            .iter()
            .find(|d| d.handle == *handle)
            .map(|d| d.persistence)
            .unwrap_or(volition_core::GoalPersistence::No);
        self.intentions.push(IntentionExecutor::new(
            handle.clone(),
            node.intention.goal.clone(),
            node.intention.goal_msg.clone(),
            persistence,
            node.decision().is_delegation(),
        ));
        self.intentions.len() - 1
    }

    /// Transition an executor onto a DAG node: swap the plan in (unless an
    /// unchanged plan name would only churn), refresh the goal context and
    /// fire the delegation when the node assigns one.
    fn process_dag_node(
        &mut self,
        idx: usize,
        dag_idx: usize,
        mode: ProcessDagNodeMode,
        ctx: &mut TickCtx<'_>,
        desires: &mut [Desire],
    ) {
        let node = self.dag.node(dag_idx);
        let next_plan = node.decision().plan().cloned();
        let goal_msg = node.intention.goal_msg.clone();
        let goal_handle = node.goal_handle().clone();
        let selection = node.plan_selection().clone();
        let delegate = node.decision().delegate().cloned();
        let goal_message = node.intention.goal_msg.clone();

        let change = match mode {
            ProcessDagNodeMode::OnNewSchedule => {
                match (self.intentions[idx].current_plan(), &next_plan) {
                    // Same plan name across a dirty reschedule keeps the
                    // running instance.
                    (Some(curr), Some(next)) => curr.name != next.name,
                    _ => true,
                }
            }
            ProcessDagNodeMode::OnClose => true,
        };
        if change {
            self.intentions[idx].set_plan(next_plan, ctx);
        }
        self.intentions[idx].set_goal_context(goal_msg);
        let intention_id = self.intentions[idx].id;
        self.dag.assign(dag_idx, intention_id);

        if let Some(desire) = desires.iter_mut().find(|d| d.handle == goal_handle) {
            desire.plan_selection = selection;
        }

        if !self.intentions[idx].is_concluded() {
            if let Some(delegate) = delegate {
                if !self.delegations.contains_key(&goal_handle) {
                    tracing::debug!(
                        team = %ctx.handle,
                        delegate = %delegate,
                        goal = %goal_handle,
                        "Intention delegated"
                    );
                    ctx.shared.queue.push(
                        Event::to(
                            EventBody::Delegation {
                                status: DelegationStatus::Pending,
                                goal: goal_handle.clone(),
                                message: goal_message,
                                analyse: false,
                                team: ctx.handle.clone(),
                                schedule_id: 0,
                            },
                            member_address(&delegate),
                        )
                        .from(ctx.address.clone()),
                    );
                    self.delegations.insert(goal_handle, delegate);
                }
            }
        }
    }

    /// Tick every intention under its plan's resource locks.
    fn update(&mut self, ctx: &mut TickCtx<'_>) {
        self.waiting_count = 0;
        self.working_count = 0;

        let mut locked: Vec<Vec<String>> = Vec::with_capacity(self.intentions.len());
        for intention in &mut self.intentions {
            // Re-locking resources already held by an in-flight action is
            // fine, the counts match on unlock.
            let locks = intention
                .current_plan()
                .map(|plan| plan.resource_locks.clone())
                .unwrap_or_default();
            ctx.beliefs.lock_resources(&locks);
            locked.push(locks);

            intention.execute(ctx);

            if intention.is_waiting() {
                self.waiting_count += 1;
            }
            if !intention.is_concluded() {
                self.working_count += 1;
            }
        }

        for locks in locked {
            ctx.beliefs.unlock_resources(&locks);
        }
    }

    /// Per-tick driver: tick intentions, close finished DAG nodes to
    /// unlock downstream work, then retire concluded intentions and their
    /// desires.
    pub fn execute(
        &mut self,
        ctx: &mut TickCtx<'_>,
        desires: &mut Vec<Desire>,
        promises: &mut HashMap<UniqueId, GoalPromise>,
        stopping: bool,
    ) -> Vec<PlanResult> {
        self.update(ctx);

        let mut plan_results = Vec::new();
        let mut removals: Vec<IntentionId> = Vec::new();
        let mut subgoal_notices: Vec<(IntentionId, UniqueId, bool)> = Vec::new();

        // Snapshot the count: close() may append executors for downstream
        // nodes, which run next tick.
        let count = self.intentions.len();
        for idx in 0..count {
            if let Some((plan, success)) = self.intentions[idx].take_plan_result() {
                if !success {
                    // The tactic may allow another plan; force a replan.
                    self.schedule_valid = false;
                }
                plan_results.push(PlanResult {
                    goal: self.intentions[idx].desire_handle.clone(),
                    plan,
                    success,
                });
            }

            if (self.intentions[idx].is_concluded() || self.intentions[idx].is_waiting_for_plan())
                && self.schedule_valid
            {
                self.close(idx, ctx, desires);
            }

            if !self.intentions[idx].is_concluded() {
                continue;
            }

            let intention = &self.intentions[idx];
            removals.push(intention.id);
            self.schedule_valid = false;

            let drop_mode = intention
                .drop_request()
                .map(|req| req.mode)
                .unwrap_or(DropMode::Normal);
            let drop_reason = intention
                .drop_request()
                .map(|req| req.reason.clone())
                .unwrap_or_default();
            let finish = intention.finish_state();
            let handle = intention.desire_handle.clone();
            let persistent = intention.persistence.is_persistent();

            if let Some(delegate) = self.delegations.remove(&handle) {
                if finish == FinishState::Dropped {
                    self.send_delegation_drop(&handle, &delegate, ctx);
                }
            }

            let erase = !persistent || drop_mode == DropMode::Force || stopping;
            if !erase {
                continue;
            }
            let Some(pos) = desires.iter().position(|d| d.handle == handle) else {
                continue;
            };
            let desire = desires.remove(pos);
            tracing::debug!(agent = %ctx.handle, goal = %handle, result = ?finish, "Desire finished");

            let result = match finish {
                FinishState::Success => BdiLogResult::Success,
                FinishState::Dropped => BdiLogResult::Dropped,
                _ => BdiLogResult::Failed,
            };
            let payload = BdiLogPayload::Goal {
                goal: handle.name.clone(),
                goal_id: handle.id.to_string(),
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
                drop_reason: drop_reason.clone(),
                result: Some(result),
            };
            ctx.shared.queue.push(
                Event::new(EventBody::BdiLog {
                    level: BdiLogLevel::Normal,
                    log_type: if desire.parent.is_some() {
                        BdiLogType::SubGoalFinished
                    } else {
                        BdiLogType::GoalFinished
                    },
                    payload,
                })
                .from(ctx.address.clone()),
            );

            if let Some(promise) = promises.remove(&handle.id) {
                match finish {
                    FinishState::Success => promise.resolve(PromiseState::Success),
                    _ => promise.resolve(PromiseState::Failed(if drop_reason.is_empty() {
                        "Intention failed".to_string()
                    } else {
                        drop_reason.clone()
                    })),
                }
            }

            if let Some(parent) = &desire.parent {
                subgoal_notices.push((
                    parent.intention_id,
                    handle.id,
                    finish == FinishState::Success,
                ));
            }

            if let Some(team) = &desire.delegated_by {
                ctx.shared.queue.push(
                    Event::to(
                        EventBody::Delegation {
                            status: if finish == FinishState::Success {
                                DelegationStatus::Success
                            } else {
                                DelegationStatus::Failed
                            },
                            goal: handle.clone(),
                            message: None,
                            analyse: false,
                            team: team.clone(),
                            schedule_id: 0,
                        },
                        member_address(team),
                    )
                    .from(ctx.address.clone()),
                );
            }
        }

        for (parent_id, subgoal_id, success) in subgoal_notices {
            if let Some(pidx) = self.find_intention_by_id(parent_id) {
                self.intentions[pidx].on_subgoal_finished(subgoal_id, success, ctx);
            }
        }

        self.intentions.retain(|i| !removals.contains(&i.id));
        plan_results
    }

    /// Close the DAG node behind an intention; downstream nodes reuse the
    /// executor when they continue the same goal, otherwise get a fresh
    /// one.
    fn close(&mut self, idx: usize, ctx: &mut TickCtx<'_>, desires: &mut Vec<Desire>) {
        let intention_id = self.intentions[idx].id;
        let Some(dag_idx) = self.dag.node_for(intention_id) else {
            return;
        };
        let opened = self.dag.close(dag_idx);

        for open_idx in opened {
            let handle = self.dag.node(open_idx).goal_handle().clone();
            let target = if handle == self.intentions[idx].desire_handle {
                idx
            } else {
                self.spawn_executor(&handle, open_idx, desires)
            };
            self.process_dag_node(target, open_idx, ProcessDagNodeMode::OnClose, ctx, desires);
        }
    }

    fn send_delegation_drop(
        &self,
        handle: &GoalHandle,
        delegate: &AgentHandle,
        ctx: &mut TickCtx<'_>,
    ) {
        ctx.shared.queue.push(
            Event::to(
                EventBody::Drop {
                    goal: handle.name.clone(),
                    goal_id: handle.id,
                    mode: DropMode::Force,
                    reason: format!("Team {} revoked the delegation", ctx.handle.name),
                },
                member_address(delegate),
            )
            .from(ctx.address.clone()),
        );
    }

    /// Request a drop of the intention for `handle`. Always forces a
    /// replan.
    pub fn internal_drop(
        &mut self,
        handle: &GoalHandle,
        mode: DropMode,
        reason: &str,
        ctx: &mut TickCtx<'_>,
    ) -> bool {
        let found = match self.find_intention(handle) {
            Some(idx) => {
                self.intentions[idx].request_drop(mode, reason);
                tracing::debug!(agent = %ctx.handle, goal = %handle, "Goal drop");
                true
            }
            None => {
                tracing::debug!(
                    agent = %ctx.handle,
                    goal = %handle,
                    "Goal drop requested but no intention to drop"
                );
                false
            }
        };

        if let Some(delegate) = self.delegations.remove(handle) {
            self.send_delegation_drop(handle, &delegate, ctx);
        }

        self.schedule_valid = false;
        found
    }

    /// A delegation round-trip came back from a member.
    pub fn handle_delegation_event(
        &mut self,
        goal: &GoalHandle,
        status: DelegationStatus,
        ctx: &mut TickCtx<'_>,
    ) {
        let Some(idx) = self.find_intention(goal) else {
            return;
        };
        match status {
            DelegationStatus::Pending => {}
            DelegationStatus::Success => {
                self.intentions[idx].on_delegation_result(true, ctx);
                self.delegations.remove(goal);
            }
            DelegationStatus::Failed => {
                // The member could not do it; drop the intention and let
                // the next schedule re-auction the goal.
                self.intentions[idx].on_delegation_result(false, ctx);
                self.delegations.remove(goal);
            }
        }
    }

    /// An action completion matched against its issuing intention.
    pub fn on_action_task_complete(
        &mut self,
        intention_id: IntentionId,
        task_id: TaskId,
        success: bool,
        reply: Option<Message>,
        ctx: &mut TickCtx<'_>,
    ) -> bool {
        let Some(idx) = self.find_intention_by_id(intention_id) else {
            return false;
        };
        let locks = self.intentions[idx]
            .current_plan()
            .map(|plan| plan.resource_locks.clone())
            .unwrap_or_default();
        let matched = self.intentions[idx].on_task_complete(task_id, success, reply, ctx);
        if matched {
            // The dispatch held these for the duration of the action.
            ctx.beliefs.unlock_resources(&locks);
        }
        matched
    }

    /// The agent is stopping: desires without an intention die at once,
    /// the rest wind down through their executors.
    pub fn stop(
        &mut self,
        ctx: &mut TickCtx<'_>,
        desires: &mut Vec<Desire>,
        promises: &mut HashMap<UniqueId, GoalPromise>,
    ) {
        desires.retain(|desire| {
            let has_intention = self
                .intentions
                .iter()
                .any(|i| i.desire_handle == desire.handle);
            if !has_intention {
                if let Some(promise) = promises.remove(&desire.handle.id) {
                    promise.resolve(PromiseState::Failed("Stopping agent".to_string()));
                }
            }
            has_intention
        });

        for intention in &mut self.intentions {
            if intention.is_dropping() || intention.is_concluded() {
                continue;
            }
            let mode = intention
                .drop_request()
                .map(|req| req.mode)
                .unwrap_or(DropMode::Normal);
            intention.request_drop(mode, "Stopping agent");
        }

        let outstanding: Vec<(GoalHandle, AgentHandle)> = self.delegations.drain().collect();
        for (handle, delegate) in outstanding {
            self.send_delegation_drop(&handle, &delegate, ctx);
        }

        self.schedule_valid = false;
        self.dag.reset();
    }
}
