//! One committed plan execution. The plan body runs as an index-driven
//! cursor stepped once per tick; async tasks (actions, sub-goals, sleeps)
//! suspend the coroutine until their completion event arrives.

use std::collections::HashMap;
use std::sync::Arc;

use volition_bus::{BdiLogLevel, BdiLogPayload, BdiLogResult, BdiLogType, DropMode};
use volition_core::{
    BeliefContext, FinishState, Goal, GoalHandle, GoalPersistence, IntentionId, Message,
    ParentLink, Plan, TaskId, TaskKind, UniqueId,
};

use crate::event::{ActionEvent, Event, EventBody};
use crate::executor::TickCtx;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropRequest {
    pub mode: DropMode,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    /// No plan queued; the next schedule decides what runs.
    WaitingForPlan,
    Running,
    /// Suspended on an async task or a delegation round-trip.
    Waiting,
    Succeeded,
    Failed,
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WaitReason {
    Action { task_idx: usize },
    Sleep { task_idx: usize },
    SubGoal { task_idx: usize, goal_id: UniqueId },
    /// All body tasks done, fire-and-forget sub-goals still running.
    AsyncSubGoals,
    Delegation,
    /// Explicit yield; resumes on the next tick.
    Yielded,
}

/// A cloned plan template plus the execution cursor through its body.
pub struct PlanCursor {
    pub plan: Arc<Plan>,
    cursor: usize,
    started: bool,
}

impl PlanCursor {
    fn new(plan: Arc<Plan>) -> Self {
        Self {
            plan,
            cursor: 0,
            started: false,
        }
    }
}

pub struct IntentionExecutor {
    pub id: IntentionId,
    pub desire_handle: GoalHandle,
    pub goal: Arc<Goal>,
    pub goal_msg: Option<Message>,
    pub persistence: GoalPersistence,
    /// True when the schedule assigned this goal to a team member rather
    /// than a local plan.
    pub delegated: bool,
    plan: Option<PlanCursor>,
    state: ExecState,
    finish: FinishState,
    drop_request: Option<DropRequest>,
    waiting: Option<WaitReason>,
    /// Per-intention belief scope; action replies land here first.
    scope: BeliefContext,
    /// Fire-and-forget sub-goals still outstanding, goal id to task id.
    async_subgoals: HashMap<UniqueId, TaskId>,
    /// Outcome of the most recently finished plan body, consumed by the
    /// agent for tactic bookkeeping.
    last_plan_result: Option<(String, bool)>,
}

impl IntentionExecutor {
    pub fn new(
        desire_handle: GoalHandle,
        goal: Arc<Goal>,
        goal_msg: Option<Message>,
        persistence: GoalPersistence,
        delegated: bool,
    ) -> Self {
        Self {
            id: IntentionId::new(),
            desire_handle,
            goal,
            goal_msg,
            persistence,
            delegated,
            plan: None,
            state: ExecState::WaitingForPlan,
            finish: FinishState::NotYet,
            drop_request: None,
            waiting: None,
            scope: BeliefContext::new(),
            async_subgoals: HashMap::new(),
            last_plan_result: None,
        }
    }

    /// The outcome of the plan body that just finished, at most once.
    pub fn take_plan_result(&mut self) -> Option<(String, bool)> {
        self.last_plan_result.take()
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn finish_state(&self) -> FinishState {
        self.finish
    }

    pub fn current_plan(&self) -> Option<&Arc<Plan>> {
        self.plan.as_ref().map(|p| &p.plan)
    }

    pub fn is_waiting(&self) -> bool {
        self.state == ExecState::Waiting
    }

    pub fn is_waiting_for_plan(&self) -> bool {
        self.state == ExecState::WaitingForPlan
    }

    pub fn is_concluded(&self) -> bool {
        matches!(
            self.state,
            ExecState::Succeeded | ExecState::Failed | ExecState::Dropped
        )
    }

    pub fn is_dropping(&self) -> bool {
        self.drop_request.is_some()
    }

    pub fn drop_request(&self) -> Option<&DropRequest> {
        self.drop_request.as_ref()
    }

    /// Queue a drop; the executor winds down on its next tick.
    pub fn request_drop(&mut self, mode: DropMode, reason: impl Into<String>) {
        if self.drop_request.is_none() {
            self.drop_request = Some(DropRequest {
                mode,
                reason: reason.into(),
            });
        }
    }

    /// A plan swap or wind-down while an action is in flight must give
    /// back the locks taken at dispatch; the completion that would have
    /// released them will no longer match.
    fn release_action_locks(&self, ctx: &mut TickCtx<'_>) {
        if matches!(self.waiting, Some(WaitReason::Action { .. })) {
            if let Some(plan) = self.current_plan() {
                ctx.beliefs.unlock_resources(&plan.resource_locks);
            }
        }
    }

    /// Install a fresh plan instance (cloned from the template by the
    /// agent executor). `None` puts the executor back to waiting-for-plan,
    /// which is also the resting state of delegated intentions.
    pub fn set_plan(&mut self, plan: Option<Arc<Plan>>, ctx: &mut TickCtx<'_>) {
        self.release_action_locks(ctx);
        self.waiting = None;
        self.scope.clear_action_replies();
        match plan {
            Some(plan) => {
                self.emit_log(
                    ctx,
                    BdiLogType::IntentionStarted,
                    BdiLogPayload::Intention {
                        goal: self.desire_handle.name.clone(),
                        goal_id: self.desire_handle.id.to_string(),
                        intention_id: self.id.to_string(),
                        plan: plan.name.clone(),
                        result: None,
                    },
                );
                self.plan = Some(PlanCursor::new(plan));
                self.state = ExecState::Running;
            }
            None => {
                self.plan = None;
                self.state = if self.delegated {
                    ExecState::Waiting
                } else {
                    ExecState::WaitingForPlan
                };
                if self.delegated {
                    self.waiting = Some(WaitReason::Delegation);
                }
            }
        }
    }

    /// Update the goal parameter overlay used for every evaluation inside
    /// this intention.
    pub fn set_goal_context(&mut self, goal_msg: Option<Message>) {
        self.goal_msg = goal_msg;
    }

    /// Evaluate under the intention's layered scope: goal parameters over
    /// action replies over agent beliefs.
    fn scoped<R>(&self, beliefs: &mut BeliefContext, f: impl FnOnce(&BeliefContext) -> R) -> R {
        beliefs.set_goal_context(self.goal_msg.clone());
        beliefs.set_action_replies(self.scope.action_replies().to_vec());
        let result = f(beliefs);
        beliefs.set_goal_context(None);
        beliefs.clear_action_replies();
        result
    }

    fn emit_log(&self, ctx: &TickCtx<'_>, log_type: BdiLogType, payload: BdiLogPayload) {
        ctx.shared.queue.push(
            Event::new(EventBody::BdiLog {
                level: BdiLogLevel::Normal,
                log_type,
                payload,
            })
            .from(ctx.address.clone()),
        );
    }

    /// Advance the coroutine one step. At most one async task dispatches
    /// per call; synchronous tasks chain within the tick.
    pub fn execute(&mut self, ctx: &mut TickCtx<'_>) {
        if self.is_concluded() {
            return;
        }

        if self.drop_request.is_some() {
            self.conclude_dropped(ctx);
            return;
        }

        if self.plan.is_none() {
            // Delegated intentions idle here until the delegation event
            // arrives; plain ones until the next schedule assigns a plan.
            return;
        }

        // Drop conditions outrank progress.
        let goal = self.goal.clone();
        let goal_drops = self.scoped(ctx.beliefs, |scope| goal.should_drop(scope));
        if goal_drops {
            self.request_drop(DropMode::Normal, "Goal drop condition became true");
            self.conclude_dropped(ctx);
            return;
        }
        let plan = self.plan.as_ref().map(|p| p.plan.clone());
        if let Some(plan) = plan {
            let plan_drops = self.scoped(ctx.beliefs, |scope| plan.should_drop(scope));
            if plan_drops {
                self.finish_plan(ctx, false);
                return;
            }
        }

        match self.waiting {
            Some(WaitReason::Yielded) => {
                self.waiting = None;
                self.state = ExecState::Running;
            }
            Some(_) => return,
            None => {}
        }

        self.step(ctx);
    }

    fn step(&mut self, ctx: &mut TickCtx<'_>) {
        loop {
            let (cursor, plan, started) = {
                let Some(cursor_state) = self.plan.as_ref() else {
                    return;
                };
                (
                    cursor_state.cursor,
                    cursor_state.plan.clone(),
                    cursor_state.started,
                )
            };
            if !started {
                if let Some(cursor_state) = self.plan.as_mut() {
                    cursor_state.started = true;
                }
            }

            if cursor >= plan.body.steps.len() {
                if self.async_subgoals.is_empty() {
                    self.finish_plan(ctx, true);
                } else {
                    self.state = ExecState::Waiting;
                    self.waiting = Some(WaitReason::AsyncSubGoals);
                }
                return;
            }

            let step = plan.body.steps[cursor].clone();
            match step.kind {
                TaskKind::Label { .. } => {
                    self.advance_cursor(cursor + 1);
                }
                TaskKind::Print { text } => {
                    tracing::info!(agent = %ctx.handle, intention = %self.id, "{text}");
                    self.advance_cursor(cursor + 1);
                }
                TaskKind::Yield => {
                    self.advance_cursor(cursor + 1);
                    self.state = ExecState::Waiting;
                    self.waiting = Some(WaitReason::Yielded);
                    return;
                }
                TaskKind::DropGoal { name } => {
                    ctx.shared.queue.push(
                        Event::to(
                            EventBody::Drop {
                                goal: name,
                                goal_id: UniqueId::nil(),
                                mode: DropMode::Normal,
                                reason: format!("Dropped by plan '{}'", plan.name),
                            },
                            ctx.address.clone(),
                        )
                        .from(ctx.address.clone()),
                    );
                    self.advance_cursor(cursor + 1);
                }
                TaskKind::Cond { pred } => {
                    let success = self.scoped(ctx.beliefs, |scope| pred(scope));
                    self.emit_log(
                        ctx,
                        BdiLogType::Condition,
                        BdiLogPayload::Condition {
                            goal: self.desire_handle.name.clone(),
                            goal_id: self.desire_handle.id.to_string(),
                            intention_id: self.id.to_string(),
                            plan: plan.name.clone(),
                            task_id: step.id.to_string(),
                            condition: String::new(),
                            success,
                        },
                    );
                    if success {
                        self.advance_cursor(cursor + 1);
                    } else if let Some(label) = step.on_fail {
                        match plan.body.label_index(label) {
                            Some(index) => self.advance_cursor(index),
                            None => {
                                tracing::warn!(plan = %plan.name, label, "Missing onFail label");
                                self.finish_plan(ctx, false);
                                return;
                            }
                        }
                    } else {
                        self.finish_plan(ctx, false);
                        return;
                    }
                }
                TaskKind::Sleep { ms } => {
                    ctx.shared.queue.push(Event::new(EventBody::TimerRequest {
                        fire_at_ms: ctx.now_ms + ms,
                        agent: ctx.address.clone(),
                        intention_id: self.id,
                        task_id: step.id,
                    }));
                    self.emit_log(
                        ctx,
                        BdiLogType::SleepStarted,
                        BdiLogPayload::Sleep {
                            goal: self.desire_handle.name.clone(),
                            goal_id: self.desire_handle.id.to_string(),
                            intention_id: self.id.to_string(),
                            plan: plan.name.clone(),
                            task_id: step.id.to_string(),
                            sleep_ms: ms,
                        },
                    );
                    self.state = ExecState::Waiting;
                    self.waiting = Some(WaitReason::Sleep { task_idx: cursor });
                    return;
                }
                TaskKind::Action { name, params } => {
                    let request = self.build_request(ctx, &name, params.as_ref());
                    // The plan's locks stay held while the action is in
                    // flight; released on completion.
                    ctx.beliefs.lock_resources(&plan.resource_locks);
                    ctx.shared.queue.push(
                        Event::new(EventBody::Action(ActionEvent {
                            name: name.clone(),
                            request,
                            goal: self.desire_handle.clone(),
                            plan: plan.name.clone(),
                            intention_id: self.id,
                            task_id: step.id,
                            resource_locks: plan.resource_locks.clone(),
                            remote_requester: None,
                        }))
                        .from(ctx.address.clone()),
                    );
                    self.emit_log(
                        ctx,
                        BdiLogType::ActionStarted,
                        BdiLogPayload::Action {
                            goal: self.desire_handle.name.clone(),
                            goal_id: self.desire_handle.id.to_string(),
                            intention_id: self.id.to_string(),
                            plan: plan.name.clone(),
                            task_id: step.id.to_string(),
                            action: name,
                            success: false,
                        },
                    );
                    self.state = ExecState::Waiting;
                    self.waiting = Some(WaitReason::Action { task_idx: cursor });
                    return;
                }
                TaskKind::Goal { name, params } => {
                    let goal_id = UniqueId::random();
                    ctx.shared.queue.push(
                        Event::to(
                            EventBody::Pursue {
                                goal: name.clone(),
                                persistence: GoalPersistence::No,
                                message: params.clone(),
                                goal_id: Some(goal_id),
                                parent: Some(ParentLink {
                                    intention_id: self.id,
                                    task_id: step.id,
                                }),
                                delegated_by: None,
                            },
                            ctx.address.clone(),
                        )
                        .from(ctx.address.clone()),
                    );
                    if step.nowait {
                        self.async_subgoals.insert(goal_id, step.id);
                        self.advance_cursor(cursor + 1);
                    } else {
                        self.state = ExecState::Waiting;
                        self.waiting = Some(WaitReason::SubGoal {
                            task_idx: cursor,
                            goal_id,
                        });
                        return;
                    }
                }
            }
        }
    }

    /// Merge the request message for an action: schema defaults, then
    /// fields resolved from the intention scope, then literal parameters.
    fn build_request(
        &self,
        ctx: &mut TickCtx<'_>,
        action: &str,
        params: Option<&Message>,
    ) -> Message {
        let schema = {
            let registries = ctx.shared.registries.read();
            registries
                .actions
                .get(action)
                .and_then(|def| def.request_schema.clone())
                .and_then(|name| registries.schemas.get(&name).cloned())
        };

        let mut request = match schema {
            Some(schema) => {
                let mut msg = schema.instantiate();
                for field in &schema.fields {
                    if params.map(|p| p.contains(&field.name)).unwrap_or(false) {
                        continue;
                    }
                    let resolved =
                        self.scoped(ctx.beliefs, |scope| scope.get_value(&field.name));
                    if let Some(value) = resolved {
                        if value.matches(&field.kind) {
                            msg.set_value(field.name.clone(), value);
                        }
                    }
                }
                msg
            }
            None => Message::new(format!("{action} Request")),
        };
        if let Some(params) = params {
            request.merge(params);
        }
        request
    }

    fn advance_cursor(&mut self, to: usize) {
        if let Some(cursor) = self.plan.as_mut() {
            cursor.cursor = to;
        }
        self.state = ExecState::Running;
        self.waiting = None;
    }

    /// Resolution of an async action or sleep task.
    pub fn on_task_complete(
        &mut self,
        task_id: TaskId,
        success: bool,
        reply: Option<Message>,
        ctx: &mut TickCtx<'_>,
    ) -> bool {
        let Some(plan_cursor) = self.plan.as_ref() else {
            return false;
        };
        let plan = plan_cursor.plan.clone();
        let task_idx = match &self.waiting {
            Some(WaitReason::Action { task_idx }) | Some(WaitReason::Sleep { task_idx }) => {
                *task_idx
            }
            _ => return false,
        };
        let step = &plan.body.steps[task_idx];
        if step.id != task_id {
            return false;
        }

        let sleeping = matches!(self.waiting, Some(WaitReason::Sleep { .. }));
        if sleeping {
            self.emit_log(
                ctx,
                BdiLogType::SleepFinished,
                BdiLogPayload::Sleep {
                    goal: self.desire_handle.name.clone(),
                    goal_id: self.desire_handle.id.to_string(),
                    intention_id: self.id.to_string(),
                    plan: plan.name.clone(),
                    task_id: task_id.to_string(),
                    sleep_ms: 0,
                },
            );
        } else {
            self.emit_log(
                ctx,
                BdiLogType::ActionFinished,
                BdiLogPayload::Action {
                    goal: self.desire_handle.name.clone(),
                    goal_id: self.desire_handle.id.to_string(),
                    intention_id: self.id.to_string(),
                    plan: plan.name.clone(),
                    task_id: task_id.to_string(),
                    action: String::new(),
                    success,
                },
            );
        }

        if let Some(reply) = reply {
            self.scope.add_action_reply(reply);
        }

        self.resolve_step(&plan, task_idx, success, ctx);
        true
    }

    /// Resolution of a sub-goal this intention spawned.
    pub fn on_subgoal_finished(
        &mut self,
        goal_id: UniqueId,
        success: bool,
        ctx: &mut TickCtx<'_>,
    ) -> bool {
        if let Some(WaitReason::SubGoal {
            task_idx,
            goal_id: waiting_id,
        }) = self.waiting.clone()
        {
            if waiting_id == goal_id {
                let Some(plan) = self.plan.as_ref().map(|p| p.plan.clone()) else {
                    return false;
                };
                self.resolve_step(&plan, task_idx, success, ctx);
                return true;
            }
        }

        if self.async_subgoals.remove(&goal_id).is_some() {
            // A failed fire-and-forget sub-goal fails the plan once the
            // body winds down; a successful one may be the last thing the
            // plan was waiting on.
            if !success {
                self.finish_plan(ctx, false);
            } else if matches!(self.waiting, Some(WaitReason::AsyncSubGoals))
                && self.async_subgoals.is_empty()
            {
                self.finish_plan(ctx, true);
            }
            return true;
        }
        false
    }

    /// The team's delegation round-trip resolved this intention.
    pub fn on_delegation_result(&mut self, success: bool, ctx: &mut TickCtx<'_>) {
        if success {
            self.finish(ctx, FinishState::Success);
        } else {
            let mode = self
                .drop_request
                .as_ref()
                .map(|req| req.mode)
                .unwrap_or(DropMode::Normal);
            self.request_drop(mode, "Team delegation to member failed");
            self.conclude_dropped(ctx);
        }
    }

    fn resolve_step(&mut self, plan: &Arc<Plan>, task_idx: usize, success: bool, ctx: &mut TickCtx<'_>) {
        let step = &plan.body.steps[task_idx];
        if success {
            match step.on_success.and_then(|label| plan.body.label_index(label)) {
                Some(index) => self.advance_cursor(index),
                None => self.advance_cursor(task_idx + 1),
            }
        } else if let Some(index) = step.on_fail.and_then(|label| plan.body.label_index(label)) {
            self.advance_cursor(index);
        } else {
            self.finish_plan(ctx, false);
        }
    }

    fn finish_plan(&mut self, ctx: &mut TickCtx<'_>, success: bool) {
        let plan_name = self
            .current_plan()
            .map(|p| p.name.clone())
            .unwrap_or_default();
        self.emit_log(
            ctx,
            BdiLogType::IntentionFinished,
            BdiLogPayload::Intention {
                goal: self.desire_handle.name.clone(),
                goal_id: self.desire_handle.id.to_string(),
                intention_id: self.id.to_string(),
                plan: plan_name.clone(),
                result: Some(if success {
                    BdiLogResult::Success
                } else {
                    BdiLogResult::Failed
                }),
            },
        );
        self.last_plan_result = Some((plan_name, success));
        self.release_action_locks(ctx);
        if success {
            self.finish(ctx, FinishState::Success);
        } else {
            // A failed plan does not end the intention: the tactic decides
            // whether another plan gets a turn, so hand control back to the
            // scheduler.
            self.plan = None;
            self.waiting = None;
            self.scope.clear_action_replies();
            self.state = ExecState::WaitingForPlan;
        }
    }

    fn finish(&mut self, _ctx: &mut TickCtx<'_>, state: FinishState) {
        self.finish = state;
        self.state = match state {
            FinishState::Success => ExecState::Succeeded,
            FinishState::Dropped => ExecState::Dropped,
            _ => ExecState::Failed,
        };
        self.waiting = None;
    }

    fn conclude_dropped(&mut self, ctx: &mut TickCtx<'_>) {
        self.release_action_locks(ctx);
        // Cancel anything the body left in flight.
        let outstanding: Vec<UniqueId> = self
            .async_subgoals
            .keys()
            .copied()
            .chain(
                match &self.waiting {
                    Some(WaitReason::SubGoal { goal_id, .. }) => Some(*goal_id),
                    _ => None,
                }
                .into_iter(),
            )
            .collect();
        for goal_id in outstanding {
            ctx.shared.queue.push(
                Event::to(
                    EventBody::Drop {
                        goal: String::new(),
                        goal_id,
                        mode: DropMode::Force,
                        reason: "Parent intention dropped".to_string(),
                    },
                    ctx.address.clone(),
                )
                .from(ctx.address.clone()),
            );
        }
        self.async_subgoals.clear();

        if self.plan.is_some() {
            let reason = self
                .drop_request
                .as_ref()
                .map(|req| req.reason.clone())
                .unwrap_or_default();
            tracing::debug!(
                agent = %ctx.handle,
                goal = %self.desire_handle,
                reason = %reason,
                "Intention dropped"
            );
            let plan_name = self
                .current_plan()
                .map(|p| p.name.clone())
                .unwrap_or_default();
            self.emit_log(
                ctx,
                BdiLogType::IntentionFinished,
                BdiLogPayload::Intention {
                    goal: self.desire_handle.name.clone(),
                    goal_id: self.desire_handle.id.to_string(),
                    intention_id: self.id.to_string(),
                    plan: plan_name,
                    result: Some(BdiLogResult::Dropped),
                },
            );
        }
        self.finish(ctx, FinishState::Dropped);
    }
}
