//! The per-agent planner: an A*-style search over `(goal, plan-or-delegate)`
//! expansions with effect modelling, plan-selection policies, resource
//! deconfliction and (for teams) an auction over member bids.
//!
//! The search tree lives in an arena indexed by [`SearchNodeId`]; belief
//! contexts live in a parallel arena so nodes can share a context until
//! effects force a clone.

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use volition_core::{
    AgentHandle, BeliefContext, Goal, GoalHandle, Message, Plan, PlanOrder, PlanSelection, Tactic,
};

/// Sentinel cost marking an impossible state. Additions saturate here.
pub const FAILED_COST: f32 = f32::MAX;

/// Runaway-search backstop; a schedule ending here is reported, not fatal.
const MAX_SEARCH_NODES: usize = 4096;

fn saturating_add(lhs: f32, rhs: f32) -> f32 {
    (lhs + rhs).min(FAILED_COST)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SearchNodeId(u32);

impl SearchNodeId {
    pub const ROOT: SearchNodeId = SearchNodeId(0);

    fn index(self) -> usize {
        self.0 as usize
    }
}

/// What a search node commits the agent to for its goal.
#[derive(Clone)]
pub enum Decision {
    Plan(Arc<Plan>),
    Delegate(AgentHandle),
    /// Delegated goal with no delegate currently available; kept in the
    /// space in case one appears on a later schedule.
    Null,
}

impl Decision {
    pub fn is_delegation(&self) -> bool {
        matches!(self, Decision::Delegate(_) | Decision::Null)
    }

    pub fn plan(&self) -> Option<&Arc<Plan>> {
        match self {
            Decision::Plan(plan) => Some(plan),
            _ => None,
        }
    }

    pub fn delegate(&self) -> Option<&AgentHandle> {
        match self {
            Decision::Delegate(agent) => Some(agent),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Plan(plan) => write!(f, "Plan({})", plan.name),
            Decision::Delegate(agent) => write!(f, "Delegate({})", agent.name),
            Decision::Null => write!(f, "Null"),
        }
    }
}

/// Why a search node was moved to the failure list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleFailure {
    PlanInvalid,
    ServiceUnavailable,
    HeuristicFailed,
    ResourceViolation,
    AuctionBidTimeout,
}

impl std::fmt::Display for ScheduleFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScheduleFailure::PlanInvalid => "PLAN_INVALID",
            ScheduleFailure::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ScheduleFailure::HeuristicFailed => "HEURISTIC_FAILED",
            ScheduleFailure::ResourceViolation => "RESOURCE_VIOLATION",
            ScheduleFailure::AuctionBidTimeout => "AUCTION_BID_TIMEOUT",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Open,
    Closed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Expand,
    Auction,
    PendingCost,
    Cost,
    Deconflict,
    End,
}

/// Per-goal candidate info computed once per node under the selection
/// policy.
#[derive(Clone, Default)]
struct GoalPlanInfo {
    plans: Vec<Arc<Plan>>,
    plan_selection: PlanSelection,
}

#[derive(Clone)]
struct GoalListItem {
    goal_idx: usize,
    info: GoalPlanInfo,
}

/// The goals a node may expand: those that can be chained (delegated or
/// effect-modelling) and the effect-less remainder sorted by heuristic.
#[derive(Clone, Default)]
struct GoalList {
    expandable: Vec<GoalListItem>,
    effectless: Vec<GoalListItem>,
}

struct SearchNode {
    parent: Option<SearchNodeId>,
    goal_idx: Option<usize>,
    decision: Decision,
    /// Index into the context arena. Shared with the parent until effects
    /// clone it.
    ctx: usize,
    ctx_cloned: bool,
    goals_remaining: Vec<usize>,
    valid: Vec<bool>,
    plan_selection: PlanSelection,
    goal_list: GoalList,
    cost_of_node: f32,
    cost_from_start: f32,
    estimate_to_end: f32,
    cost_total: f32,
    state: NodeState,
    failure: Option<ScheduleFailure>,
}

/// Ordering for the open frontier: lowest total cost first, insertion
/// order breaking ties.
struct OpenEntry {
    cost_total: f32,
    seq: u64,
    node: SearchNodeId,
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}
impl Eq for OpenEntry {}
impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed so the max-heap pops the cheapest, oldest entry.
        other
            .cost_total
            .total_cmp(&self.cost_total)
            .then(other.seq.cmp(&self.seq))
    }
}

/// One root goal handed to the planner.
pub struct PlannerGoalInput {
    pub handle: GoalHandle,
    pub goal: Arc<Goal>,
    pub message: Option<Message>,
    pub plan_selection: PlanSelection,
    pub tactic: Arc<Tactic>,
    /// Candidate plans in tactic order; empty for delegated goals.
    pub plans: Vec<Arc<Plan>>,
    /// Eligible team members; empty for non-delegated goals.
    pub delegates: Vec<AgentHandle>,
}

pub struct PlannerGoal {
    pub input: PlannerGoalInput,
    /// True when at least one real expansion (plan child or delegate)
    /// existed for this goal somewhere in the search space.
    pub can_be_planned: bool,
}

/// Everything the planner needs, snapshotted from the agent at schedule
/// construction.
pub struct ScheduleInputs {
    pub id: u64,
    pub agent: AgentHandle,
    pub context: BeliefContext,
    pub goals: Vec<PlannerGoalInput>,
    /// Per plan name: `None` when the agent or an attached service handles
    /// every action the plan references, else a human-readable reason.
    pub plan_support: HashMap<String, Option<String>>,
    pub auction_deadline_ms: Option<u64>,
}

/// Auction probe the owning team must send to a member.
#[derive(Debug, Clone)]
pub struct AuctionProbe {
    pub delegate: AgentHandle,
    pub goal: GoalHandle,
    pub message: Option<Message>,
    pub schedule_id: u64,
}

/// One link of the chosen best-intention chain, in execution order.
#[derive(Clone)]
pub struct BestIntention {
    pub goal_idx: usize,
    pub goal_handle: GoalHandle,
    pub goal: Arc<Goal>,
    pub goal_msg: Option<Message>,
    pub decision: Decision,
    pub plan_selection: PlanSelection,
}

pub struct Schedule {
    id: u64,
    agent: AgentHandle,
    state: ScheduleState,
    nodes: Vec<SearchNode>,
    contexts: Vec<BeliefContext>,
    open: BinaryHeap<OpenEntry>,
    pending: Vec<SearchNodeId>,
    failures: Vec<SearchNodeId>,
    goals: Vec<PlannerGoal>,
    plan_support: HashMap<String, Option<String>>,
    best_delegation: Vec<Option<(AgentHandle, f32)>>,
    delegation_cost_cache: HashMap<(GoalHandle, AgentHandle), f32>,
    pending_auctions: usize,
    auction_deadline_ms: Option<u64>,
    open_seq: u64,
}

impl Schedule {
    /// Build the schedule: set up the root, expand it once and auction out
    /// delegated goals. The returned probes must be dispatched to members
    /// by the caller; the schedule stays in `PendingCost` until every bid
    /// arrives (or the deadline passes).
    pub fn new(inputs: ScheduleInputs) -> (Self, Vec<AuctionProbe>) {
        let goal_count = inputs.goals.len();
        let root = SearchNode {
            parent: None,
            goal_idx: None,
            decision: Decision::Null,
            ctx: 0,
            ctx_cloned: true,
            goals_remaining: (0..goal_count).collect(),
            valid: vec![false; goal_count],
            plan_selection: PlanSelection::default(),
            goal_list: GoalList::default(),
            cost_of_node: 0.0,
            cost_from_start: 0.0,
            estimate_to_end: 0.0,
            cost_total: 0.0,
            state: NodeState::Open,
            failure: None,
        };

        let mut schedule = Self {
            id: inputs.id,
            agent: inputs.agent,
            state: ScheduleState::Expand,
            nodes: vec![root],
            contexts: vec![inputs.context],
            open: BinaryHeap::new(),
            pending: Vec::new(),
            failures: Vec::new(),
            goals: inputs
                .goals
                .into_iter()
                .map(|input| PlannerGoal {
                    input,
                    can_be_planned: false,
                })
                .collect(),
            plan_support: inputs.plan_support,
            best_delegation: vec![None; goal_count],
            delegation_cost_cache: HashMap::new(),
            pending_auctions: 0,
            auction_deadline_ms: inputs.auction_deadline_ms,
            open_seq: 0,
        };

        let root_list = schedule.make_goal_list(SearchNodeId::ROOT);
        schedule.nodes[0].goal_list = root_list;
        schedule.push_open(SearchNodeId::ROOT);

        schedule.expand();
        let probes = schedule.auction();
        (schedule, probes)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ScheduleState {
        self.state
    }

    pub fn done(&self) -> bool {
        self.state == ScheduleState::End
    }

    pub fn pending_auctions(&self) -> usize {
        self.pending_auctions
    }

    pub fn planner_goals(&self) -> &[PlannerGoal] {
        &self.goals
    }

    /// Advance the state machine until it blocks on pending auction bids
    /// or reaches the end.
    pub fn tick(&mut self, now_ms: u64) {
        loop {
            match self.state {
                ScheduleState::End => return,
                ScheduleState::Auction => unreachable!("auction runs in the constructor"),
                ScheduleState::PendingCost => {
                    if self.pending_auctions == 0 {
                        self.finalize_auction();
                    } else if self
                        .auction_deadline_ms
                        .map(|deadline| now_ms >= deadline)
                        .unwrap_or(false)
                    {
                        tracing::warn!(
                            agent = %self.agent,
                            outstanding = self.pending_auctions,
                            schedule = self.id,
                            "Auction deadline passed with outstanding bids"
                        );
                        self.pending_auctions = 0;
                        self.finalize_auction();
                    } else {
                        return;
                    }
                }
                ScheduleState::Cost => self.cost(),
                ScheduleState::Deconflict => self.deconflict(),
                ScheduleState::Expand => self.expand(),
            }
        }
    }

    /// Record a member's bid. Duplicate bids for the same `(goal, bidder)`
    /// pair are ignored with a warning; first bid wins score ties.
    pub fn process_auction(&mut self, goal: &GoalHandle, bidder: AgentHandle, score: f32) {
        let key = (goal.clone(), bidder.clone());
        if self.delegation_cost_cache.contains_key(&key) {
            tracing::warn!(goal = %goal, bidder = %bidder, "Duplicate auction bid");
            return;
        }
        self.delegation_cost_cache.insert(key, score);

        if let Some(goal_idx) = self
            .goals
            .iter()
            .position(|g| g.input.handle == *goal)
        {
            let best = &mut self.best_delegation[goal_idx];
            let better = match best {
                Some((_, cost)) => *cost > score,
                None => true,
            };
            if better && score != FAILED_COST {
                *best = Some((bidder, score));
            }
        }

        self.pending_auctions = self.pending_auctions.saturating_sub(1);
    }

    /// The best chain of intentions, one per plannable goal, in execution
    /// order (root-most decision first).
    pub fn best_intentions(&self) -> Vec<BestIntention> {
        let mut allocated: HashMap<usize, bool> = HashMap::new();
        for (goal_idx, goal) in self.goals.iter().enumerate() {
            if goal.can_be_planned {
                allocated.insert(goal_idx, false);
            }
        }

        // Walk from the best open node up to the root, then emit in
        // reverse so the first decision made is the first intention.
        let mut chain = Vec::new();
        let mut walker = self.open.peek().map(|entry| entry.node);
        while let Some(id) = walker {
            let node = &self.nodes[id.index()];
            if node.parent.is_some() {
                chain.push(id);
            }
            walker = node.parent;
        }

        let mut result = Vec::new();
        for id in chain.into_iter().rev() {
            let node = &self.nodes[id.index()];
            let Some(goal_idx) = node.goal_idx else {
                continue;
            };
            match allocated.get_mut(&goal_idx) {
                Some(taken) if !*taken => *taken = true,
                _ => continue,
            }
            let goal = &self.goals[goal_idx].input;
            result.push(BestIntention {
                goal_idx,
                goal_handle: goal.handle.clone(),
                goal: goal.goal.clone(),
                goal_msg: goal.message.clone(),
                decision: node.decision.clone(),
                plan_selection: node.plan_selection.clone(),
            });
        }
        result
    }

    pub fn best_cost(&self) -> f32 {
        self.open
            .peek()
            .map(|entry| entry.cost_total)
            .unwrap_or(FAILED_COST)
    }

    /// Human-readable summary of why the goal's candidates failed, for
    /// drop reasons.
    pub fn failure_summary(&self, goal_idx: usize) -> String {
        let goal = &self.goals[goal_idx].input;
        let mut lines = vec![format!(
            "No executable allocation for goal {} under tactic '{}' (plan order {}, loop count {}):",
            goal.handle,
            goal.tactic.name,
            goal.tactic.plan_order,
            if goal.tactic.loops_forever() {
                "infinite".to_string()
            } else {
                goal.tactic.loop_plans_count.to_string()
            },
        )];
        let mut had_nodes = false;
        for id in &self.failures {
            let node = &self.nodes[id.index()];
            if node.goal_idx != Some(goal_idx) {
                continue;
            }
            had_nodes = true;
            let what = match &node.decision {
                Decision::Plan(plan) => plan.name.clone(),
                Decision::Delegate(agent) => format!("delegate {}", agent.name),
                Decision::Null => "no delegate".to_string(),
            };
            let failure = node
                .failure
                .map(|f| f.to_string())
                .unwrap_or_else(|| "UNKNOWN".to_string());
            lines.push(format!("  {what}: {failure}"));
        }
        if !had_nodes {
            lines.push("  no plans were candidates (tactic exhausted or none committed)".into());
        }
        lines.join("\n")
    }

    fn push_open(&mut self, id: SearchNodeId) {
        let cost_total = self.nodes[id.index()].cost_total;
        let seq = self.open_seq;
        self.open_seq += 1;
        self.open.push(OpenEntry {
            cost_total,
            seq,
            node: id,
        });
    }

    /// Evaluate `f` against the node's context with the goal's parameter
    /// message and the planning agent overlaid.
    fn with_goal_scope<R>(
        contexts: &mut [BeliefContext],
        ctx_idx: usize,
        agent: &AgentHandle,
        goal_msg: Option<&Message>,
        f: impl FnOnce(&mut BeliefContext) -> R,
    ) -> R {
        let ctx = &mut contexts[ctx_idx];
        let saved = ctx.goal_context().cloned();
        ctx.set_goal_context(goal_msg.cloned());
        ctx.set_agent_context(agent.clone());
        let result = f(ctx);
        ctx.set_goal_context(saved);
        result
    }

    /// Inherit the most recent plan-selection state for `goal_idx` from
    /// the search space (nearest ancestor deciding the same goal), falling
    /// back to the root desire, then filter candidate plans per policy.
    fn compute_goal_plan_info(&self, parent: SearchNodeId, goal_idx: usize) -> GoalPlanInfo {
        let goal = &self.goals[goal_idx].input;
        let tactic = &goal.tactic;

        let mut selection;
        if parent == SearchNodeId::ROOT {
            selection = goal.plan_selection.clone();
        } else {
            let mut ancestor = Some(parent);
            while let Some(id) = ancestor {
                if id == SearchNodeId::ROOT {
                    break;
                }
                if self.nodes[id.index()].goal_idx == Some(goal_idx) {
                    break;
                }
                ancestor = self.nodes[id.index()].parent;
            }
            match ancestor {
                Some(id) if id != SearchNodeId::ROOT => {
                    selection = self.nodes[id.index()].plan_selection.clone();
                    if tactic.uses_plan_list
                        && tactic.plan_order == PlanOrder::Strict
                        && !tactic.plans.is_empty()
                    {
                        selection.plan_list_index =
                            (selection.plan_list_index + 1) % tactic.plans.len();
                    }
                }
                _ => selection = goal.plan_selection.clone(),
            }
        }

        let mut info = GoalPlanInfo {
            plans: Vec::new(),
            plan_selection: selection,
        };

        if !tactic.loops_forever()
            && info.plan_selection.plan_loop_iteration >= tactic.loop_plans_count
        {
            return info;
        }

        if tactic.uses_plan_list && tactic.plan_order == PlanOrder::Strict {
            if !tactic.plans.is_empty() {
                let next = &tactic.plans[info.plan_selection.plan_list_index % tactic.plans.len()];
                if let Some(plan) = goal.plans.iter().find(|p| p.name == *next) {
                    info.plans.push(plan.clone());
                }
            }
        } else if tactic.plan_order == PlanOrder::ExcludePlanAfterAttempt {
            let iteration = info.plan_selection.plan_loop_iteration;
            let mut filtered: Vec<Arc<Plan>> = goal
                .plans
                .iter()
                .filter(|plan| {
                    match info.plan_selection.find_history(&plan.name) {
                        // Plans untouched this round are still candidates.
                        Some(history) => history.last_loop_iteration < iteration,
                        None => true,
                    }
                })
                .cloned()
                .collect();
            if filtered.is_empty() && iteration < tactic.loop_plans_count {
                info.plan_selection.plan_loop_iteration += 1;
                filtered = goal.plans.clone();
            }
            info.plans = filtered;
        } else {
            info.plans = goal.plans.clone();
        }

        info
    }

    /// Partition the node's remaining goals into expandable (delegated or
    /// effect-modelling) and effect-less, re-evaluating goal preconditions
    /// when the context changed.
    fn make_goal_list(&mut self, id: SearchNodeId) -> GoalList {
        let node_idx = id.index();
        let goals_remaining = self.nodes[node_idx].goals_remaining.clone();
        let ctx_idx = self.nodes[node_idx].ctx;
        let evaluate_pre =
            self.nodes[node_idx].parent.is_none() || self.nodes[node_idx].ctx_cloned;
        let agent = self.agent.clone();

        let mut list = GoalList::default();
        let mut effectless: Vec<(GoalListItem, f32)> = Vec::new();

        for goal_idx in goals_remaining {
            let goal = self.goals[goal_idx].input.goal.clone();
            let goal_msg = self.goals[goal_idx].input.message.clone();

            if !goal.delegated {
                if evaluate_pre {
                    let valid = Self::with_goal_scope(
                        &mut self.contexts,
                        ctx_idx,
                        &agent,
                        goal_msg.as_ref(),
                        |ctx| goal.valid(ctx),
                    );
                    self.nodes[node_idx].valid[goal_idx] = valid;
                }
                if !self.nodes[node_idx].valid[goal_idx] {
                    continue;
                }
            }

            let info = self.compute_goal_plan_info(id, goal_idx);
            let has_plan_with_effects = info.plans.iter().any(|p| p.can_model_effect());

            if goal.delegated || has_plan_with_effects {
                list.expandable.push(GoalListItem { goal_idx, info });
            } else {
                let cost = Self::with_goal_scope(
                    &mut self.contexts,
                    ctx_idx,
                    &agent,
                    goal_msg.as_ref(),
                    |ctx| goal.heuristic(ctx),
                );
                effectless.push((GoalListItem { goal_idx, info }, cost));
            }
        }

        effectless.sort_by(|a, b| a.1.total_cmp(&b.1));
        list.effectless = effectless.into_iter().map(|(item, _)| item).collect();
        list
    }

    /// Expand the best open node's candidate goals into child nodes.
    fn expand(&mut self) {
        if self.state != ScheduleState::Expand {
            return;
        }

        let Some(node_id) = self.open.peek().map(|entry| entry.node) else {
            self.state = ScheduleState::End;
            return;
        };

        if self.nodes.len() >= MAX_SEARCH_NODES {
            tracing::warn!(
                agent = %self.agent,
                nodes = self.nodes.len(),
                schedule = self.id,
                "Search space hit the node cap, ending schedule"
            );
            self.state = ScheduleState::End;
            return;
        }

        debug_assert!(self.pending.is_empty());

        let goal_list = self.nodes[node_id.index()].goal_list.clone();
        let expandable = goal_list.expandable;
        let effectless = goal_list.effectless;

        for item in &expandable {
            self.deliberate_goal(node_id, item);
        }
        // Only the first effect-less goal that actually contributes joins
        // the space; their ordering cannot matter, so one at a time keeps
        // the search small.
        for item in &effectless {
            let before = self.pending.len();
            self.deliberate_goal(node_id, item);
            if self.pending.len() > before {
                break;
            }
        }

        if self.pending.is_empty() {
            self.state = ScheduleState::End;
        } else {
            self.state = ScheduleState::Cost;
            self.nodes[node_id.index()].state = NodeState::Closed;
            self.open.pop();
        }
    }

    /// Expand one goal under `parent` unless it is already satisfied in
    /// the node's modelled context.
    fn deliberate_goal(&mut self, parent: SearchNodeId, item: &GoalListItem) {
        let goal = self.goals[item.goal_idx].input.goal.clone();
        let goal_msg = self.goals[item.goal_idx].input.message.clone();
        let ctx_idx = self.nodes[parent.index()].ctx;
        let agent = self.agent.clone();

        let satisfied = Self::with_goal_scope(
            &mut self.contexts,
            ctx_idx,
            &agent,
            goal_msg.as_ref(),
            |ctx| goal.is_satisfied(ctx),
        );
        if !goal.delegated && satisfied {
            return;
        }

        let children = self.expand_goal_to_plans(parent, item);
        self.pending.extend(children);
    }

    /// Create one child per viable plan (agents) or per eligible delegate
    /// (teams). Non-viable plans go straight to the failure list.
    fn expand_goal_to_plans(
        &mut self,
        parent: SearchNodeId,
        item: &GoalListItem,
    ) -> Vec<SearchNodeId> {
        let goal_idx = item.goal_idx;
        let goal = self.goals[goal_idx].input.goal.clone();
        let goal_msg = self.goals[goal_idx].input.message.clone();
        let agent = self.agent.clone();

        let mut result = Vec::new();
        let mut failures: Vec<(Decision, ScheduleFailure)> = Vec::new();
        let mut has_delegates = false;

        if goal.delegated {
            let delegates = self.goals[goal_idx].input.delegates.clone();
            has_delegates = !delegates.is_empty();
            if delegates.is_empty() {
                result.push(self.alloc_child(parent, goal_idx, Decision::Null, &item.info));
            }
            for delegate in delegates {
                result.push(self.alloc_child(
                    parent,
                    goal_idx,
                    Decision::Delegate(delegate),
                    &item.info,
                ));
            }
        } else {
            let parent_ctx = self.nodes[parent.index()].ctx;
            for plan in &item.info.plans {
                let pre_ok = Self::with_goal_scope(
                    &mut self.contexts,
                    parent_ctx,
                    &agent,
                    goal_msg.as_ref(),
                    |ctx| plan.valid(ctx),
                );
                let support = self
                    .plan_support
                    .get(&plan.name)
                    .cloned()
                    .unwrap_or(None);

                if !pre_ok {
                    failures.push((Decision::Plan(plan.clone()), ScheduleFailure::PlanInvalid));
                } else if let Some(reason) = support {
                    tracing::debug!(
                        agent = %agent,
                        plan = %plan.name,
                        reason = %reason,
                        "Plan unsupported by attached services"
                    );
                    failures.push((
                        Decision::Plan(plan.clone()),
                        ScheduleFailure::ServiceUnavailable,
                    ));
                } else {
                    result.push(self.alloc_child(
                        parent,
                        goal_idx,
                        Decision::Plan(plan.clone()),
                        &item.info,
                    ));
                }
            }
        }

        for (decision, failure) in failures {
            let id = self.alloc_child(parent, goal_idx, decision, &item.info);
            self.nodes[id.index()].state = NodeState::Failed;
            self.nodes[id.index()].failure = Some(failure);
            self.failures.push(id);
        }

        if !result.is_empty() || has_delegates {
            self.goals[goal_idx].can_be_planned = true;
        }
        result
    }

    /// Allocate a child node inheriting context, validity and remaining
    /// goals from its parent.
    fn alloc_child(
        &mut self,
        parent: SearchNodeId,
        goal_idx: usize,
        decision: Decision,
        info: &GoalPlanInfo,
    ) -> SearchNodeId {
        let parent_node = &self.nodes[parent.index()];
        let ctx = parent_node.ctx;
        let valid = parent_node.valid.clone();
        let mut goals_remaining = parent_node.goals_remaining.clone();
        let parent_ctx_cloned = parent_node.ctx_cloned;
        let parent_goal_list = parent_node.goal_list.clone();

        let goal = &self.goals[goal_idx].input.goal;
        // A goal leaves the remaining set when it cannot be re-attempted
        // down this branch: delegated, one-shot, or chosen through a plan
        // that cannot model its outcome.
        let plan_unmodelled = decision
            .plan()
            .map(|p| !p.can_model_effect())
            .unwrap_or(false);
        let mut goals_remaining_changed = false;
        if goal.delegated || !goal.persistent || plan_unmodelled {
            if let Ok(pos) = goals_remaining.binary_search(&goal_idx) {
                goals_remaining.remove(pos);
                goals_remaining_changed = true;
            }
        }

        let id = SearchNodeId(self.nodes.len() as u32);
        self.nodes.push(SearchNode {
            parent: Some(parent),
            goal_idx: Some(goal_idx),
            decision,
            ctx,
            ctx_cloned: false,
            goals_remaining,
            valid,
            plan_selection: info.plan_selection.clone(),
            goal_list: GoalList::default(),
            cost_of_node: 0.0,
            cost_from_start: 0.0,
            estimate_to_end: 0.0,
            cost_total: 0.0,
            state: NodeState::Pending,
            failure: None,
        });

        if parent_ctx_cloned {
            // The parent context mutated; memoized goal lists are invalid
            // down this branch and must be rebuilt.
            let list = self.make_goal_list(id);
            self.nodes[id.index()].goal_list = list;
        } else {
            let mut list = parent_goal_list;
            if goals_remaining_changed {
                list.expandable.retain(|item| item.goal_idx != goal_idx);
                list.effectless.retain(|item| item.goal_idx != goal_idx);
            }
            self.nodes[id.index()].goal_list = list;
        }
        id
    }

    /// Emit auction probes for every delegated root goal with delegates.
    fn auction(&mut self) -> Vec<AuctionProbe> {
        let mut probes = Vec::new();
        for goal in &self.goals {
            if !goal.input.goal.delegated {
                continue;
            }
            for delegate in &goal.input.delegates {
                probes.push(AuctionProbe {
                    delegate: delegate.clone(),
                    goal: goal.input.handle.clone(),
                    message: goal.input.message.clone(),
                    schedule_id: self.id,
                });
            }
        }
        self.pending_auctions = probes.len();
        self.state = ScheduleState::PendingCost;
        if self.pending_auctions == 0 {
            self.finalize_auction();
        }
        probes
    }

    fn finalize_auction(&mut self) {
        self.state = ScheduleState::Cost;
        let remaining = self.nodes[0].goals_remaining.clone();
        let estimate = self.estimate_cost_from(None, 0, &remaining);
        self.nodes[0].cost_total = estimate;
        self.nodes[0].estimate_to_end = estimate;
    }

    /// Admissible estimate for completing `goals_remaining` from the given
    /// context, excluding `curr_goal_idx` (costed on its own node).
    fn estimate_cost_from(
        &mut self,
        curr_goal_idx: Option<usize>,
        ctx_idx: usize,
        goals_remaining: &[usize],
    ) -> f32 {
        let agent = self.agent.clone();
        let mut estimate = 0.0f32;
        let mut delegated_remaining: Vec<usize> = Vec::new();

        for &goal_idx in goals_remaining {
            if Some(goal_idx) == curr_goal_idx {
                continue;
            }
            if self.best_delegation[goal_idx].is_some() {
                delegated_remaining.push(goal_idx);
                continue;
            }

            // Heuristic-less goals charge a flat 1.0 so chaining down the
            // current branch always beats hopping to a sibling when no
            // heuristic can discriminate (biases the search to DFS).
            let goal = self.goals[goal_idx].input.goal.clone();
            let goal_msg = self.goals[goal_idx].input.message.clone();
            let cost = if !goal.delegated && goal.has_heuristic() {
                Self::with_goal_scope(
                    &mut self.contexts,
                    ctx_idx,
                    &agent,
                    goal_msg.as_ref(),
                    |ctx| goal.heuristic(ctx),
                )
            } else {
                1.0
            };
            estimate = saturating_add(estimate, cost);
        }

        // Delegated goals: greedily assign the globally-cheapest
        // (delegate, goal) pair, never letting one member serve two goals.
        let mut pool = delegated_remaining;
        while !pool.is_empty() {
            let mut best: Option<(usize, AgentHandle, f32)> = None;
            for &goal_idx in &pool {
                let Some((delegate, cost)) = self.best_delegation[goal_idx].clone() else {
                    continue;
                };
                if cost == FAILED_COST {
                    continue;
                }
                let better = match &best {
                    Some((_, _, best_cost)) => *best_cost > cost,
                    None => true,
                };
                if better {
                    best = Some((goal_idx, delegate, cost));
                }
            }
            let Some((goal_idx, _delegate, cost)) = best else {
                break;
            };
            estimate = saturating_add(estimate, cost);
            pool.retain(|&g| g != goal_idx);
        }
        estimate = saturating_add(estimate, pool.len() as f32);
        estimate
    }

    /// Cost every pending child: model effects on a cloned context, charge
    /// the goal heuristic (or the cached bid for delegations), then add
    /// the estimate to the end.
    fn cost(&mut self) {
        if self.state != ScheduleState::Cost {
            return;
        }

        let agent = self.agent.clone();
        let pending = std::mem::take(&mut self.pending);
        let mut survivors = Vec::with_capacity(pending.len());

        for id in pending {
            let node_idx = id.index();
            let goal_idx = self.nodes[node_idx].goal_idx.expect("children carry a goal");
            let goal = self.goals[goal_idx].input.goal.clone();
            let goal_handle = self.goals[goal_idx].input.handle.clone();
            let goal_msg = self.goals[goal_idx].input.message.clone();

            let mut auction_bid_missing = false;
            match self.nodes[node_idx].decision.clone() {
                Decision::Delegate(delegate) => {
                    let key = (goal_handle.clone(), delegate.clone());
                    match self.delegation_cost_cache.get(&key) {
                        Some(score) => self.nodes[node_idx].cost_of_node = *score,
                        None => {
                            tracing::error!(
                                agent = %agent,
                                goal = %goal_handle,
                                delegate = %delegate,
                                schedule = self.id,
                                "Auction bid never arrived, marking allocation impossible"
                            );
                            self.nodes[node_idx].cost_of_node = FAILED_COST;
                            auction_bid_missing = true;
                        }
                    }
                }
                Decision::Null => {
                    self.nodes[node_idx].cost_of_node = 1.0;
                }
                Decision::Plan(plan) => {
                    if plan.can_model_effect() {
                        let mut cloned = self.contexts[self.nodes[node_idx].ctx].clone();
                        Self::with_goal_scope_value(
                            &mut cloned,
                            &agent,
                            goal_msg.as_ref(),
                            |ctx| plan.apply_effects(ctx),
                        );
                        self.contexts.push(cloned);
                        self.nodes[node_idx].ctx = self.contexts.len() - 1;
                        self.nodes[node_idx].ctx_cloned = true;
                    }

                    let ctx_idx = self.nodes[node_idx].ctx;
                    let cost = Self::with_goal_scope(
                        &mut self.contexts,
                        ctx_idx,
                        &agent,
                        goal_msg.as_ref(),
                        |ctx| goal.heuristic(ctx),
                    );
                    self.nodes[node_idx].cost_of_node = cost;

                    let iteration = self.nodes[node_idx].plan_selection.plan_loop_iteration;
                    let history = self.nodes[node_idx]
                        .plan_selection
                        .find_or_make_history(&plan.name);
                    history.last_loop_iteration = iteration;
                    if cost == FAILED_COST {
                        history.fail_count += 1;
                    } else {
                        history.success_count += 1;
                    }
                }
            }

            if self.nodes[node_idx].cost_of_node == FAILED_COST {
                let failure = if auction_bid_missing {
                    ScheduleFailure::AuctionBidTimeout
                } else {
                    ScheduleFailure::HeuristicFailed
                };
                self.nodes[node_idx].state = NodeState::Failed;
                self.nodes[node_idx].failure = Some(failure);
                self.failures.push(id);
                continue;
            }

            let ctx_idx = self.nodes[node_idx].ctx;
            let goals_remaining = self.nodes[node_idx].goals_remaining.clone();
            let estimate = self.estimate_cost_from(Some(goal_idx), ctx_idx, &goals_remaining);
            let parent = self.nodes[node_idx].parent.expect("children have parents");
            let parent_cost = self.nodes[parent.index()].cost_from_start;

            let node = &mut self.nodes[node_idx];
            node.estimate_to_end = estimate;
            node.cost_from_start = saturating_add(parent_cost, node.cost_of_node);
            node.cost_total = saturating_add(node.cost_from_start, node.estimate_to_end);
            debug_assert!(node.cost_of_node >= 0.0);
            debug_assert!(node.estimate_to_end >= 0.0);
            debug_assert!(node.cost_total >= node.cost_from_start || node.cost_total == FAILED_COST);
            survivors.push(id);
        }

        self.pending = survivors;
        self.state = ScheduleState::Deconflict;
    }

    fn with_goal_scope_value(
        ctx: &mut BeliefContext,
        agent: &AgentHandle,
        goal_msg: Option<&Message>,
        f: impl FnOnce(&mut BeliefContext),
    ) {
        let saved = ctx.goal_context().cloned();
        ctx.set_goal_context(goal_msg.cloned());
        ctx.set_agent_context(agent.clone());
        f(ctx);
        ctx.set_goal_context(saved);
    }

    /// Fail nodes whose modelled context violates a resource; open the
    /// rest.
    fn deconflict(&mut self) {
        if self.state != ScheduleState::Deconflict {
            return;
        }

        let pending = std::mem::take(&mut self.pending);
        let mut violated = Vec::new();
        for id in pending {
            let ctx_idx = self.nodes[id.index()].ctx;
            if self.contexts[ctx_idx].has_resource_violation(&mut violated) {
                tracing::debug!(
                    agent = %self.agent,
                    resources = ?violated,
                    "Search node trimmed for resource violation"
                );
                self.nodes[id.index()].state = NodeState::Failed;
                self.nodes[id.index()].failure = Some(ScheduleFailure::ResourceViolation);
                self.failures.push(id);
            } else {
                self.nodes[id.index()].state = NodeState::Open;
                self.push_open(id);
            }
        }
        self.state = ScheduleState::Expand;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volition_core::{CoroutineBuilder, GoalBuilder, PlanBuilder, TacticBuilder};

    fn input_for(
        goal: Goal,
        plans: Vec<Plan>,
        tactic: Tactic,
        selection: PlanSelection,
    ) -> PlannerGoalInput {
        PlannerGoalInput {
            handle: GoalHandle::new(goal.name.clone()),
            goal: Arc::new(goal),
            message: None,
            plan_selection: selection,
            tactic: Arc::new(tactic),
            plans: plans.into_iter().map(Arc::new).collect(),
            delegates: Vec::new(),
        }
    }

    fn schedule_for(goals: Vec<PlannerGoalInput>, ctx: BeliefContext) -> Schedule {
        let support = goals
            .iter()
            .flat_map(|g| g.plans.iter())
            .map(|p| (p.name.clone(), None))
            .collect();
        let (mut schedule, probes) = Schedule::new(ScheduleInputs {
            id: 1,
            agent: AgentHandle::new("planner"),
            context: ctx,
            goals,
            plan_support: support,
            auction_deadline_ms: None,
        });
        assert!(probes.is_empty());
        schedule.tick(0);
        schedule
    }

    fn counter_goal(target: u32) -> Goal {
        GoalBuilder::new("Count")
            .persistent()
            .satisfied(move |ctx| ctx.get::<u32>("count").unwrap_or(0) >= target)
            .heuristic(move |ctx| {
                let count = ctx.get::<u32>("count").unwrap_or(0);
                target.saturating_sub(count) as f32
            })
            .build()
    }

    fn increment_plan(name: &str, by: u32) -> Plan {
        PlanBuilder::new(name)
            .handles("Count")
            .effects(move |ctx| {
                let count = ctx.get::<u32>("count").unwrap_or(0);
                ctx.set_fact("Counter", "count", count + by);
            })
            .body(CoroutineBuilder::new().action("Increment").build())
            .build()
    }

    fn ctx_with_count(count: u32) -> BeliefContext {
        let mut ctx = BeliefContext::new();
        ctx.set_fact("Counter", "count", count);
        ctx
    }

    #[test]
    fn effect_modelling_chains_to_satisfaction() {
        let tactic = TacticBuilder::new("T")
            .goal("Count")
            .loop_plans_infinitely()
            .build();
        let schedule = schedule_for(
            vec![input_for(
                counter_goal(3),
                vec![increment_plan("inc", 1)],
                tactic,
                PlanSelection::default(),
            )],
            ctx_with_count(0),
        );
        assert!(schedule.done());
        let best = schedule.best_intentions();
        // One intention allocation per root goal; the chain behind it
        // models three increments.
        assert_eq!(best.len(), 1);
        assert!(schedule.planner_goals()[0].can_be_planned);
        assert_eq!(best[0].decision.plan().unwrap().name, "inc");
    }

    #[test]
    fn cheapest_plan_wins() {
        let tactic = TacticBuilder::new("T")
            .goal("Count")
            .loop_plans_infinitely()
            .build();
        let schedule = schedule_for(
            vec![input_for(
                counter_goal(3),
                vec![increment_plan("small", 1), increment_plan("big", 3)],
                tactic,
                PlanSelection::default(),
            )],
            ctx_with_count(0),
        );
        assert!(schedule.done());
        let best = schedule.best_intentions();
        assert_eq!(best[0].decision.plan().unwrap().name, "big");
        assert_eq!(schedule.best_cost(), 0.0);
    }

    #[test]
    fn failed_precondition_lands_in_failure_list() {
        let goal = GoalBuilder::new("Count")
            .heuristic(|_| 1.0)
            .build();
        let plan = PlanBuilder::new("blocked")
            .handles("Count")
            .pre(|_| false)
            .effects(|_| {})
            .body(CoroutineBuilder::new().action("Noop").build())
            .build();
        let tactic = TacticBuilder::new("T").goal("Count").build();
        let schedule = schedule_for(
            vec![input_for(goal, vec![plan], tactic, PlanSelection::default())],
            BeliefContext::new(),
        );
        assert!(schedule.done());
        assert!(!schedule.planner_goals()[0].can_be_planned);
        let summary = schedule.failure_summary(0);
        assert!(summary.contains("PLAN_INVALID"), "{summary}");
    }

    #[test]
    fn strict_plan_list_offers_the_cursor_plan_only() {
        let goal = GoalBuilder::new("G").build();
        let plans: Vec<Plan> = ["first", "second", "third"]
            .iter()
            .map(|name| {
                PlanBuilder::new(*name)
                    .handles("G")
                    .body(CoroutineBuilder::new().action("Act").build())
                    .build()
            })
            .collect();
        let tactic = TacticBuilder::new("T")
            .goal("G")
            .plans(["first", "second", "third"])
            .plan_order(PlanOrder::Strict)
            .loop_plans_count(1)
            .build();

        let mut selection = PlanSelection::default();
        selection.plan_list_index = 1;
        let schedule = schedule_for(
            vec![input_for(goal, plans, tactic, selection)],
            BeliefContext::new(),
        );
        let best = schedule.best_intentions();
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].decision.plan().unwrap().name, "second");
    }

    #[test]
    fn exhausted_loop_count_stops_planning() {
        let goal = GoalBuilder::new("G").build();
        let plan = PlanBuilder::new("only")
            .handles("G")
            .body(CoroutineBuilder::new().action("Act").build())
            .build();
        let tactic = TacticBuilder::new("T")
            .goal("G")
            .loop_plans_count(1)
            .build();
        let mut selection = PlanSelection::default();
        selection.plan_loop_iteration = 1;
        let schedule = schedule_for(
            vec![input_for(goal, vec![plan], tactic, selection)],
            BeliefContext::new(),
        );
        assert!(schedule.done());
        assert!(!schedule.planner_goals()[0].can_be_planned);
    }

    #[test]
    fn auction_waits_for_bids_then_costs_them() {
        let goal = GoalBuilder::new("TeamGoal").delegated().build();
        let member_a = AgentHandle::new("a");
        let member_b = AgentHandle::new("b");
        let mut input = input_for(
            goal,
            Vec::new(),
            TacticBuilder::new("T").goal("TeamGoal").build(),
            PlanSelection::default(),
        );
        input.delegates = vec![member_a.clone(), member_b.clone()];
        let handle = input.handle.clone();

        let (mut schedule, probes) = Schedule::new(ScheduleInputs {
            id: 7,
            agent: AgentHandle::new("team"),
            context: BeliefContext::new(),
            goals: vec![input],
            plan_support: HashMap::new(),
            auction_deadline_ms: None,
        });
        assert_eq!(probes.len(), 2);
        assert_eq!(schedule.state(), ScheduleState::PendingCost);

        schedule.tick(0);
        assert_eq!(schedule.state(), ScheduleState::PendingCost, "bids outstanding");

        schedule.process_auction(&handle, member_a.clone(), 5.0);
        schedule.process_auction(&handle, member_b.clone(), 2.0);
        schedule.tick(0);
        assert!(schedule.done());

        let best = schedule.best_intentions();
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].decision.delegate().unwrap(), &member_b);
    }

    #[test]
    fn missing_bid_times_out_as_failure() {
        let goal = GoalBuilder::new("TeamGoal").delegated().build();
        let member = AgentHandle::new("silent");
        let mut input = input_for(
            goal,
            Vec::new(),
            TacticBuilder::new("T").goal("TeamGoal").build(),
            PlanSelection::default(),
        );
        input.delegates = vec![member];

        let (mut schedule, probes) = Schedule::new(ScheduleInputs {
            id: 8,
            agent: AgentHandle::new("team"),
            context: BeliefContext::new(),
            goals: vec![input],
            plan_support: HashMap::new(),
            auction_deadline_ms: Some(100),
        });
        assert_eq!(probes.len(), 1);

        schedule.tick(50);
        assert_eq!(schedule.state(), ScheduleState::PendingCost);
        schedule.tick(150);
        assert!(schedule.done());
        assert_eq!(schedule.best_intentions().len(), 0);
        assert!(schedule.failure_summary(0).contains("AUCTION_BID_TIMEOUT"));
    }

    #[test]
    fn resource_violation_trims_nodes() {
        let goal = GoalBuilder::new("Count").heuristic(|_| 1.0).build();
        let plan = PlanBuilder::new("hog")
            .handles("Count")
            .effects(|ctx| {
                // Drain the resource past its minimum.
                ctx.lock_resources(&["Battery".to_string(), "Battery".to_string()]);
            })
            .body(CoroutineBuilder::new().action("Drain").build())
            .build();
        let tactic = TacticBuilder::new("T").goal("Count").build();

        let mut ctx = BeliefContext::new();
        ctx.add_resource(volition_core::Resource::new("Battery", 0, 1));
        let schedule = schedule_for(
            vec![input_for(goal, vec![plan], tactic, PlanSelection::default())],
            ctx,
        );
        assert!(schedule.done());
        assert!(schedule.failure_summary(0).contains("RESOURCE_VIOLATION"));
    }

    #[test]
    fn costs_never_decrease_along_a_path() {
        let tactic = TacticBuilder::new("T")
            .goal("Count")
            .loop_plans_infinitely()
            .build();
        let schedule = schedule_for(
            vec![input_for(
                counter_goal(4),
                vec![increment_plan("inc", 1), increment_plan("inc2", 2)],
                tactic,
                PlanSelection::default(),
            )],
            ctx_with_count(0),
        );
        for node in &schedule.nodes {
            if node.state == NodeState::Failed {
                continue;
            }
            assert!(node.cost_from_start >= 0.0);
            assert!(node.estimate_to_end >= 0.0);
            assert!(node.cost_total >= node.cost_from_start);
        }
    }
}
