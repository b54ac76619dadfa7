use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::beliefs::BeliefContext;
use crate::id::{GoalHandle, IntentionId, TaskId, UniqueId};
use crate::message::Message;

/// Boolean query over a belief context.
pub type Predicate = Arc<dyn Fn(&BeliefContext) -> bool + Send + Sync>;

/// Cost estimate over a belief context. Lower is better; `FAILED_COST`
/// marks an impossible state.
pub type Heuristic = Arc<dyn Fn(&BeliefContext) -> f32 + Send + Sync>;

/// Outcome model applied to a cloned context during planning.
pub type Effects = Arc<dyn Fn(&mut BeliefContext) + Send + Sync>;

/// Whether a desire survives a successful intention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalPersistence {
    /// Achieved once, then removed from the agent.
    No,
    /// Never auto-dropped on success; replanned indefinitely.
    Yes,
}

impl GoalPersistence {
    pub fn is_persistent(&self) -> bool {
        matches!(self, GoalPersistence::Yes)
    }
}

/// Declarative goal template. Instances adopted by an agent become
/// [`Desire`]s.
#[derive(Clone)]
pub struct Goal {
    pub name: String,
    /// Schema of the goal's parameter message, if any.
    pub message_schema: Option<String>,
    pub pre: Option<Predicate>,
    pub satisfied: Option<Predicate>,
    pub drop_when: Option<Predicate>,
    pub heuristic: Option<Heuristic>,
    /// Persistent goals are never auto-dropped on success.
    pub persistent: bool,
    /// Delegated goals are only pursued by teams, via member auction.
    pub delegated: bool,
}

impl Goal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message_schema: None,
            pre: None,
            satisfied: None,
            drop_when: None,
            heuristic: None,
            persistent: false,
            delegated: false,
        }
    }

    pub fn valid(&self, ctx: &BeliefContext) -> bool {
        self.pre.as_ref().map(|p| p(ctx)).unwrap_or(true)
    }

    pub fn is_satisfied(&self, ctx: &BeliefContext) -> bool {
        self.satisfied.as_ref().map(|p| p(ctx)).unwrap_or(false)
    }

    pub fn should_drop(&self, ctx: &BeliefContext) -> bool {
        self.drop_when.as_ref().map(|p| p(ctx)).unwrap_or(false)
    }

    pub fn has_heuristic(&self) -> bool {
        self.heuristic.is_some()
    }

    /// Heuristic cost under `ctx`; 0 when the goal declares none.
    pub fn heuristic(&self, ctx: &BeliefContext) -> f32 {
        self.heuristic.as_ref().map(|h| h(ctx)).unwrap_or(0.0)
    }
}

impl fmt::Debug for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Goal")
            .field("name", &self.name)
            .field("message_schema", &self.message_schema)
            .field("persistent", &self.persistent)
            .field("delegated", &self.delegated)
            .field("has_heuristic", &self.has_heuristic())
            .finish()
    }
}

/// Per-plan attempt history used by the plan-selection policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanHistory {
    pub last_loop_iteration: u32,
    pub success_count: u32,
    pub fail_count: u32,
}

/// Plan-selection state carried by a desire and inherited down the
/// schedule's search tree.
#[derive(Debug, Clone, Default)]
pub struct PlanSelection {
    histories: HashMap<String, PlanHistory>,
    /// Cursor into a fixed plan list (Strict ordering).
    pub plan_list_index: usize,
    /// How many full passes over the plan set this goal has made.
    pub plan_loop_iteration: u32,
}

impl PlanSelection {
    pub fn find_history(&self, plan: &str) -> Option<&PlanHistory> {
        self.histories.get(plan)
    }

    pub fn find_or_make_history(&mut self, plan: &str) -> &mut PlanHistory {
        self.histories.entry(plan.to_string()).or_default()
    }

    pub fn record_attempt(&mut self, plan: &str) {
        let iteration = self.plan_loop_iteration;
        self.find_or_make_history(plan).last_loop_iteration = iteration;
    }
}

/// Linkage from a sub-goal desire back to the task that spawned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub intention_id: IntentionId,
    pub task_id: TaskId,
}

/// How a finished desire or intention ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishState {
    NotYet,
    Success,
    Failed,
    Dropped,
}

/// A goal instance an agent currently wants to achieve.
#[derive(Debug, Clone)]
pub struct Desire {
    pub handle: GoalHandle,
    pub goal: Arc<Goal>,
    /// Parameters the goal was pursued with.
    pub message: Option<Message>,
    pub persistence: GoalPersistence,
    pub plan_selection: PlanSelection,
    /// Set when this desire is a sub-goal of a running intention.
    pub parent: Option<ParentLink>,
    /// Set when this desire was delegated to us by a team.
    pub delegated_by: Option<crate::id::AgentHandle>,
    pub finished: FinishState,
}

impl Desire {
    pub fn new(goal: Arc<Goal>, id: Option<UniqueId>, message: Option<Message>) -> Self {
        let handle = match id {
            Some(id) => GoalHandle::with_id(goal.name.clone(), id),
            None => GoalHandle::new(goal.name.clone()),
        };
        let persistence = if goal.persistent {
            GoalPersistence::Yes
        } else {
            GoalPersistence::No
        };
        Self {
            handle,
            goal,
            message,
            persistence,
            plan_selection: PlanSelection::default(),
            parent: None,
            delegated_by: None,
            finished: FinishState::NotYet,
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence.is_persistent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goal_predicates_default_open() {
        let goal = Goal::new("G");
        let ctx = BeliefContext::new();
        assert!(goal.valid(&ctx));
        assert!(!goal.is_satisfied(&ctx));
        assert!(!goal.should_drop(&ctx));
        assert_eq!(goal.heuristic(&ctx), 0.0);
    }

    #[test]
    fn plan_selection_records_attempts_per_iteration() {
        let mut sel = PlanSelection::default();
        sel.plan_loop_iteration = 2;
        sel.record_attempt("PlanA");
        assert_eq!(sel.find_history("PlanA").unwrap().last_loop_iteration, 2);
        assert!(sel.find_history("PlanB").is_none());
    }
}
