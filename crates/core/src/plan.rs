use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::beliefs::BeliefContext;
use crate::goal::{Effects, Predicate};
use crate::id::TaskId;
use crate::message::Message;

/// One step of a plan body. Bodies are interpreted as an index-driven
/// cursor, advanced once per executor tick.
#[derive(Clone)]
pub enum TaskKind {
    /// Dispatch a named action and wait for its completion.
    Action {
        name: String,
        /// Literal parameters merged into the request message.
        params: Option<Message>,
    },
    /// Pursue a sub-goal on the owning agent and wait for its promise.
    Goal {
        name: String,
        params: Option<Message>,
    },
    /// Suspend for the given duration.
    Sleep { ms: u64 },
    /// Evaluate a predicate; fall through on true, jump to the `on_fail`
    /// label on false.
    Cond { pred: Predicate },
    /// Jump target.
    Label { id: u32 },
    /// Debug print, resolves synchronously.
    Print { text: String },
    /// Yield the coroutine until the next tick.
    Yield,
    /// Request a drop of the named goal on the owning agent.
    DropGoal { name: String },
}

impl fmt::Debug for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Action { name, .. } => write!(f, "Action({name})"),
            TaskKind::Goal { name, .. } => write!(f, "Goal({name})"),
            TaskKind::Sleep { ms } => write!(f, "Sleep({ms}ms)"),
            TaskKind::Cond { .. } => write!(f, "Cond"),
            TaskKind::Label { id } => write!(f, "Label({id})"),
            TaskKind::Print { text } => write!(f, "Print({text:?})"),
            TaskKind::Yield => write!(f, "Yield"),
            TaskKind::DropGoal { name } => write!(f, "DropGoal({name})"),
        }
    }
}

/// A task with its stable id and control-flow modifiers.
#[derive(Debug, Clone)]
pub struct TaskStep {
    pub id: TaskId,
    pub kind: TaskKind,
    /// Fire-and-forget: the coroutine continues immediately; plan
    /// completion still waits for the spawned work.
    pub nowait: bool,
    /// Label to jump to when this task succeeds (loop construct).
    pub on_success: Option<u32>,
    /// Label to jump to when this task fails. Without it, failure fails
    /// the plan.
    pub on_fail: Option<u32>,
}

impl TaskStep {
    pub fn new(kind: TaskKind) -> Self {
        Self {
            id: TaskId::new(),
            kind,
            nowait: false,
            on_success: None,
            on_fail: None,
        }
    }
}

/// An immutable plan body: the task array plus the label positions.
#[derive(Debug, Clone, Default)]
pub struct PlanBody {
    pub steps: Vec<TaskStep>,
    labels: HashMap<u32, usize>,
}

impl PlanBody {
    pub fn new(steps: Vec<TaskStep>) -> Self {
        let mut labels = HashMap::new();
        for (index, step) in steps.iter().enumerate() {
            if let TaskKind::Label { id } = step.kind {
                labels.insert(id, index);
            }
        }
        Self { steps, labels }
    }

    pub fn label_index(&self, label: u32) -> Option<usize> {
        self.labels.get(&label).copied()
    }

    /// Every action name this body references.
    pub fn action_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().filter_map(|step| match &step.kind {
            TaskKind::Action { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }

    /// Every sub-goal name this body references.
    pub fn goal_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().filter_map(|step| match &step.kind {
            TaskKind::Goal { name, .. } => Some(name.as_str()),
            _ => None,
        })
    }
}

/// Declarative plan template: how to achieve one goal.
#[derive(Clone)]
pub struct Plan {
    pub name: String,
    /// The goal this plan handles.
    pub goal_name: String,
    pub pre: Option<Predicate>,
    pub drop_when: Option<Predicate>,
    /// Outcome model; plans without one cannot be chained by the planner.
    pub effects: Option<Effects>,
    pub resource_locks: Vec<String>,
    pub body: Arc<PlanBody>,
}

impl Plan {
    pub fn new(name: impl Into<String>, goal_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            goal_name: goal_name.into(),
            pre: None,
            drop_when: None,
            effects: None,
            resource_locks: Vec::new(),
            body: Arc::new(PlanBody::default()),
        }
    }

    pub fn valid(&self, ctx: &BeliefContext) -> bool {
        self.pre.as_ref().map(|p| p(ctx)).unwrap_or(true)
    }

    pub fn should_drop(&self, ctx: &BeliefContext) -> bool {
        self.drop_when.as_ref().map(|p| p(ctx)).unwrap_or(false)
    }

    pub fn can_model_effect(&self) -> bool {
        self.effects.is_some()
    }

    pub fn apply_effects(&self, ctx: &mut BeliefContext) {
        if let Some(effects) = &self.effects {
            effects(ctx);
        }
    }
}

impl fmt::Debug for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plan")
            .field("name", &self.name)
            .field("goal", &self.goal_name)
            .field("tasks", &self.body.steps.len())
            .field("locks", &self.resource_locks)
            .field("models_effects", &self.can_model_effect())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::CoroutineBuilder;

    #[test]
    fn body_indexes_labels_and_actions() {
        let body = CoroutineBuilder::new()
            .label(1)
            .action("Move")
            .action("Record")
            .build();
        assert_eq!(body.label_index(1), Some(0));
        assert_eq!(body.label_index(2), None);
        let actions: Vec<_> = body.action_names().collect();
        assert_eq!(actions, vec!["Move", "Record"]);
    }

    #[test]
    fn plan_without_effects_cannot_model() {
        let plan = Plan::new("P", "G");
        assert!(!plan.can_model_effect());
        assert!(plan.valid(&BeliefContext::new()));
    }
}
