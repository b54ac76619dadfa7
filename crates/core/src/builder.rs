//! Consuming builders producing the immutable template structs the engine
//! commits. This is the authoring surface; semantics live on the template
//! types themselves.

use std::sync::Arc;

use crate::action::ActionDef;
use crate::beliefs::{BeliefContext, Resource};
use crate::field::FieldType;
use crate::goal::Goal;
use crate::message::{Message, MessageSchema, SchemaField};
use crate::plan::{Plan, PlanBody, TaskKind, TaskStep};
use crate::role::{BeliefSetAccess, Role};
use crate::tactic::{PlanOrder, Tactic, LOOP_PLANS_INFINITELY};

pub struct MessageSchemaBuilder {
    schema: MessageSchema,
}

impl MessageSchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: MessageSchema::new(name),
        }
    }

    pub fn field<T: FieldType + Default>(mut self, name: impl Into<String>) -> Self {
        self.schema.fields.push(SchemaField {
            name: name.into(),
            kind: T::default().into_value().kind(),
            default: None,
        });
        self
    }

    pub fn field_with_value<T: FieldType>(mut self, name: impl Into<String>, value: T) -> Self {
        let value = value.into_value();
        self.schema.fields.push(SchemaField {
            name: name.into(),
            kind: value.kind(),
            default: Some(value),
        });
        self
    }

    pub fn build(self) -> MessageSchema {
        self.schema
    }
}

pub struct GoalBuilder {
    goal: Goal,
}

impl GoalBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            goal: Goal::new(name),
        }
    }

    pub fn message(mut self, schema: impl Into<String>) -> Self {
        self.goal.message_schema = Some(schema.into());
        self
    }

    pub fn pre(mut self, pred: impl Fn(&BeliefContext) -> bool + Send + Sync + 'static) -> Self {
        self.goal.pre = Some(Arc::new(pred));
        self
    }

    pub fn satisfied(
        mut self,
        pred: impl Fn(&BeliefContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.goal.satisfied = Some(Arc::new(pred));
        self
    }

    pub fn drop_when(
        mut self,
        pred: impl Fn(&BeliefContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.goal.drop_when = Some(Arc::new(pred));
        self
    }

    pub fn heuristic(
        mut self,
        heuristic: impl Fn(&BeliefContext) -> f32 + Send + Sync + 'static,
    ) -> Self {
        self.goal.heuristic = Some(Arc::new(heuristic));
        self
    }

    pub fn persistent(mut self) -> Self {
        self.goal.persistent = true;
        self
    }

    /// Only teams may pursue this goal, via member delegation.
    pub fn delegated(mut self) -> Self {
        self.goal.delegated = true;
        self
    }

    pub fn build(self) -> Goal {
        self.goal
    }
}

/// Builds a plan body as a flat task array with label-based control flow.
/// `nowait`, `on_success` and `on_fail` modify the most recently added
/// task.
#[derive(Default)]
pub struct CoroutineBuilder {
    steps: Vec<TaskStep>,
}

impl CoroutineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, kind: TaskKind) -> Self {
        self.steps.push(TaskStep::new(kind));
        self
    }

    pub fn action(self, name: impl Into<String>) -> Self {
        self.push(TaskKind::Action {
            name: name.into(),
            params: None,
        })
    }

    /// Set a literal parameter on the most recent action or goal task.
    pub fn param<T: FieldType>(mut self, name: impl Into<String>, value: T) -> Self {
        if let Some(step) = self.steps.last_mut() {
            match &mut step.kind {
                TaskKind::Action { params, .. } | TaskKind::Goal { params, .. } => {
                    params
                        .get_or_insert_with(|| Message::new("params"))
                        .set(name, value);
                }
                _ => tracing::warn!("param() on a task that takes no parameters"),
            }
        }
        self
    }

    pub fn goal(self, name: impl Into<String>) -> Self {
        self.push(TaskKind::Goal {
            name: name.into(),
            params: None,
        })
    }

    pub fn sleep(self, ms: u64) -> Self {
        self.push(TaskKind::Sleep { ms })
    }

    pub fn cond(self, pred: impl Fn(&BeliefContext) -> bool + Send + Sync + 'static) -> Self {
        self.push(TaskKind::Cond {
            pred: Arc::new(pred),
        })
    }

    pub fn label(self, id: u32) -> Self {
        self.push(TaskKind::Label { id })
    }

    pub fn print(self, text: impl Into<String>) -> Self {
        self.push(TaskKind::Print { text: text.into() })
    }

    pub fn yield_(self) -> Self {
        self.push(TaskKind::Yield)
    }

    pub fn drop_goal(self, name: impl Into<String>) -> Self {
        self.push(TaskKind::DropGoal { name: name.into() })
    }

    /// Make the most recent async task fire-and-forget.
    pub fn nowait(mut self) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.nowait = true;
        }
        self
    }

    /// Jump to `label` when the most recent task succeeds.
    pub fn on_success(mut self, label: u32) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.on_success = Some(label);
        }
        self
    }

    /// Jump to `label` when the most recent task fails.
    pub fn on_fail(mut self, label: u32) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.on_fail = Some(label);
        }
        self
    }

    pub fn build(self) -> PlanBody {
        PlanBody::new(self.steps)
    }
}

pub struct PlanBuilder {
    plan: Plan,
}

impl PlanBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            plan: Plan::new(name, String::new()),
        }
    }

    pub fn handles(mut self, goal: impl Into<String>) -> Self {
        self.plan.goal_name = goal.into();
        self
    }

    pub fn pre(mut self, pred: impl Fn(&BeliefContext) -> bool + Send + Sync + 'static) -> Self {
        self.plan.pre = Some(Arc::new(pred));
        self
    }

    pub fn drop_when(
        mut self,
        pred: impl Fn(&BeliefContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.plan.drop_when = Some(Arc::new(pred));
        self
    }

    pub fn effects(mut self, effects: impl Fn(&mut BeliefContext) + Send + Sync + 'static) -> Self {
        self.plan.effects = Some(Arc::new(effects));
        self
    }

    pub fn lock(mut self, resource: impl Into<String>) -> Self {
        self.plan.resource_locks.push(resource.into());
        self
    }

    pub fn body(mut self, body: PlanBody) -> Self {
        self.plan.body = Arc::new(body);
        self
    }

    pub fn build(self) -> Plan {
        self.plan
    }
}

pub struct TacticBuilder {
    tactic: Tactic,
}

impl TacticBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            tactic: Tactic::new(name, String::new()),
        }
    }

    pub fn goal(mut self, goal: impl Into<String>) -> Self {
        self.tactic.goal_name = goal.into();
        self
    }

    pub fn plan(mut self, plan: impl Into<String>) -> Self {
        self.tactic.plans.push(plan.into());
        self.tactic.uses_plan_list = true;
        self
    }

    pub fn plans<I, S>(mut self, plans: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tactic.plans.extend(plans.into_iter().map(Into::into));
        self.tactic.uses_plan_list = true;
        self
    }

    pub fn plan_order(mut self, order: PlanOrder) -> Self {
        self.tactic.plan_order = order;
        self
    }

    pub fn loop_plans_count(mut self, count: u32) -> Self {
        self.tactic.loop_plans_count = count;
        self
    }

    pub fn loop_plans_infinitely(mut self) -> Self {
        self.tactic.loop_plans_count = LOOP_PLANS_INFINITELY;
        self
    }

    pub fn build(mut self) -> Tactic {
        self.tactic.normalise();
        self.tactic
    }
}

pub struct RoleBuilder {
    role: Role,
}

impl RoleBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            role: Role::new(name),
        }
    }

    pub fn goal(mut self, goal: impl Into<String>) -> Self {
        self.role.goals.push(goal.into());
        self
    }

    pub fn beliefs(mut self, schema: impl Into<String>, read: bool, write: bool) -> Self {
        self.role.belief_sets.push(BeliefSetAccess {
            name: schema.into(),
            read,
            write,
        });
        self
    }

    pub fn build(self) -> Role {
        self.role
    }
}

pub struct ActionBuilder {
    action: ActionDef,
}

impl ActionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            action: ActionDef::new(name),
        }
    }

    pub fn request(mut self, schema: impl Into<String>) -> Self {
        self.action.request_schema = Some(schema.into());
        self
    }

    pub fn reply(mut self, schema: impl Into<String>) -> Self {
        self.action.reply_schema = Some(schema.into());
        self
    }

    pub fn feedback(mut self, schema: impl Into<String>) -> Self {
        self.action.feedback_schema = Some(schema.into());
        self
    }

    pub fn build(self) -> ActionDef {
        self.action
    }
}

pub struct ResourceBuilder {
    name: String,
    min: i64,
    max: i64,
}

impl ResourceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min: 0,
            max: 1,
        }
    }

    pub fn min(mut self, min: i64) -> Self {
        self.min = min;
        self
    }

    pub fn max(mut self, max: i64) -> Self {
        self.max = max;
        self
    }

    pub fn build(self) -> Resource {
        Resource::new(self.name, self.min, self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coroutine_modifiers_apply_to_last_task() {
        let body = CoroutineBuilder::new()
            .label(7)
            .action("Scan")
            .param("range", 10u32)
            .on_fail(7)
            .goal("Refuel")
            .nowait()
            .build();

        let scan = &body.steps[1];
        assert!(matches!(&scan.kind, TaskKind::Action { name, params }
            if name == "Scan" && params.as_ref().unwrap().get::<u32>("range") == Some(10)));
        assert_eq!(scan.on_fail, Some(7));

        let refuel = &body.steps[2];
        assert!(refuel.nowait);
    }

    #[test]
    fn plan_builder_produces_template() {
        let plan = PlanBuilder::new("MovePlan")
            .handles("MoveGoal")
            .lock("Arm")
            .body(CoroutineBuilder::new().action("Move").build())
            .build();
        assert_eq!(plan.goal_name, "MoveGoal");
        assert_eq!(plan.resource_locks, vec!["Arm".to_string()]);
        assert_eq!(plan.body.steps.len(), 1);
    }
}
