//! # volition-core
//!
//! Typed messages, belief contexts and the declarative BDI templates
//! (goals, plans, tactics, roles, actions, resources) shared by the
//! volition runtime and bus crates.
//!
//! Templates are immutable once built; the runtime clones them when
//! creating instances. Predicates and effects are plain closures over a
//! read-only (or, for effects, mutable) belief context view.

pub mod action;
pub mod beliefs;
pub mod builder;
pub mod error;
pub mod field;
pub mod goal;
pub mod id;
pub mod message;
pub mod plan;
pub mod role;
pub mod tactic;

pub use action::ActionDef;
pub use beliefs::{BeliefContext, Resource};
pub use builder::{
    ActionBuilder, CoroutineBuilder, GoalBuilder, MessageSchemaBuilder, PlanBuilder,
    ResourceBuilder, RoleBuilder, TacticBuilder,
};
pub use error::{CommitError, SchemaError};
pub use field::{FieldType, Value, ValueKind, Vec2};
pub use goal::{
    Desire, Effects, FinishState, Goal, GoalPersistence, Heuristic, ParentLink, PlanHistory,
    PlanSelection, Predicate,
};
pub use id::{AgentHandle, GoalHandle, IntentionId, ServiceHandle, TaskId, UniqueId};
pub use message::{Message, MessageSchema, SchemaField};
pub use plan::{Plan, PlanBody, TaskKind, TaskStep};
pub use role::{BeliefSetAccess, Role};
pub use tactic::{builtin_tactic_name, PlanOrder, Tactic, LOOP_PLANS_INFINITELY};
