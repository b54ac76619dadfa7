//! # volition-runtime
//!
//! The BDI engine: agents (and teams of agents) pursue declarative goals
//! by planning over committed plan templates, executing the chosen
//! intentions as cooperative coroutines, and coordinating across nodes
//! through the volition-bus protocol layer.
//!
//! One [`Engine`] is one logical tick thread. All agent scheduling and
//! intention stepping runs cooperatively inside [`Engine::poll`]; bus
//! adapters may push into the thread-safe event queue from their own
//! receive threads.

pub mod agent;
pub mod dag;
pub mod engine;
pub mod error;
pub mod event;
pub mod executor;
pub mod intention;
pub mod promise;
pub mod queue;
pub mod schedule;
pub mod service;

pub use agent::{Agent, AgentState, AgentTemplate, SharedBeliefEntry};
pub use dag::{DagNode, DagNodeState, IntentionExecutionDag};
pub use engine::{
    Engine, EngineSettings, EngineShared, EngineThread, PollResult, Registries, SharedDirectory,
};
pub use error::{Result, RuntimeError};
pub use event::{ActionEvent, ActionHandle, Event, EventBody};
pub use executor::{AgentExecutor, PlanResult, RunningState};
pub use intention::{DropRequest, ExecState, IntentionExecutor};
pub use promise::{GoalPromise, GoalPursue, PromiseState};
pub use queue::EventQueue;
pub use schedule::{
    AuctionProbe, BestIntention, Decision, PlannerGoal, PlannerGoalInput, Schedule,
    ScheduleFailure, ScheduleInputs, ScheduleState, SearchNodeId, FAILED_COST,
};
pub use service::{ActionContext, ActionHandler, ActionResult, Service, ServiceTemplate};
