//! Intention execution under shared resources: plans locking the same
//! resource never overlap, and the DAG drives strictly sequential
//! execution.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use volition_core::{
    ActionBuilder, CoroutineBuilder, GoalBuilder, GoalPersistence, PlanBuilder, Resource,
};
use volition_runtime::{ActionResult, AgentTemplate, Engine, PromiseState};

#[test]
fn shared_resource_serialises_intentions() {
    let mut bdi = Engine::new("Node");
    bdi.commit_resource(Resource::new("BatteryLock", 0, 1)).unwrap();
    bdi.commit_action(ActionBuilder::new("Work1").build()).unwrap();
    bdi.commit_action(ActionBuilder::new("Work2").build()).unwrap();
    bdi.commit_goal(GoalBuilder::new("G1").build()).unwrap();
    bdi.commit_goal(GoalBuilder::new("G2").build()).unwrap();
    bdi.commit_plan(
        PlanBuilder::new("P1")
            .handles("G1")
            .lock("BatteryLock")
            .body(CoroutineBuilder::new().action("Work1").build())
            .build(),
    )
    .unwrap();
    bdi.commit_plan(
        PlanBuilder::new("P2")
            .handles("G2")
            .lock("BatteryLock")
            .body(CoroutineBuilder::new().action("Work2").build())
            .build(),
    )
    .unwrap();

    // Tick index at which each action ran.
    let log = Arc::new(Mutex::new(Vec::<(String, u64)>::new()));
    let tick_counter = Arc::new(Mutex::new(0u64));

    let mut template = AgentTemplate::new("Worker");
    for action in ["Work1", "Work2"] {
        let log = log.clone();
        let tick_counter = tick_counter.clone();
        template.action_handlers.insert(
            action.into(),
            Arc::new(move |_ctx| {
                log.lock().push((action.to_string(), *tick_counter.lock()));
                ActionResult::Success
            }),
        );
    }
    bdi.commit_agent(template).unwrap();

    let handle = bdi.create_agent("Worker", "worker1", None).unwrap();
    bdi.agent_mut(&handle).unwrap().start();
    let p1 = bdi
        .agent_mut(&handle)
        .unwrap()
        .pursue("G1", GoalPersistence::No, None, None);
    let p2 = bdi
        .agent_mut(&handle)
        .unwrap()
        .pursue("G2", GoalPersistence::No, None, None);

    let mut max_active = 0usize;
    for _ in 0..80 {
        *tick_counter.lock() += 1;
        bdi.poll(Some(Duration::from_millis(10)));
        let agent = bdi.agent(&handle).unwrap();
        let active = agent
            .executor()
            .intentions()
            .iter()
            .filter(|i| i.current_plan().is_some())
            .count();
        max_active = max_active.max(active);
        if p1.promise.resolved() && p2.promise.resolved() {
            break;
        }
    }

    assert_eq!(p1.promise.state(), PromiseState::Success);
    assert_eq!(p2.promise.state(), PromiseState::Success);

    let log = log.lock();
    assert_eq!(log.len(), 2, "each action ran exactly once: {log:?}");
    assert_ne!(log[0].1, log[1].1, "actions never share a tick: {log:?}");
    assert_eq!(log[0].0, "Work1");
    assert_eq!(log[1].0, "Work2");
    assert!(max_active <= 1, "at most one intention held a plan at a time");
}

#[test]
fn independent_goals_run_without_waiting_on_each_other() {
    let mut bdi = Engine::new("Node");
    bdi.commit_action(ActionBuilder::new("WorkA").build()).unwrap();
    bdi.commit_action(ActionBuilder::new("WorkB").build()).unwrap();
    bdi.commit_goal(GoalBuilder::new("GA").build()).unwrap();
    bdi.commit_goal(GoalBuilder::new("GB").build()).unwrap();
    bdi.commit_plan(
        PlanBuilder::new("PA")
            .handles("GA")
            .body(CoroutineBuilder::new().action("WorkA").build())
            .build(),
    )
    .unwrap();
    bdi.commit_plan(
        PlanBuilder::new("PB")
            .handles("GB")
            .body(CoroutineBuilder::new().action("WorkB").build())
            .build(),
    )
    .unwrap();

    let log = Arc::new(Mutex::new(Vec::<String>::new()));
    let mut template = AgentTemplate::new("Worker");
    for action in ["WorkA", "WorkB"] {
        let log = log.clone();
        template.action_handlers.insert(
            action.into(),
            Arc::new(move |_ctx| {
                log.lock().push(action.to_string());
                ActionResult::Success
            }),
        );
    }
    bdi.commit_agent(template).unwrap();

    let handle = bdi.create_agent("Worker", "worker1", None).unwrap();
    bdi.agent_mut(&handle).unwrap().start();
    let pa = bdi
        .agent_mut(&handle)
        .unwrap()
        .pursue("GA", GoalPersistence::No, None, None);
    let pb = bdi
        .agent_mut(&handle)
        .unwrap()
        .pursue("GB", GoalPersistence::No, None, None);

    for _ in 0..60 {
        bdi.poll(Some(Duration::from_millis(10)));
        if pa.promise.resolved() && pb.promise.resolved() {
            break;
        }
    }

    assert_eq!(pa.promise.state(), PromiseState::Success);
    assert_eq!(pb.promise.state(), PromiseState::Success);
    assert_eq!(log.lock().len(), 2);
}

#[test]
fn dag_frontier_stays_open_while_intentions_run() {
    let mut bdi = Engine::new("Node");
    bdi.commit_action(ActionBuilder::new("Work").build()).unwrap();
    bdi.commit_goal(GoalBuilder::new("G").build()).unwrap();
    bdi.commit_plan(
        PlanBuilder::new("P")
            .handles("G")
            .body(CoroutineBuilder::new().sleep(120).action("Work").build())
            .build(),
    )
    .unwrap();
    let mut template = AgentTemplate::new("Worker");
    template
        .action_handlers
        .insert("Work".into(), Arc::new(|_ctx| ActionResult::Success));
    bdi.commit_agent(template).unwrap();

    let handle = bdi.create_agent("Worker", "worker1", None).unwrap();
    bdi.agent_mut(&handle).unwrap().start();
    let pursue = bdi
        .agent_mut(&handle)
        .unwrap()
        .pursue("G", GoalPersistence::No, None, None);

    let mut saw_running = false;
    for _ in 0..80 {
        bdi.poll(Some(Duration::from_millis(10)));
        let agent = bdi.agent(&handle).unwrap();
        let any_running = agent
            .executor()
            .intentions()
            .iter()
            .any(|i| i.current_plan().is_some() && !i.is_concluded());
        if any_running {
            saw_running = true;
            assert!(
                !agent.executor().dag().done(),
                "the DAG cannot be done while an intention still runs"
            );
        }
        if pursue.promise.resolved() {
            break;
        }
    }

    assert!(saw_running, "the sleeping intention was observable");
    assert_eq!(pursue.promise.state(), PromiseState::Success);
}
