//! Goal-level behaviours: goal parameters visible to plan preconditions,
//! strict plan lists, action replies feeding later requests, idempotent
//! pursues and drop semantics.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use volition_bus::DropMode;
use volition_core::{
    ActionBuilder, CoroutineBuilder, GoalBuilder, GoalPersistence, Message, MessageSchemaBuilder,
    PlanBuilder, PlanOrder, TacticBuilder, UniqueId,
};
use volition_runtime::{ActionResult, AgentTemplate, Engine, PromiseState};

fn tick(bdi: &mut Engine, times: usize) {
    for _ in 0..times {
        bdi.poll(Some(Duration::from_millis(10)));
    }
}

#[test]
fn plan_precondition_sees_goal_parameters() {
    let mut bdi = Engine::new("Node");
    bdi.commit_message_schema(
        MessageSchemaBuilder::new("DoTask Message")
            .field::<bool>("testA")
            .build(),
    )
    .unwrap();
    bdi.commit_action(ActionBuilder::new("DoTask").build()).unwrap();
    bdi.commit_goal(
        GoalBuilder::new("DoTaskGoal")
            .message("DoTask Message")
            .build(),
    )
    .unwrap();
    bdi.commit_plan(
        PlanBuilder::new("DoTaskPlan")
            .handles("DoTaskGoal")
            .pre(|ctx| ctx.get::<bool>("testA").unwrap_or(false))
            .body(CoroutineBuilder::new().action("DoTask").build())
            .build(),
    )
    .unwrap();

    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();
    let mut template = AgentTemplate::new("Tasker");
    template.plans = vec!["DoTaskPlan".into()];
    template.action_handlers.insert(
        "DoTask".into(),
        Arc::new(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            ActionResult::Success
        }),
    );
    bdi.commit_agent(template).unwrap();

    let handle = bdi.create_agent("Tasker", "tasker1", None).unwrap();
    let agent = bdi.agent_mut(&handle).unwrap();
    agent.start();

    let mut params = Message::new("DoTask Message");
    params.set("testA", true);
    let pursue = agent.pursue("DoTaskGoal", GoalPersistence::No, Some(params), None);

    tick(&mut bdi, 30);

    assert_eq!(pursue.promise.state(), PromiseState::Success);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    // The finished one-shot desire leaves the agent promptly.
    assert!(bdi.agent(&handle).unwrap().desires().is_empty());
}

#[test]
fn plan_precondition_failing_goal_parameter_drops_goal() {
    let mut bdi = Engine::new("Node");
    bdi.commit_message_schema(
        MessageSchemaBuilder::new("DoTask Message")
            .field::<bool>("testA")
            .build(),
    )
    .unwrap();
    bdi.commit_action(ActionBuilder::new("DoTask").build()).unwrap();
    bdi.commit_goal(
        GoalBuilder::new("DoTaskGoal")
            .message("DoTask Message")
            .build(),
    )
    .unwrap();
    bdi.commit_plan(
        PlanBuilder::new("DoTaskPlan")
            .handles("DoTaskGoal")
            .pre(|ctx| ctx.get::<bool>("testA").unwrap_or(false))
            .body(CoroutineBuilder::new().action("DoTask").build())
            .build(),
    )
    .unwrap();

    let mut template = AgentTemplate::new("Tasker");
    template.plans = vec!["DoTaskPlan".into()];
    template
        .action_handlers
        .insert("DoTask".into(), Arc::new(|_ctx| ActionResult::Success));
    bdi.commit_agent(template).unwrap();

    let handle = bdi.create_agent("Tasker", "tasker1", None).unwrap();
    let agent = bdi.agent_mut(&handle).unwrap();
    agent.start();

    let mut params = Message::new("DoTask Message");
    params.set("testA", false);
    let pursue = agent.pursue("DoTaskGoal", GoalPersistence::No, Some(params), None);

    tick(&mut bdi, 30);

    match pursue.promise.state() {
        PromiseState::Failed(reason) => {
            assert!(reason.contains("not plannable"), "{reason}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(bdi.agent(&handle).unwrap().desires().is_empty());
}

#[test]
fn strict_plan_list_executes_in_declared_order_then_drops() {
    let mut bdi = Engine::new("Node");
    bdi.commit_action(ActionBuilder::new("Attempt").build()).unwrap();
    bdi.commit_goal(GoalBuilder::new("G").build()).unwrap();

    for plan in ["P_deliverFood", "P_oneMealADay", "P_donateCharity"] {
        bdi.commit_plan(
            PlanBuilder::new(plan)
                .handles("G")
                .body(
                    CoroutineBuilder::new()
                        .action("Attempt")
                        .param("plan", plan.to_string())
                        .build(),
                )
                .build(),
        )
        .unwrap();
    }
    bdi.commit_tactic(
        TacticBuilder::new("StrictT")
            .goal("G")
            .plans(["P_deliverFood", "P_oneMealADay", "P_donateCharity"])
            .plan_order(PlanOrder::Strict)
            .loop_plans_count(1)
            .build(),
    )
    .unwrap();

    let order = Arc::new(Mutex::new(Vec::<String>::new()));
    let recorder = order.clone();
    let mut template = AgentTemplate::new("Strictor");
    template.action_handlers.insert(
        "Attempt".into(),
        Arc::new(move |ctx| {
            recorder
                .lock()
                .push(ctx.request.get::<String>("plan").unwrap_or_default());
            ActionResult::Failed
        }),
    );
    bdi.commit_agent(template).unwrap();

    let handle = bdi.create_agent("Strictor", "strictor1", None).unwrap();
    let agent = bdi.agent_mut(&handle).unwrap();
    agent.start();
    agent.select_tactic("StrictT");
    let pursue = agent.pursue("G", GoalPersistence::No, None, None);

    tick(&mut bdi, 60);

    assert_eq!(
        *order.lock(),
        vec![
            "P_deliverFood".to_string(),
            "P_oneMealADay".to_string(),
            "P_donateCharity".to_string(),
        ]
    );
    assert!(bdi.agent(&handle).unwrap().desires().is_empty());
    match pursue.promise.state() {
        PromiseState::Failed(reason) => {
            assert!(reason.contains("No executable allocation"), "{reason}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn action_reply_flows_into_next_request() {
    let mut bdi = Engine::new("Node");
    bdi.commit_message_schema(
        MessageSchemaBuilder::new("Reply A")
            .field_with_value("number", 5i32)
            .build(),
    )
    .unwrap();
    bdi.commit_message_schema(
        MessageSchemaBuilder::new("Request B")
            .field::<i32>("number")
            .build(),
    )
    .unwrap();
    bdi.commit_action(ActionBuilder::new("ActionA").reply("Reply A").build())
        .unwrap();
    bdi.commit_action(ActionBuilder::new("ActionB").request("Request B").build())
        .unwrap();
    bdi.commit_goal(GoalBuilder::new("ChainGoal").build()).unwrap();
    bdi.commit_plan(
        PlanBuilder::new("ChainPlan")
            .handles("ChainGoal")
            .body(
                CoroutineBuilder::new()
                    .action("ActionA")
                    .action("ActionB")
                    .build(),
            )
            .build(),
    )
    .unwrap();

    let observed = Arc::new(Mutex::new(None::<i32>));
    let sink = observed.clone();
    let mut template = AgentTemplate::new("Chainer");
    template
        .action_handlers
        .insert("ActionA".into(), Arc::new(|_ctx| ActionResult::Success));
    template.action_handlers.insert(
        "ActionB".into(),
        Arc::new(move |ctx| {
            *sink.lock() = ctx.request.get::<i32>("number");
            ActionResult::Success
        }),
    );
    bdi.commit_agent(template).unwrap();

    let handle = bdi.create_agent("Chainer", "chainer1", None).unwrap();
    let agent = bdi.agent_mut(&handle).unwrap();
    agent.start();
    let pursue = agent.pursue("ChainGoal", GoalPersistence::No, None, None);

    tick(&mut bdi, 40);

    assert_eq!(pursue.promise.state(), PromiseState::Success);
    assert_eq!(*observed.lock(), Some(5));
}

#[test]
fn pursue_with_fixed_id_is_idempotent() {
    let mut bdi = Engine::new("Node");
    bdi.commit_action(ActionBuilder::new("Wait").build()).unwrap();
    bdi.commit_goal(GoalBuilder::new("Idle").build()).unwrap();
    bdi.commit_plan(
        PlanBuilder::new("IdlePlan")
            .handles("Idle")
            .body(CoroutineBuilder::new().sleep(60_000).build())
            .build(),
    )
    .unwrap();
    bdi.commit_agent(AgentTemplate::new("Idler")).unwrap();

    let handle = bdi.create_agent("Idler", "idler1", None).unwrap();
    bdi.agent_mut(&handle).unwrap().start();

    let goal_id = UniqueId::random();
    bdi.agent_mut(&handle)
        .unwrap()
        .pursue("Idle", GoalPersistence::No, None, Some(goal_id));
    tick(&mut bdi, 3);
    bdi.agent_mut(&handle)
        .unwrap()
        .pursue("Idle", GoalPersistence::No, None, Some(goal_id));
    tick(&mut bdi, 3);

    assert_eq!(bdi.agent(&handle).unwrap().desires().len(), 1);
}

#[test]
fn normal_drop_spares_persistent_goals_force_does_not() {
    let mut bdi = Engine::new("Node");
    bdi.commit_goal(GoalBuilder::new("KeepAlive").persistent().build())
        .unwrap();
    bdi.commit_plan(
        PlanBuilder::new("NapPlan")
            .handles("KeepAlive")
            .body(CoroutineBuilder::new().sleep(60_000).build())
            .build(),
    )
    .unwrap();
    bdi.commit_agent(AgentTemplate::new("Sleeper")).unwrap();

    let handle = bdi.create_agent("Sleeper", "sleeper1", None).unwrap();
    bdi.agent_mut(&handle).unwrap().start();
    let pursue =
        bdi.agent_mut(&handle)
            .unwrap()
            .pursue("KeepAlive", GoalPersistence::Yes, None, None);
    tick(&mut bdi, 10);
    assert_eq!(bdi.agent(&handle).unwrap().desires().len(), 1);

    bdi.agent_mut(&handle)
        .unwrap()
        .drop_goal(&pursue.handle, "just checking");
    tick(&mut bdi, 10);
    assert_eq!(
        bdi.agent(&handle).unwrap().desires().len(),
        1,
        "normal drop leaves persistent desires intact"
    );

    bdi.agent_mut(&handle).unwrap().drop_with_mode(
        &pursue.handle,
        DropMode::Force,
        "clearing out",
    );
    tick(&mut bdi, 10);
    assert!(bdi.agent(&handle).unwrap().desires().is_empty());
    assert!(matches!(pursue.promise.state(), PromiseState::Failed(_)));
}

#[test]
fn recommitting_a_template_replaces_it() {
    let mut bdi = Engine::new("Node");
    bdi.commit_goal(GoalBuilder::new("G").build()).unwrap();
    let before = bdi.tactic_list().len();
    bdi.commit_goal(GoalBuilder::new("G").heuristic(|_| 2.0).build())
        .unwrap();
    assert_eq!(bdi.tactic_list().len(), before);
}
