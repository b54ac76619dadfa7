//! Two engines joined by the in-memory bus: proxy mirrors, cross-node
//! pursue, team delegation via auction, belief propagation and
//! cross-node drops.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use volition_bus::{DropMode, InMemoryBus};
use volition_core::{
    ActionBuilder, CoroutineBuilder, GoalBuilder, GoalPersistence, Message, MessageSchemaBuilder,
    PlanBuilder, RoleBuilder, UniqueId,
};
use volition_runtime::{ActionResult, AgentTemplate, Engine};

fn tick_both(a: &mut Engine, b: &mut Engine, times: usize) {
    for _ in 0..times {
        a.poll(Some(Duration::from_millis(10)));
        b.poll(Some(Duration::from_millis(10)));
    }
}

struct Mesh {
    a: Engine,
    b: Engine,
    invocations: Arc<AtomicU32>,
}

/// Engine A hosts the real team and member; engine B ends up with proxy
/// mirrors via REGISTER events.
fn build_mesh() -> Mesh {
    let hub = InMemoryBus::new();
    let mut a = Engine::new("NodeA");
    let mut b = Engine::new("NodeB");
    a.add_bus_adapter(Box::new(hub.connect("a")));
    b.add_bus_adapter(Box::new(hub.connect("b")));

    let invocations = Arc::new(AtomicU32::new(0));

    for engine in [&mut a, &mut b] {
        engine
            .commit_message_schema(
                MessageSchemaBuilder::new("SharedState")
                    .field::<bool>("flag")
                    .build(),
            )
            .unwrap();
        engine
            .commit_action(ActionBuilder::new("TeamAction").build())
            .unwrap();
        engine
            .commit_goal(GoalBuilder::new("TeamGoal").delegated().build())
            .unwrap();
        engine
            .commit_plan(
                PlanBuilder::new("TeamPlan")
                    .handles("TeamGoal")
                    .body(CoroutineBuilder::new().action("TeamAction").build())
                    .build(),
            )
            .unwrap();
        engine
            .commit_role(RoleBuilder::new("Worker").goal("TeamGoal").build())
            .unwrap();
    }

    let mut team_template = AgentTemplate::new("TeamT");
    team_template.team = true;
    a.commit_team(team_template).unwrap();

    let counter = invocations.clone();
    let mut member_template = AgentTemplate::new("MemberT");
    member_template.roles = vec!["Worker".into()];
    member_template.plans = vec!["TeamPlan".into()];
    member_template.action_handlers.insert(
        "TeamAction".into(),
        Arc::new(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            ActionResult::Success
        }),
    );
    a.commit_agent(member_template).unwrap();

    let team = a.create_agent("TeamT", "team1", None).unwrap();
    let member = a.create_agent("MemberT", "member1", None).unwrap();
    a.agent_mut(&team).unwrap().start();
    a.agent_mut(&member).unwrap().start();
    a.agent_mut(&team).unwrap().add_member_agent(member.clone());

    // Let REGISTERs flush (outgoing events queue during the first polls)
    // and proxies build on B.
    tick_both(&mut a, &mut b, 8);

    Mesh { a, b, invocations }
}

#[test]
fn registers_mirror_agents_as_proxies() {
    let mesh = build_mesh();
    let proxy_team = mesh.b.agent_by_name("team1").expect("proxy team exists");
    assert!(proxy_team.is_proxy());
    assert!(proxy_team.is_team());
    let proxy_member = mesh.b.agent_by_name("member1").expect("proxy member exists");
    assert!(proxy_member.is_proxy());
}

#[test]
fn heartbeats_populate_the_bus_directory() {
    let mut mesh = build_mesh();
    tick_both(&mut mesh.a, &mut mesh.b, 5);
    let b_address = mesh.b.address().clone();
    assert!(
        mesh.a.bus_directory().last_seen(&b_address).is_some(),
        "A heard B's heartbeat"
    );
    let a_address = mesh.a.address().clone();
    assert!(mesh.b.bus_directory().last_seen(&a_address).is_some());
}

#[test]
fn pursue_on_proxy_team_delegates_to_the_real_member() {
    let mut mesh = build_mesh();

    let proxy_team_handle = mesh.b.agent_by_name("team1").unwrap().handle().clone();
    mesh.b
        .agent_by_name_mut("team1")
        .unwrap()
        .pursue("TeamGoal", GoalPersistence::No, None, None);

    tick_both(&mut mesh.a, &mut mesh.b, 60);

    assert_eq!(
        mesh.invocations.load(Ordering::SeqCst),
        1,
        "the member's handler fired exactly once"
    );
    let real_team = mesh.a.agent(&proxy_team_handle).unwrap();
    assert!(
        real_team.desires().is_empty(),
        "the delegated goal finished and left the team"
    );
}

#[test]
fn broadcast_message_from_proxy_reaches_real_beliefs() {
    let mut mesh = build_mesh();

    let mut msg = Message::new("SharedState");
    msg.set("flag", true);
    mesh.b
        .agent_by_name_mut("member1")
        .unwrap()
        .send_message(msg, true);

    tick_both(&mut mesh.a, &mut mesh.b, 20);

    let real_member = mesh.a.agent_by_name("member1").unwrap();
    let state = real_member
        .context()
        .message("SharedState")
        .expect("belief set propagated over the bus");
    assert_eq!(state.get::<bool>("flag"), Some(true));
}

#[test]
fn force_drop_from_the_proxy_side_clears_the_real_desire() {
    let mut mesh = build_mesh();

    let goal_id = UniqueId::random();
    mesh.b.agent_by_name_mut("team1").unwrap().pursue(
        "TeamGoal",
        GoalPersistence::No,
        None,
        Some(goal_id),
    );
    // Let the pursue land but keep the bid round-trip from finishing.
    tick_both(&mut mesh.a, &mut mesh.b, 3);
    let team_handle = mesh.a.agent_by_name("team1").unwrap().handle().clone();

    let pursue_handle = volition_core::GoalHandle::with_id("TeamGoal", goal_id);
    mesh.b
        .agent_by_name_mut("team1")
        .unwrap()
        .drop_with_mode(&pursue_handle, DropMode::Force, "cancelled from afar");

    tick_both(&mut mesh.a, &mut mesh.b, 40);

    assert!(
        mesh.a.agent(&team_handle).unwrap().desires().is_empty(),
        "the force drop crossed the bus and removed the desire"
    );
}
