//! Tower of Hanoi, three disks: exercises the planner end to end. The
//! agent chooses among six move plans with modelled effects until peg 3
//! holds the full tower.

use std::time::Duration;

use volition_core::{
    ActionBuilder, CoroutineBuilder, GoalBuilder, GoalPersistence, MessageSchemaBuilder,
    PlanBuilder, TacticBuilder,
};
use volition_runtime::{ActionResult, AgentTemplate, Engine, PromiseState};

const EMPTY: u8 = 0;
const BIG: u8 = 1;
const MEDIUM: u8 = 2;
const SMALL: u8 = 4;
const ALL: u8 = BIG | MEDIUM | SMALL;

fn top(peg: u8) -> u8 {
    if peg & SMALL != 0 {
        SMALL
    } else if peg & MEDIUM != 0 {
        MEDIUM
    } else if peg & BIG != 0 {
        BIG
    } else {
        EMPTY
    }
}

fn can_move(from: u8, to: u8) -> bool {
    top(from) > top(to)
}

fn move_disk(from: &mut u8, to: &mut u8) {
    let disk = top(*from);
    *from &= !disk;
    *to |= disk;
}

/// Hand-tuned estimate of the moves left given peg 2 and peg 3.
fn remaining_cost(peg1: u8, peg2: u8, peg3: u8) -> f32 {
    if peg1 == ALL {
        return 7.0;
    }
    match peg3 {
        EMPTY => match peg2 {
            EMPTY => 7.0,
            SMALL => 8.0,
            _ => 4.0,
        },
        SMALL => 5.0,
        MEDIUM => {
            if peg2 == SMALL {
                9.0
            } else {
                8.0
            }
        }
        BIG => 2.0,
        x if x == BIG | MEDIUM => 1.0,
        x if x == BIG | SMALL => 5.0,
        x if x == MEDIUM | SMALL => 6.0,
        x if x == ALL => 0.0,
        _ => 0.0,
    }
}

fn move_plan(bdi: &mut Engine, from: &'static str, to: &'static str) -> String {
    let name = format!("{from}-to-{to}-plan");
    let plan = PlanBuilder::new(name.clone())
        .handles("SolvePuzzleGoal")
        .pre(move |ctx| {
            let a = ctx.get::<u8>(from).unwrap_or(0);
            let b = ctx.get::<u8>(to).unwrap_or(0);
            can_move(a, b)
        })
        .effects(move |ctx| {
            let Some(hanoi) = ctx.message("Hanoi").cloned() else {
                return;
            };
            let mut a = hanoi.get::<u8>(from).unwrap_or(0);
            let mut b = hanoi.get::<u8>(to).unwrap_or(0);
            move_disk(&mut a, &mut b);
            let mut updated = hanoi;
            updated.set(from, a);
            updated.set(to, b);
            ctx.set_message("Hanoi", updated);
        })
        .body(
            CoroutineBuilder::new()
                .action("MoveDisk")
                .param("from", from.to_string())
                .param("to", to.to_string())
                .build(),
        )
        .build();
    bdi.commit_plan(plan).unwrap();
    name
}

#[test]
fn three_disk_puzzle_is_solved() {
    let mut bdi = Engine::new("AgentNode");

    bdi.commit_message_schema(
        MessageSchemaBuilder::new("Hanoi")
            .field_with_value("peg1", ALL)
            .field_with_value("peg2", EMPTY)
            .field_with_value("peg3", EMPTY)
            .build(),
    )
    .unwrap();
    bdi.commit_message_schema(
        MessageSchemaBuilder::new("Move Message")
            .field::<String>("from")
            .field::<String>("to")
            .build(),
    )
    .unwrap();
    bdi.commit_action(
        ActionBuilder::new("MoveDisk")
            .request("Move Message")
            .reply("Move Message")
            .build(),
    )
    .unwrap();

    bdi.commit_goal(
        GoalBuilder::new("SolvePuzzleGoal")
            .persistent()
            .pre(|ctx| ctx.get::<u8>("peg3").unwrap_or(0) != ALL)
            .satisfied(|ctx| ctx.get::<u8>("peg3").unwrap_or(0) == ALL)
            .heuristic(|ctx| {
                remaining_cost(
                    ctx.get::<u8>("peg1").unwrap_or(0),
                    ctx.get::<u8>("peg2").unwrap_or(0),
                    ctx.get::<u8>("peg3").unwrap_or(0),
                )
            })
            .build(),
    )
    .unwrap();

    let mut plans = Vec::new();
    for (from, to) in [
        ("peg1", "peg2"),
        ("peg1", "peg3"),
        ("peg2", "peg1"),
        ("peg2", "peg3"),
        ("peg3", "peg1"),
        ("peg3", "peg2"),
    ] {
        plans.push(move_plan(&mut bdi, from, to));
    }

    bdi.commit_tactic(
        TacticBuilder::new("Tactic")
            .goal("SolvePuzzleGoal")
            .loop_plans_infinitely()
            .build(),
    )
    .unwrap();

    let mut template = AgentTemplate::new("TestAgent1");
    template.beliefs = vec!["Hanoi".into()];
    template.plans = plans;
    template.action_handlers.insert(
        "MoveDisk".into(),
        std::sync::Arc::new(|ctx| {
            let from = ctx.request.get::<String>("from").unwrap_or_default();
            let to = ctx.request.get::<String>("to").unwrap_or_default();
            let Some(hanoi) = ctx.beliefs.message("Hanoi").cloned() else {
                return ActionResult::Failed;
            };
            let mut a = hanoi.get::<u8>(&from).unwrap_or(0);
            let mut b = hanoi.get::<u8>(&to).unwrap_or(0);
            if can_move(a, b) {
                move_disk(&mut a, &mut b);
                let mut updated = hanoi;
                updated.set(from, a);
                updated.set(to, b);
                ctx.beliefs.set_message("Hanoi", updated);
            }
            ActionResult::Success
        }),
    );
    bdi.commit_agent(template).unwrap();

    let handle = bdi.create_agent("TestAgent1", "agent1", None).unwrap();
    let agent = bdi.agent_mut(&handle).unwrap();
    agent.start();
    agent.select_tactic("Tactic");
    let pursue = agent.pursue("SolvePuzzleGoal", GoalPersistence::Yes, None, None);

    for _ in 0..600 {
        bdi.poll(Some(Duration::from_millis(10)));
        if pursue.promise.resolved() {
            break;
        }
    }

    assert_eq!(pursue.promise.state(), PromiseState::Success);
    let agent = bdi.agent(&handle).unwrap();
    let hanoi = agent.context().message("Hanoi").unwrap();
    assert_eq!(hanoi.get::<u8>("peg3"), Some(ALL));
    assert_eq!(hanoi.get::<u8>("peg1"), Some(EMPTY));
    assert_eq!(hanoi.get::<u8>("peg2"), Some(EMPTY));
}
