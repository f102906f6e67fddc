//! Property tests for the deferred command queue.
//!
//! These tests use `proptest` to generate random batches of deferred
//! commands and verify that applying them at the sync point is equivalent
//! to performing the same edits immediately, in the same order.

use ember_ecs::prelude::*;
use proptest::prelude::*;

#[derive(Debug, Clone, PartialEq)]
struct Hp(u32);

#[derive(Debug, Clone, PartialEq)]
struct Score(i64);

#[derive(Debug, Clone)]
enum CmdOp {
    InsertHp(usize, u32),
    InsertScore(usize, i64),
    RemoveHp(usize),
    Despawn(usize),
    Spawn,
}

fn cmd_op_strategy() -> impl Strategy<Value = CmdOp> {
    prop_oneof![
        (0..20usize, any::<u32>()).prop_map(|(i, v)| CmdOp::InsertHp(i, v)),
        (0..20usize, any::<i64>()).prop_map(|(i, v)| CmdOp::InsertScore(i, v)),
        (0..20usize).prop_map(CmdOp::RemoveHp),
        (0..20usize).prop_map(CmdOp::Despawn),
        Just(CmdOp::Spawn),
    ]
}

/// Record a batch of operations into the world's deferred queue.
fn record_commands(world: &mut World, ops: &[CmdOp], entities: &[Entity]) {
    let mut cmds = world.commands();
    for op in ops {
        match op {
            CmdOp::InsertHp(idx, val) => {
                let e = entities[idx % entities.len()];
                cmds.entity(e).insert(Hp(*val));
            }
            CmdOp::InsertScore(idx, val) => {
                let e = entities[idx % entities.len()];
                cmds.entity(e).insert(Score(*val));
            }
            CmdOp::RemoveHp(idx) => {
                let e = entities[idx % entities.len()];
                cmds.entity(e).remove::<Hp>();
            }
            CmdOp::Despawn(idx) => {
                let e = entities[idx % entities.len()];
                cmds.entity(e).despawn();
            }
            CmdOp::Spawn => {
                cmds.spawn();
            }
        }
    }
}

/// Perform the same operations immediately, ignoring individual failures
/// the way the queue skips them.
fn apply_immediately(world: &mut World, ops: &[CmdOp], entities: &[Entity]) {
    for op in ops {
        match op {
            CmdOp::InsertHp(idx, val) => {
                let _ = world.add_component(entities[idx % entities.len()], Hp(*val));
            }
            CmdOp::InsertScore(idx, val) => {
                let _ = world.add_component(entities[idx % entities.len()], Score(*val));
            }
            CmdOp::RemoveHp(idx) => {
                let _ = world.remove_component::<Hp>(entities[idx % entities.len()]);
            }
            CmdOp::Despawn(idx) => {
                let _ = world.despawn(entities[idx % entities.len()]);
            }
            CmdOp::Spawn => {
                world.spawn();
            }
        }
    }
}

/// A fresh world with Hp and Score registered, plus 5 initial entities.
fn setup_world_and_entities() -> (World, Vec<Entity>) {
    let mut world = World::new();
    world.register_component::<Hp>("hp");
    world.register_component::<Score>("score");

    let mut entities: Vec<Entity> = Vec::new();
    for i in 0..5u32 {
        entities.push(world.spawn_with(Hp(100 + i)));
    }

    (world, entities)
}

/// The observable state of the initial entities: liveness plus component
/// values, in a comparable shape.
fn observe(world: &World, entities: &[Entity]) -> Vec<(bool, Option<Hp>, Option<Score>)> {
    entities
        .iter()
        .map(|&e| {
            (
                world.is_alive(e),
                world.get_component::<Hp>(e).ok().cloned(),
                world.get_component::<Score>(e).ok().cloned(),
            )
        })
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10_000))]

    /// Deferring a batch and flushing it at the sync point leaves the world
    /// equivalent to performing the same edits immediately, in order.
    #[test]
    fn deferred_batch_equals_immediate_application(
        ops in prop::collection::vec(cmd_op_strategy(), 1..30),
    ) {
        let (mut deferred_world, deferred_entities) = setup_world_and_entities();
        record_commands(&mut deferred_world, &ops, &deferred_entities);
        deferred_world.flush_commands();

        let (mut immediate_world, immediate_entities) = setup_world_and_entities();
        apply_immediately(&mut immediate_world, &ops, &immediate_entities);

        prop_assert_eq!(
            observe(&deferred_world, &deferred_entities),
            observe(&immediate_world, &immediate_entities)
        );
        prop_assert_eq!(deferred_world.entity_count(), immediate_world.entity_count());
    }

    /// The same batch applied to two identical worlds produces identical
    /// apply reports and final states.
    #[test]
    fn deferred_batches_are_deterministic(
        ops in prop::collection::vec(cmd_op_strategy(), 1..20),
    ) {
        fn run_once(ops: &[CmdOp]) -> (ApplyReport, usize, Vec<(bool, Option<Hp>, Option<Score>)>) {
            let (mut world, entities) = setup_world_and_entities();
            record_commands(&mut world, ops, &entities);
            let report = world.flush_commands();
            let state = observe(&world, &entities);
            (report, world.entity_count(), state)
        }

        let run1 = run_once(&ops);
        let run2 = run_once(&ops);
        prop_assert_eq!(run1, run2);
    }

    /// Commands targeting an entity despawned earlier in the same batch are
    /// skipped, not applied and not fatal.
    #[test]
    fn despawn_then_modify_is_graceful(
        hp_val in any::<u32>(),
        score_val in any::<i64>(),
    ) {
        let (mut world, entities) = setup_world_and_entities();
        let target = entities[0];

        {
            let mut cmds = world.commands();
            cmds.entity(target).despawn();
            cmds.entity(target).insert(Hp(hp_val));
            cmds.entity(target).insert(Score(score_val));
        }

        let report = world.flush_commands();
        prop_assert_eq!(report.applied, 1);
        prop_assert_eq!(report.skipped, 2);
        prop_assert!(!world.is_alive(target));
    }

    /// Deferred spawns produce entities that are alive and carry the
    /// components recorded against them.
    #[test]
    fn deferred_spawns_create_valid_entities(
        spawn_count in 1..20usize,
    ) {
        let mut world = World::new();
        world.register_component::<Hp>("hp");

        let mut spawned = Vec::new();
        {
            let mut cmds = world.commands();
            for _ in 0..spawn_count {
                let mut s = cmds.spawn();
                s.insert(Hp(100));
                spawned.push(s.id());
            }
        }

        let report = world.flush_commands();
        prop_assert_eq!(report.applied, spawn_count * 2);
        prop_assert_eq!(report.skipped, 0);
        prop_assert_eq!(world.entity_count(), spawn_count);

        for &e in &spawned {
            prop_assert!(world.is_alive(e));
            prop_assert_eq!(world.get_component::<Hp>(e).unwrap(), &Hp(100));
        }
    }

    /// The queue is consumed by the flush; a second batch starts from an
    /// empty queue.
    #[test]
    fn queue_resets_after_flush(
        batch1_size in 1..10usize,
        batch2_size in 1..10usize,
    ) {
        let (mut world, entities) = setup_world_and_entities();

        {
            let mut cmds = world.commands();
            for i in 0..batch1_size {
                cmds.entity(entities[i % entities.len()]).insert(Hp(i as u32));
            }
        }
        let report1 = world.flush_commands();
        prop_assert_eq!(report1.applied, batch1_size);

        {
            let mut cmds = world.commands();
            for i in 0..batch2_size {
                cmds.entity(entities[i % entities.len()]).insert(Hp((i + 100) as u32));
            }
        }
        let report2 = world.flush_commands();
        prop_assert_eq!(report2.applied, batch2_size);
        prop_assert_eq!(report2.skipped, 0);
    }
}
