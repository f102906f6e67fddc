//! Ember ECS -- archetype-based entity component system with a reflection
//! layer.
//!
//! Entities are stored in archetypes (one table per unique set of component
//! types) using a Structure-of-Arrays layout for cache-friendly iteration.
//! Generational entity handles detect stale references immediately. On top
//! of the storage sits a type-erasure layer: every component type is
//! registered once, described by a [`reflect::TypeInfo`], and reachable
//! through erased [`reflect::Ref`]/[`reflect::RefMut`]/[`reflect::Value`]
//! handles as well as the usual typed accessors. Systems run single-threaded
//! in registration order, record structural edits through a deferred command
//! queue, and communicate through double-buffered event channels.
//!
//! # Quick Start
//!
//! ```
//! use ember_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut world = World::new();
//! world.register_component::<Position>("position");
//! world.register_component::<Velocity>("velocity");
//!
//! let mut bundle = Bundle::new();
//! bundle.add(world.registry(), Position { x: 0.0, y: 0.0 });
//! bundle.add(world.registry(), Velocity { dx: 1.0, dy: 0.0 });
//! let entity = world.spawn_bundle(bundle);
//!
//! for (_entity, (pos, vel)) in world.query_mut::<(&mut Position, &Velocity)>() {
//!     pos.x += vel.dx;
//!     pos.y += vel.dy;
//! }
//!
//! assert_eq!(world.get_component::<Position>(entity).unwrap(), &Position { x: 1.0, y: 0.0 });
//! ```

#![deny(unsafe_code)]

#[allow(unsafe_code)]
pub mod archetype;
#[allow(unsafe_code)]
pub mod class;
pub mod command;
pub mod entity;
pub mod event;
#[allow(unsafe_code)]
pub mod query;
#[allow(unsafe_code)]
pub mod reflect;
pub mod system;
#[allow(unsafe_code)]
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// An erased handle was read as a type other than the one it holds.
    #[error("type mismatch: expected '{expected}', found '{found}'")]
    TypeMismatch { expected: String, found: String },

    /// The entity does not exist (stale generation or never placed).
    #[error("entity {0:?} does not exist (stale or never placed)")]
    UnknownEntity(entity::Entity),

    /// The entity exists but has no component of the named type.
    #[error("entity {entity:?} has no '{component}' component")]
    ComponentNotPresent {
        entity: entity::Entity,
        component: String,
    },

    /// A type was referenced that has never been registered.
    #[error("type '{0}' is not registered")]
    UnknownType(String),

    /// A second resource of the same type was inserted.
    #[error("resource '{0}' already exists")]
    DuplicateResource(String),

    /// A resource was accessed that does not exist.
    #[error("resource '{0}' does not exist")]
    MissingResource(String),

    /// A system declared a dependency the world cannot satisfy.
    #[error("system '{system}' depends on '{dependency}', which is not available")]
    UnresolvedDependency { system: String, dependency: String },

    /// A schedule key was used that was never created.
    #[error("schedule '{0}' does not exist")]
    UnknownSchedule(String),

    /// An event was sent or read on a channel that was never opened.
    #[error("no event channel for '{0}'")]
    UnknownEvent(String),
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::{Archetype, ArchetypeId, ComponentSet};
    pub use crate::class::{ClassInfo, Member, Method};
    pub use crate::command::{ApplyReport, Commands, EntityCommands};
    pub use crate::entity::Entity;
    pub use crate::event::{EventCursor, EventReader, EventWriter};
    pub use crate::query::{Query, QueryId, QueryItem, QueryIter, QueryIterMut};
    pub use crate::reflect::{
        Component, Ref, RefMut, TypeInfo, TypeKey, TypeRegistry, Value, Var,
    };
    pub use crate::system::{SystemBuilder, SystemId, SystemScope, WorldView};
    pub use crate::world::{Bundle, World};
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::prelude::*;

    // -- test component types -----------------------------------------------

    #[derive(Debug, Clone, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Health(u32);

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Frame(u64);

    #[derive(Debug, Clone, PartialEq)]
    struct Damage {
        amount: u32,
    }

    fn setup_world() -> World {
        let mut world = World::new();
        world.register_component::<Position>("position");
        world.register_component::<Velocity>("velocity");
        world.register_component::<Health>("health");
        world
    }

    // -- storage integration ------------------------------------------------

    #[test]
    fn spawn_entities_with_components_and_query_back() {
        let mut world = setup_world();

        let mut b = Bundle::new();
        b.add(world.registry(), Position { x: 1.0, y: 2.0 });
        b.add(world.registry(), Velocity { dx: 3.0, dy: 4.0 });
        let e = world.spawn_bundle(b);

        assert_eq!(
            world.get_component::<Position>(e).unwrap(),
            &Position { x: 1.0, y: 2.0 }
        );
        assert_eq!(
            world.get_component::<Velocity>(e).unwrap(),
            &Velocity { dx: 3.0, dy: 4.0 }
        );
    }

    #[test]
    fn add_component_migration_preserves_values() {
        let mut world = setup_world();
        let e = world.spawn_with(Position { x: 5.0, y: 6.0 });
        let before = world.archetype_count();

        world
            .add_component(e, Velocity { dx: 7.0, dy: 8.0 })
            .unwrap();

        assert!(world.has_component::<Velocity>(e).unwrap());
        assert_eq!(
            world.get_component::<Position>(e).unwrap(),
            &Position { x: 5.0, y: 6.0 }
        );
        assert!(world.archetype_count() > before);
    }

    #[test]
    fn erased_and_typed_access_agree() {
        let mut world = setup_world();
        let e = world.spawn_with(Position { x: 1.0, y: 2.0 });
        let key = world.registry().key_of::<Position>().unwrap();

        {
            let erased = world.component_ref(e, key).unwrap();
            assert_eq!(erased.get::<Position>().unwrap(), &Position { x: 1.0, y: 2.0 });
            assert!(matches!(
                erased.get::<Velocity>(),
                Err(EcsError::TypeMismatch { .. })
            ));
        }

        world.get_component_mut::<Position>(e).unwrap().x = 10.0;
        let erased = world.component_ref(e, key).unwrap();
        assert_eq!(erased.get::<Position>().unwrap().x, 10.0);
    }

    // -- scale test ---------------------------------------------------------

    #[test]
    fn scale_10k_entities() {
        let mut world = setup_world();

        let mut entities = Vec::with_capacity(10_000);
        for i in 0..10_000u32 {
            let mut b = Bundle::new();
            b.add(
                world.registry(),
                Position {
                    x: i as f32,
                    y: i as f32 * 2.0,
                },
            );
            b.add(world.registry(), Velocity { dx: 1.0, dy: -1.0 });
            entities.push(world.spawn_bundle(b));
        }

        assert_eq!(world.query::<(&Position, &Velocity)>().count(), 10_000);

        for (_entity, (vel,)) in world.query_mut::<(&mut Velocity,)>() {
            vel.dx *= 2.0;
            vel.dy *= 2.0;
        }
        let vel = world.get_component::<Velocity>(entities[0]).unwrap();
        assert_eq!(vel, &Velocity { dx: 2.0, dy: -2.0 });

        for e in entities.iter().take(5_000) {
            world.despawn(*e).unwrap();
        }
        assert_eq!(world.query::<(&Position, &Velocity)>().count(), 5_000);
        assert_eq!(world.entity_count(), 5_000);
    }

    // -- full runtime loop --------------------------------------------------

    #[test]
    fn schedule_moves_entities_each_run() {
        let mut world = setup_world();
        let mut b = Bundle::new();
        b.add(world.registry(), Position { x: 5.0, y: 6.0 });
        b.add(world.registry(), Velocity { dx: 4.0, dy: 4.0 });
        let e = world.spawn_bundle(b);

        let movement = world
            .system("movement")
            .query_typed::<(&mut Position, &Velocity)>("moving")
            .build(|scope: &mut SystemScope| {
                for (_e, (pos, vel)) in scope
                    .view
                    .query_typed_mut::<(&mut Position, &Velocity)>("moving")
                {
                    pos.x += vel.dx;
                    pos.y += vel.dy;
                }
            });

        world.add_schedule("update");
        world.add_system("update", movement).unwrap();

        world.run_schedule("update").unwrap();
        assert_eq!(
            world.get_component::<Position>(e).unwrap(),
            &Position { x: 9.0, y: 10.0 }
        );
        world.run_schedule("update").unwrap();
        assert_eq!(
            world.get_component::<Position>(e).unwrap(),
            &Position { x: 13.0, y: 14.0 }
        );
    }

    #[test]
    fn damage_events_drain_health_across_systems() {
        let mut world = setup_world();
        world.register_component::<Damage>("damage");
        world.add_event::<Damage>();
        world.insert_resource(Frame(0)).unwrap();

        let target = world.spawn_with(Health(10));

        let attacker = world
            .system("attacker")
            .writes::<Damage>()
            .build(|scope: &mut SystemScope| {
                scope.view.writer::<Damage>().unwrap().send(Damage { amount: 3 });
            });

        let resolver = world
            .system("resolver")
            .query_typed::<(&mut Health,)>("targets")
            .reads::<Damage>()
            .build(|scope: &mut SystemScope| {
                let mut incoming = 0;
                {
                    let mut reader = scope.view.reader::<Damage>().unwrap();
                    while let Some(hit) = reader.next() {
                        incoming += hit.amount;
                    }
                }
                for (_e, (health,)) in scope.view.query_typed_mut::<(&mut Health,)>("targets") {
                    health.0 = health.0.saturating_sub(incoming);
                }
            });

        let ticker = world
            .system("ticker")
            .resource::<Frame>()
            .build(|scope: &mut SystemScope| {
                scope.view.resource_mut::<Frame>().unwrap().0 += 1;
            });

        world.add_schedule("update");
        world.add_system("update", attacker).unwrap();
        world.add_system("update", resolver).unwrap();
        world.add_system("update", ticker).unwrap();

        world.run_schedule("update").unwrap();
        world.run_schedule("update").unwrap();

        assert_eq!(world.get_component::<Health>(target).unwrap(), &Health(4));
        assert_eq!(world.resource::<Frame>().unwrap(), &Frame(2));
    }

    #[test]
    fn despawn_during_iteration_defers_to_sync_point() {
        let mut world = setup_world();
        world.insert_resource(Frame(0)).unwrap();
        for i in 1..=4 {
            world.spawn_with(Health(i));
        }

        let reaper = world
            .system("reaper")
            .query_typed::<(&Health,)>("all")
            .resource::<Frame>()
            .build(|scope: &mut SystemScope| {
                let mut visited = 0;
                for (entity, (health,)) in scope.view.query_typed::<(&Health,)>("all") {
                    if health.0 % 2 == 0 {
                        scope.commands.entity(entity).despawn();
                    }
                    visited += 1;
                }
                scope.view.resource_mut::<Frame>().unwrap().0 = visited;
            });

        world.add_schedule("update");
        world.add_system("update", reaper).unwrap();
        world.run_schedule("update").unwrap();

        // Every row was visited; the even-health entities are gone after.
        assert_eq!(world.resource::<Frame>().unwrap(), &Frame(4));
        assert_eq!(world.entity_count(), 2);
    }

    // -- reflection integration ---------------------------------------------

    #[test]
    fn class_metadata_reads_and_writes_members() {
        let mut world = setup_world();
        world
            .registry_mut()
            .class_builder::<Position>()
            .member("x", |p: &Position| &p.x, |p: &mut Position| &mut p.x)
            .member("y", |p: &Position| &p.y, |p: &mut Position| &mut p.y)
            .register();

        let e = world.spawn_with(Position { x: 1.0, y: 2.0 });
        let key = world.registry().key_of::<Position>().unwrap();

        {
            let class = world.registry().class(key).unwrap();
            let member = class.member("x").unwrap();
            let pos = world.component_ref(e, key).unwrap();
            assert_eq!(member.get(pos).unwrap().get::<f32>().unwrap(), &1.0);
        }

        // Mutating through the erased member writes the component.
        let member = world
            .registry()
            .class(key)
            .unwrap()
            .member("x")
            .unwrap()
            .clone();
        let pos = world.component_ref_mut(e, key).unwrap();
        member.set(pos, 42.0f32).unwrap();

        assert_eq!(world.get_component::<Position>(e).unwrap().x, 42.0);
    }
}
