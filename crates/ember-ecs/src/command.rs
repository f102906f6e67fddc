//! Deferred structural edits.
//!
//! Structural changes (spawn, insert, remove, despawn) cannot run while
//! a query iterator holds the tables, so systems record them through
//! [`Commands`] and the world applies the queue at the next sync point.
//! Application is strictly first-recorded-first-applied; a command whose
//! target has since been despawned is logged and skipped, and the rest
//! of the queue still applies.

use std::collections::HashMap;

use tracing::warn;

use crate::archetype::ComponentSet;
use crate::entity::{Entity, EntityAllocator};
use crate::reflect::{Component, TypeKey, TypeRegistry, Value};
use crate::world::{Location, World};
use crate::EcsError;

/// One recorded structural edit.
#[derive(Debug)]
pub(crate) enum CommandOp {
    /// Place a pre-allocated entity in the component-less table.
    Spawn,
    /// Insert (or overwrite) one component value.
    Insert(Value),
    /// Remove one component by key.
    Remove(TypeKey),
    /// Despawn the target entity.
    Despawn,
}

#[derive(Debug)]
pub(crate) struct Command {
    pub(crate) entity: Entity,
    pub(crate) op: CommandOp,
}

/// Counts from one queue application.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ApplyReport {
    /// Commands that mutated the world.
    pub applied: usize,
    /// Commands skipped because their target was gone or the edit was
    /// invalid by the time they applied.
    pub skipped: usize,
}

/// FIFO queue of recorded commands, applied in record order.
#[derive(Debug, Default)]
pub struct CommandQueue {
    commands: Vec<Command>,
}

impl CommandQueue {
    pub(crate) fn push(&mut self, entity: Entity, op: CommandOp) {
        self.commands.push(Command { entity, op });
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Drops all recorded commands without applying them. Entities
    /// reserved by dropped spawn commands stay allocated.
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Applies every command in record order. Failures are logged as
    /// warnings and counted, never propagated; a skipped command does
    /// not stop the ones after it.
    pub(crate) fn apply(self, world: &mut World) -> ApplyReport {
        let mut report = ApplyReport::default();
        for command in self.commands {
            let entity = command.entity;
            let result = match command.op {
                CommandOp::Spawn => {
                    if world.is_alive(entity) {
                        world.place(entity, Vec::new());
                        Ok(())
                    } else {
                        Err(EcsError::UnknownEntity(entity))
                    }
                }
                CommandOp::Insert(value) => world.add_component_value(entity, value),
                CommandOp::Remove(key) => world.remove_component_key(entity, key),
                CommandOp::Despawn => world.despawn(entity),
            };
            match result {
                Ok(()) => report.applied += 1,
                Err(error) => {
                    report.skipped += 1;
                    warn!(entity = %entity, error = %error, "deferred command skipped");
                }
            }
        }
        report
    }
}

/// Recording facade over the world's command queue.
///
/// Borrows only the pieces of the world that recording needs, so a
/// `Commands` can be constructed while table iterators are live.
pub struct Commands<'a> {
    allocator: &'a mut EntityAllocator,
    queue: &'a mut CommandQueue,
    locations: &'a HashMap<Entity, Location>,
    sets: &'a [ComponentSet],
    registry: &'a TypeRegistry,
    stop: &'a mut bool,
}

impl<'a> Commands<'a> {
    pub(crate) fn new(
        allocator: &'a mut EntityAllocator,
        queue: &'a mut CommandQueue,
        locations: &'a HashMap<Entity, Location>,
        sets: &'a [ComponentSet],
        registry: &'a TypeRegistry,
        stop: &'a mut bool,
    ) -> Self {
        Self {
            allocator,
            queue,
            locations,
            sets,
            registry,
            stop,
        }
    }

    /// Reserves an entity handle now and queues its placement. The
    /// handle is alive immediately and may be recorded against before
    /// the queue applies.
    pub fn spawn(&mut self) -> EntityCommands<'_, 'a> {
        let entity = self.allocator.allocate();
        self.queue.push(entity, CommandOp::Spawn);
        EntityCommands {
            commands: self,
            entity,
        }
    }

    /// Edits targeting an existing entity.
    pub fn entity(&mut self, entity: Entity) -> EntityCommands<'_, 'a> {
        EntityCommands {
            commands: self,
            entity,
        }
    }

    /// Asks the schedule runner to stop after the current system.
    pub fn request_stop(&mut self) {
        *self.stop = true;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Builder for commands targeting one entity.
pub struct EntityCommands<'c, 'a> {
    commands: &'c mut Commands<'a>,
    entity: Entity,
}

impl EntityCommands<'_, '_> {
    pub fn id(&self) -> Entity {
        self.entity
    }

    /// Queues a component insert. Panics if `T` is not registered, the
    /// same contract as [`Bundle::add`](crate::world::Bundle::add).
    pub fn insert<T: Component>(&mut self, value: T) -> &mut Self {
        let value = match Value::new(self.commands.registry, value) {
            Ok(v) => v,
            Err(_) => panic!(
                "component type {} not registered",
                std::any::type_name::<T>()
            ),
        };
        self.commands.queue.push(self.entity, CommandOp::Insert(value));
        self
    }

    /// Queues a component removal. Panics if `T` is not registered.
    pub fn remove<T: Component>(&mut self) -> &mut Self {
        let Some(key) = self.commands.registry.key_of::<T>() else {
            panic!(
                "component type {} not registered",
                std::any::type_name::<T>()
            );
        };
        self.remove_key(key)
    }

    /// Erased variant of [`EntityCommands::remove`].
    pub fn remove_key(&mut self, key: TypeKey) -> &mut Self {
        self.commands.queue.push(self.entity, CommandOp::Remove(key));
        self
    }

    /// Queues a despawn.
    pub fn despawn(&mut self) -> &mut Self {
        self.commands.queue.push(self.entity, CommandOp::Despawn);
        self
    }

    /// Whether the entity has a `T` component in the world right now.
    ///
    /// A live read, not a deferred one: edits recorded in this buffer
    /// stay invisible until they apply. Unplaced and unregistered both
    /// answer `false`.
    pub fn has_component<T: Component>(&self) -> bool {
        let Some(key) = self.commands.registry.key_of::<T>() else {
            return false;
        };
        self.commands
            .locations
            .get(&self.entity)
            .is_some_and(|loc| self.commands.sets[loc.archetype.index()].contains(key))
    }
}
