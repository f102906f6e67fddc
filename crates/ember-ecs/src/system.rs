//! Systems and schedules.
//!
//! A system is a named callback plus an explicit declaration of what it
//! touches: cached queries bound under local names, resources, and event
//! channels it reads or writes. Declarations are resolved against the
//! world when the system is built; resource and channel presence is
//! re-checked on every run, so a missing dependency surfaces as
//! [`EcsError::UnresolvedDependency`] instead of a panic mid-callback.
//!
//! Execution order is registration order within a schedule. After each
//! system the deferred command queue is flushed, so structural edits
//! recorded by one system are visible to the next. Event buffers swap
//! once per [`World::run_schedule`] call, at the end.

use std::collections::HashMap;
use std::fmt;

use tracing::trace;

use crate::archetype::Archetype;
use crate::command::{ApplyReport, Commands};
use crate::event::{EventCursor, EventReader, EventWriter, Events};
use crate::query::{
    Query, QueryCache, QueryId, QueryIter, QueryIterMut, RowIter, RowIterMut,
};
use crate::reflect::{Component, TypeKey, TypeRegistry, Value};
use crate::world::World;
use crate::EcsError;

/// Handle to a registered system, stable for the lifetime of the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemId(pub(crate) u32);

type SystemFn = Box<dyn FnMut(&mut SystemScope)>;

/// A registered system: its declarations plus the callback.
pub(crate) struct SystemDef {
    pub(crate) name: String,
    /// Bound queries, resolved to cached ids at build time.
    pub(crate) queries: Vec<(String, QueryId)>,
    /// Resource types the callback may access.
    pub(crate) resources: Vec<TypeKey>,
    /// Read channels, each with this system's own cursor.
    pub(crate) readers: Vec<(TypeKey, EventCursor)>,
    /// Write channels.
    pub(crate) writers: Vec<TypeKey>,
    pub(crate) callback: SystemFn,
}

impl fmt::Debug for SystemDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemDef")
            .field("name", &self.name)
            .field("queries", &self.queries)
            .field("resources", &self.resources)
            .field("readers", &self.readers)
            .field("writers", &self.writers)
            .finish_non_exhaustive()
    }
}

/// Named lists of systems, each executed in registration order.
#[derive(Debug, Default)]
pub(crate) struct Schedules {
    order: HashMap<String, Vec<SystemId>>,
}

impl Schedules {
    fn add(&mut self, key: &str) {
        self.order.entry(key.to_owned()).or_default();
    }

    fn push(&mut self, key: &str, id: SystemId) -> Result<(), EcsError> {
        self.order
            .get_mut(key)
            .ok_or_else(|| EcsError::UnknownSchedule(key.to_owned()))?
            .push(id);
        Ok(())
    }

    fn systems(&self, key: &str) -> Result<&[SystemId], EcsError> {
        self.order
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| EcsError::UnknownSchedule(key.to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds one system declaration against a world.
pub struct SystemBuilder<'w> {
    world: &'w mut World,
    name: String,
    queries: Vec<(String, QueryId)>,
    resources: Vec<TypeKey>,
    readers: Vec<(TypeKey, EventCursor)>,
    writers: Vec<TypeKey>,
}

impl<'w> SystemBuilder<'w> {
    /// Binds a cached query under a local name the callback will use.
    pub fn query(mut self, name: &str, keys: &[TypeKey]) -> Self {
        let id = self.world.query_state(keys);
        self.queries.push((name.to_owned(), id));
        self
    }

    /// Binds a query derived from a typed tuple. Panics if any item
    /// type is unregistered; binding is setup, not simulation.
    pub fn query_typed<Q: Query>(mut self, name: &str) -> Self {
        let keys = Q::keys(self.world.registry()).unwrap_or_else(|| {
            panic!(
                "system '{}' binds query '{}' over an unregistered component type",
                self.name, name
            )
        });
        let id = self.world.query_state(&keys);
        self.queries.push((name.to_owned(), id));
        self
    }

    /// Declares access to the resource of type `T`.
    pub fn resource<T: Component>(mut self) -> Self {
        let key = self.world.registry.register_auto::<T>();
        self.resources.push(key);
        self
    }

    /// Declares a read dependency on the channel for `E`. Each system
    /// gets its own cursor, advanced across runs.
    pub fn reads<E: Component>(mut self) -> Self {
        let key = self.world.registry.register_auto::<E>();
        self.readers.push((key, EventCursor::default()));
        self
    }

    /// Declares a write dependency on the channel for `E`.
    pub fn writes<E: Component>(mut self) -> Self {
        let key = self.world.registry.register_auto::<E>();
        self.writers.push(key);
        self
    }

    /// Registers the system. Panics on a duplicate system name.
    pub fn build<F>(self, callback: F) -> SystemId
    where
        F: FnMut(&mut SystemScope) + 'static,
    {
        assert!(
            !self.world.systems.iter().any(|s| s.name == self.name),
            "duplicate system name: {:?}",
            self.name
        );
        let id = SystemId(self.world.systems.len() as u32);
        self.world.systems.push(SystemDef {
            name: self.name,
            queries: self.queries,
            resources: self.resources,
            readers: self.readers,
            writers: self.writers,
            callback: Box::new(callback),
        });
        id
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// What a system callback receives: the world's data through
/// [`WorldView`], and deferred structural edits through [`Commands`].
/// The two borrow disjoint parts of the world, so commands can be
/// recorded while a query iterator from the view is live.
pub struct SystemScope<'a> {
    pub view: WorldView<'a>,
    pub commands: Commands<'a>,
}

/// Read/write access to tables, resources, and events, restricted to
/// what the running system declared.
pub struct WorldView<'a> {
    system_name: &'a str,
    tables: &'a mut Vec<Archetype>,
    queries: &'a QueryCache,
    registry: &'a TypeRegistry,
    resources: &'a mut HashMap<TypeKey, Value>,
    events: &'a mut HashMap<TypeKey, Events>,
    bound: &'a [(String, QueryId)],
    readers: &'a mut [(TypeKey, EventCursor)],
    writers: &'a [TypeKey],
}

impl<'a> WorldView<'a> {
    fn bound_query(&self, name: &str) -> QueryId {
        self.bound
            .iter()
            .find(|(n, _)| n == name)
            .map(|&(_, id)| id)
            .unwrap_or_else(|| {
                panic!("system '{}' has no bound query '{name}'", self.system_name)
            })
    }

    fn typed_keys<Q: Query>(&self, name: &str) -> Vec<TypeKey> {
        Q::keys(self.registry).unwrap_or_else(|| {
            panic!(
                "system '{}' query '{name}' names an unregistered component type",
                self.system_name
            )
        })
    }

    /// Erased read-only iteration over a bound query's rows.
    pub fn query(&self, name: &str) -> RowIter<'_> {
        let id = self.bound_query(name);
        RowIter::new(self.tables.as_slice(), self.queries.state(id).matched())
    }

    /// Erased iteration with mutable row access.
    pub fn query_mut(&mut self, name: &str) -> RowIterMut<'_> {
        let id = self.bound_query(name);
        let matched = self.queries.state(id).matched();
        RowIterMut::new(self.tables.as_mut_slice(), matched)
    }

    /// Typed read-only iteration over a bound query.
    ///
    /// Panics if `Q` contains `&mut` items; use
    /// [`WorldView::query_typed_mut`].
    pub fn query_typed<Q: Query>(&self, name: &str) -> QueryIter<'_, Q> {
        assert!(
            !Q::HAS_MUTABLE,
            "query with &mut items requires WorldView::query_typed_mut"
        );
        let id = self.bound_query(name);
        let keys = self.typed_keys::<Q>(name);
        let matched = self.queries.state(id).matched().to_vec();
        QueryIter::new(self.tables.as_slice(), matched, keys)
    }

    /// Typed iteration allowing `&mut` items.
    pub fn query_typed_mut<Q: Query>(&mut self, name: &str) -> QueryIterMut<'_, Q> {
        Q::validate_access();
        let id = self.bound_query(name);
        let keys = self.typed_keys::<Q>(name);
        let matched = self.queries.state(id).matched().to_vec();
        QueryIterMut::new(self.tables.as_mut_slice(), matched, keys)
    }

    pub fn resource<T: Component>(&self) -> Result<&T, EcsError> {
        let missing = || EcsError::MissingResource(std::any::type_name::<T>().to_owned());
        let key = self.registry.key_of::<T>().ok_or_else(missing)?;
        let value = self.resources.get(&key).ok_or_else(missing)?;
        value.as_ref().get::<T>()
    }

    pub fn resource_mut<T: Component>(&mut self) -> Result<&mut T, EcsError> {
        let missing = || EcsError::MissingResource(std::any::type_name::<T>().to_owned());
        let key = self.registry.key_of::<T>().ok_or_else(missing)?;
        let value = self.resources.get_mut(&key).ok_or_else(missing)?;
        value.as_ref_mut().into_mut::<T>()
    }

    /// A reader over the declared channel for `E`, resuming at this
    /// system's own cursor.
    pub fn reader<E: Component>(&mut self) -> Result<EventReader<'_, E>, EcsError> {
        let undeclared = || EcsError::UnresolvedDependency {
            system: self.system_name.to_owned(),
            dependency: std::any::type_name::<E>().to_owned(),
        };
        let key = self.registry.key_of::<E>().ok_or_else(undeclared)?;
        let cursor = self
            .readers
            .iter_mut()
            .find(|(k, _)| *k == key)
            .map(|(_, cursor)| cursor)
            .ok_or_else(undeclared)?;
        let events = self.events.get(&key).ok_or_else(undeclared)?;
        Ok(EventReader::new(events, cursor))
    }

    /// A writer into the declared channel for `E`.
    pub fn writer<E: Component>(&mut self) -> Result<EventWriter<'_, E>, EcsError> {
        let undeclared = || EcsError::UnresolvedDependency {
            system: self.system_name.to_owned(),
            dependency: std::any::type_name::<E>().to_owned(),
        };
        let key = self.registry.key_of::<E>().ok_or_else(undeclared)?;
        if !self.writers.contains(&key) {
            return Err(undeclared());
        }
        let events = self.events.get_mut(&key).ok_or_else(undeclared)?;
        Ok(EventWriter::new(events))
    }
}

// ---------------------------------------------------------------------------
// Running
// ---------------------------------------------------------------------------

impl World {
    /// Starts building a system. Declarations are resolved against this
    /// world; [`SystemBuilder::build`] registers the callback.
    pub fn system(&mut self, name: &str) -> SystemBuilder<'_> {
        SystemBuilder {
            world: self,
            name: name.to_owned(),
            queries: Vec::new(),
            resources: Vec::new(),
            readers: Vec::new(),
            writers: Vec::new(),
        }
    }

    /// Creates an empty schedule. Idempotent.
    pub fn add_schedule(&mut self, key: &str) {
        self.schedules.add(key);
    }

    /// Appends a system to a schedule; execution order is append order.
    pub fn add_system(&mut self, schedule: &str, id: SystemId) -> Result<(), EcsError> {
        self.schedules.push(schedule, id)
    }

    /// Runs one system and flushes the commands it recorded. Event
    /// buffers do not swap here; that happens once per
    /// [`World::run_schedule`].
    pub fn run_system(&mut self, id: SystemId) -> Result<ApplyReport, EcsError> {
        let index = id.0 as usize;

        // Declared dependencies must be present before the callback runs.
        {
            let system = &self.systems[index];
            for &key in &system.resources {
                if !self.resources.contains_key(&key) {
                    return Err(EcsError::UnresolvedDependency {
                        system: system.name.clone(),
                        dependency: self.registry.info(key).name.clone(),
                    });
                }
            }
            for key in system
                .readers
                .iter()
                .map(|(k, _)| *k)
                .chain(system.writers.iter().copied())
            {
                if !self.events.contains_key(&key) {
                    return Err(EcsError::UnresolvedDependency {
                        system: system.name.clone(),
                        dependency: self.registry.info(key).name.clone(),
                    });
                }
            }
        }

        {
            let SystemDef {
                name,
                queries: bound,
                readers,
                writers,
                callback,
                ..
            } = &mut self.systems[index];
            trace!(system = %name, "running system");
            let mut scope = SystemScope {
                view: WorldView {
                    system_name: name,
                    tables: &mut self.tables,
                    queries: &self.queries,
                    registry: &self.registry,
                    resources: &mut self.resources,
                    events: &mut self.events,
                    bound,
                    readers,
                    writers,
                },
                commands: Commands::new(
                    &mut self.allocator,
                    &mut self.pending,
                    &self.locations,
                    &self.sets,
                    &self.registry,
                    &mut self.stop_requested,
                ),
            };
            (callback)(&mut scope);
        }

        Ok(self.flush_commands())
    }

    /// Runs every system in the schedule in order. Commands flush after
    /// each system; a stop request recorded by one system skips the
    /// rest. All event buffers swap once, after the last system.
    pub fn run_schedule(&mut self, key: &str) -> Result<(), EcsError> {
        let systems = self.schedules.systems(key)?.to_vec();
        self.stop_requested = false;
        for id in systems {
            self.run_system(id)?;
            if self.stop_requested {
                break;
            }
        }
        self.swap_event_buffers();
        Ok(())
    }
}
