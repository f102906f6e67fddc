//! The [`World`]: entities, archetype tables, resources, events, and the
//! deferred command queue.
//!
//! Entity placement follows the archetype model: an entity lives in
//! exactly one table at a time, and adding or removing a component
//! migrates its row to the table for the new component set (finding or
//! creating that table on demand). Swap-remove keeps every table dense.

use std::collections::HashMap;

use tracing::debug;

use crate::archetype::{Archetype, ArchetypeId, ComponentSet};
use crate::command::{ApplyReport, CommandQueue, Commands};
use crate::entity::{Entity, EntityAllocator};
use crate::event::{EventCursor, EventReader, Events};
use crate::query::{Query, QueryCache, QueryId, QueryIter, QueryIterMut, RowIter, RowIterMut};
use crate::reflect::{Component, Ref, RefMut, TypeKey, TypeRegistry, Value};
use crate::system::{Schedules, SystemDef};
use crate::EcsError;

/// Where an entity currently lives.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Location {
    pub(crate) archetype: ArchetypeId,
    pub(crate) row: usize,
}

/// A set of component values to spawn an entity with, one per type.
#[derive(Debug, Default)]
pub struct Bundle {
    parts: Vec<(TypeKey, Value)>,
}

impl Bundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a component value.
    ///
    /// Panics if `T` is not registered or already present in the bundle;
    /// both are setup-time programming errors.
    pub fn add<T: Component>(&mut self, registry: &TypeRegistry, value: T) -> &mut Self {
        let value = match Value::new(registry, value) {
            Ok(v) => v,
            Err(_) => panic!(
                "component type {} not registered",
                std::any::type_name::<T>()
            ),
        };
        assert!(
            !self.parts.iter().any(|(key, _)| *key == value.key()),
            "duplicate component type {} in bundle",
            std::any::type_name::<T>()
        );
        self.parts.push((value.key(), value));
        self
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    fn component_set(&self) -> ComponentSet {
        self.parts.iter().map(|(key, _)| *key).collect()
    }
}

/// The ECS container. Owns all storage plus the registered systems and
/// schedules that run against it.
#[derive(Debug, Default)]
pub struct World {
    pub(crate) registry: TypeRegistry,
    pub(crate) allocator: EntityAllocator,
    /// One table per distinct component set.
    pub(crate) tables: Vec<Archetype>,
    /// Defining component set of each table, parallel to `tables`. Kept
    /// separate so command recording can consult sets while a table
    /// iterator is live.
    pub(crate) sets: Vec<ComponentSet>,
    pub(crate) archetype_index: HashMap<ComponentSet, ArchetypeId>,
    pub(crate) locations: HashMap<Entity, Location>,
    pub(crate) resources: HashMap<TypeKey, Value>,
    pub(crate) events: HashMap<TypeKey, Events>,
    pub(crate) queries: QueryCache,
    pub(crate) systems: Vec<SystemDef>,
    pub(crate) schedules: Schedules,
    pub(crate) pending: CommandQueue,
    pub(crate) stop_requested: bool,
}

impl World {
    pub fn new() -> Self {
        let mut world = Self::default();
        // Table 0 always exists: entities with no components.
        world.get_or_create_archetype(ComponentSet::empty());
        world
    }

    // -- registry -----------------------------------------------------------

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut TypeRegistry {
        &mut self.registry
    }

    /// Registers a component type under a name, returning its key.
    pub fn register_component<T: Component>(&mut self, name: &str) -> TypeKey {
        self.registry.register::<T>(name)
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Spawns an empty entity in the component-less table.
    pub fn spawn(&mut self) -> Entity {
        let entity = self.allocator.allocate();
        self.place(entity, Vec::new());
        entity
    }

    /// Spawns an entity with a single component. Panics if the type is
    /// not registered (same contract as [`Bundle::add`]).
    pub fn spawn_with<T: Component>(&mut self, value: T) -> Entity {
        let mut bundle = Bundle::new();
        bundle.add(&self.registry, value);
        self.spawn_bundle(bundle)
    }

    /// Spawns an entity with every component in the bundle.
    pub fn spawn_bundle(&mut self, bundle: Bundle) -> Entity {
        let entity = self.allocator.allocate();
        self.place(entity, bundle.parts);
        entity
    }

    /// Inserts a freshly allocated entity into the table matching its
    /// component values.
    pub(crate) fn place(&mut self, entity: Entity, parts: Vec<(TypeKey, Value)>) {
        let set: ComponentSet = parts.iter().map(|(key, _)| *key).collect();
        let archetype = self.get_or_create_archetype(set);
        let row = self.tables[archetype.index()].push_row(entity, parts);
        self.locations.insert(entity, Location { archetype, row });
    }

    /// Despawns an entity, dropping its components and recycling its
    /// index under a new generation.
    pub fn despawn(&mut self, entity: Entity) -> Result<(), EcsError> {
        let loc = self
            .locations
            .remove(&entity)
            .ok_or(EcsError::UnknownEntity(entity))?;
        if let Some(swapped) = self.tables[loc.archetype.index()].swap_remove_row(loc.row) {
            if let Some(swapped_loc) = self.locations.get_mut(&swapped) {
                swapped_loc.row = loc.row;
            }
        }
        self.allocator.deallocate(entity);
        Ok(())
    }

    /// Whether the handle refers to a live entity (including entities
    /// reserved by deferred spawn commands that have not applied yet).
    pub fn is_alive(&self, entity: Entity) -> bool {
        self.allocator.is_alive(entity)
    }

    /// Number of entities currently placed in tables.
    pub fn entity_count(&self) -> usize {
        self.locations.len()
    }

    // -- components ---------------------------------------------------------

    /// Adds a component, overwriting in place when the entity already
    /// has one of that type, otherwise migrating the entity's row to the
    /// table for its extended component set.
    pub fn add_component<T: Component>(&mut self, entity: Entity, value: T) -> Result<(), EcsError> {
        let value = Value::new(&self.registry, value)?;
        self.add_component_value(entity, value)
    }

    /// Erased variant of [`World::add_component`].
    pub fn add_component_value(&mut self, entity: Entity, value: Value) -> Result<(), EcsError> {
        let loc = *self
            .locations
            .get(&entity)
            .ok_or(EcsError::UnknownEntity(entity))?;
        let key = value.key();
        if self.sets[loc.archetype.index()].contains(key) {
            self.tables[loc.archetype.index()].overwrite(loc.row, value);
            return Ok(());
        }
        let target_set = self.sets[loc.archetype.index()].with(key);
        let target = self.get_or_create_archetype(target_set);
        let (mut parts, swapped) = self.tables[loc.archetype.index()].take_row(loc.row);
        if let Some(swapped) = swapped {
            if let Some(swapped_loc) = self.locations.get_mut(&swapped) {
                swapped_loc.row = loc.row;
            }
        }
        parts.push((key, value));
        let row = self.tables[target.index()].push_row(entity, parts);
        self.locations.insert(
            entity,
            Location {
                archetype: target,
                row,
            },
        );
        Ok(())
    }

    /// Removes a component, migrating the entity's row to the table for
    /// its reduced set. Removing a component the entity does not have is
    /// an error.
    pub fn remove_component<T: Component>(&mut self, entity: Entity) -> Result<(), EcsError> {
        let key = self
            .registry
            .key_of::<T>()
            .ok_or_else(|| EcsError::UnknownType(std::any::type_name::<T>().to_owned()))?;
        self.remove_component_key(entity, key)
    }

    /// Erased variant of [`World::remove_component`].
    pub fn remove_component_key(&mut self, entity: Entity, key: TypeKey) -> Result<(), EcsError> {
        let loc = *self
            .locations
            .get(&entity)
            .ok_or(EcsError::UnknownEntity(entity))?;
        if !self.sets[loc.archetype.index()].contains(key) {
            return Err(EcsError::ComponentNotPresent {
                entity,
                component: self.registry.info(key).name.clone(),
            });
        }
        let target_set = self.sets[loc.archetype.index()].without(key);
        let target = self.get_or_create_archetype(target_set);
        let (mut parts, swapped) = self.tables[loc.archetype.index()].take_row(loc.row);
        if let Some(swapped) = swapped {
            if let Some(swapped_loc) = self.locations.get_mut(&swapped) {
                swapped_loc.row = loc.row;
            }
        }
        // Dropping the extracted value here runs its destructor.
        parts.retain(|(k, _)| *k != key);
        let row = self.tables[target.index()].push_row(entity, parts);
        self.locations.insert(
            entity,
            Location {
                archetype: target,
                row,
            },
        );
        Ok(())
    }

    pub fn get_component<T: Component>(&self, entity: Entity) -> Result<&T, EcsError> {
        let key = self
            .registry
            .key_of::<T>()
            .ok_or_else(|| EcsError::UnknownType(std::any::type_name::<T>().to_owned()))?;
        let loc = self
            .locations
            .get(&entity)
            .ok_or(EcsError::UnknownEntity(entity))?;
        // Safety: `key` was derived from `T` through the registry.
        unsafe { self.tables[loc.archetype.index()].get::<T>(loc.row, key) }.ok_or_else(|| {
            EcsError::ComponentNotPresent {
                entity,
                component: self.registry.info(key).name.clone(),
            }
        })
    }

    pub fn get_component_mut<T: Component>(&mut self, entity: Entity) -> Result<&mut T, EcsError> {
        let key = self
            .registry
            .key_of::<T>()
            .ok_or_else(|| EcsError::UnknownType(std::any::type_name::<T>().to_owned()))?;
        let loc = *self
            .locations
            .get(&entity)
            .ok_or(EcsError::UnknownEntity(entity))?;
        let name = self.registry.info(key).name.clone();
        // Safety: `key` was derived from `T` through the registry.
        unsafe { self.tables[loc.archetype.index()].get_mut::<T>(loc.row, key) }.ok_or(
            EcsError::ComponentNotPresent {
                entity,
                component: name,
            },
        )
    }

    /// Erased borrow of one component.
    pub fn component_ref(&self, entity: Entity, key: TypeKey) -> Result<Ref<'_>, EcsError> {
        let loc = self
            .locations
            .get(&entity)
            .ok_or(EcsError::UnknownEntity(entity))?;
        self.tables[loc.archetype.index()]
            .get_ref(loc.row, key)
            .ok_or_else(|| EcsError::ComponentNotPresent {
                entity,
                component: self.registry.info(key).name.clone(),
            })
    }

    /// Erased mutable borrow of one component.
    pub fn component_ref_mut(
        &mut self,
        entity: Entity,
        key: TypeKey,
    ) -> Result<RefMut<'_>, EcsError> {
        let loc = *self
            .locations
            .get(&entity)
            .ok_or(EcsError::UnknownEntity(entity))?;
        let name = self.registry.info(key).name.clone();
        self.tables[loc.archetype.index()]
            .get_ref_mut(loc.row, key)
            .ok_or(EcsError::ComponentNotPresent {
                entity,
                component: name,
            })
    }

    pub fn has_component<T: Component>(&self, entity: Entity) -> Result<bool, EcsError> {
        match self.registry.key_of::<T>() {
            Some(key) => self.has_component_key(entity, key),
            None => Err(EcsError::UnknownType(
                std::any::type_name::<T>().to_owned(),
            )),
        }
    }

    pub fn has_component_key(&self, entity: Entity, key: TypeKey) -> Result<bool, EcsError> {
        let loc = self
            .locations
            .get(&entity)
            .ok_or(EcsError::UnknownEntity(entity))?;
        Ok(self.sets[loc.archetype.index()].contains(key))
    }

    // -- archetypes ---------------------------------------------------------

    /// Finds the table for a component set, creating it if this set has
    /// never been seen. New tables are matched against every cached
    /// query exactly once, here.
    pub(crate) fn get_or_create_archetype(&mut self, set: ComponentSet) -> ArchetypeId {
        if let Some(&id) = self.archetype_index.get(&set) {
            return id;
        }
        let id = ArchetypeId(self.tables.len() as u32);
        let infos: Vec<_> = set
            .keys()
            .iter()
            .map(|&key| self.registry.info(key).clone())
            .collect();
        self.tables.push(Archetype::new(id, infos));
        self.queries.on_new_archetype(id, &set);
        debug!(archetype = id.0, components = set.len(), "created archetype");
        self.sets.push(set.clone());
        self.archetype_index.insert(set, id);
        id
    }

    pub fn archetype_count(&self) -> usize {
        self.tables.len()
    }

    /// Tables whose component set is a superset of `required`.
    pub(crate) fn matching_archetypes(&self, required: &ComponentSet) -> Vec<ArchetypeId> {
        self.sets
            .iter()
            .enumerate()
            .filter(|(_, set)| set.contains_all(required))
            .map(|(i, _)| ArchetypeId(i as u32))
            .collect()
    }

    // -- queries ------------------------------------------------------------

    /// Resolves (or creates) the cached query for a set of required
    /// component keys. The returned id stays valid for the lifetime of
    /// the world.
    pub fn query_state(&mut self, keys: &[TypeKey]) -> QueryId {
        let set = ComponentSet::new(keys.to_vec());
        let matched = self.matching_archetypes(&set);
        self.queries.get_or_create(set, matched)
    }

    /// Erased iteration over all rows matched by a cached query.
    pub fn rows(&self, id: QueryId) -> RowIter<'_> {
        RowIter::new(&self.tables, self.queries.state(id).matched())
    }

    /// Erased iteration with mutable row access.
    pub fn rows_mut(&mut self, id: QueryId) -> RowIterMut<'_> {
        RowIterMut::new(&mut self.tables, self.queries.state(id).matched())
    }

    /// Typed read-only query over all matching entities.
    ///
    /// Panics if `Q` contains `&mut` items; use [`World::query_mut`].
    pub fn query<Q: Query>(&self) -> QueryIter<'_, Q> {
        assert!(
            !Q::HAS_MUTABLE,
            "query with &mut items requires World::query_mut"
        );
        let (keys, matched) = self.typed_query_parts::<Q>();
        QueryIter::new(&self.tables, matched, keys)
    }

    /// Typed query allowing `&mut` items. Panics if the same component
    /// type appears twice with at least one `&mut` access.
    pub fn query_mut<Q: Query>(&mut self) -> QueryIterMut<'_, Q> {
        Q::validate_access();
        let (keys, matched) = self.typed_query_parts::<Q>();
        QueryIterMut::new(&mut self.tables, matched, keys)
    }

    /// Keys and matched tables for a typed query. An unregistered item
    /// type matches nothing.
    fn typed_query_parts<Q: Query>(&self) -> (Vec<TypeKey>, Vec<ArchetypeId>) {
        let Some(keys) = Q::keys(&self.registry) else {
            return (Vec::new(), Vec::new());
        };
        let set = ComponentSet::new(keys.clone());
        let matched = match self.queries.lookup(&set) {
            Some(id) => self.queries.state(id).matched().to_vec(),
            None => self.matching_archetypes(&set),
        };
        (keys, matched)
    }

    // -- resources ----------------------------------------------------------

    /// Inserts a resource constructed with `Default`.
    pub fn add_resource<T: Component + Default>(&mut self) -> Result<(), EcsError> {
        self.insert_resource(T::default())
    }

    /// Inserts a resource value. At most one resource per type may live
    /// in the world.
    pub fn insert_resource<T: Component>(&mut self, value: T) -> Result<(), EcsError> {
        let key = self.registry.register_auto::<T>();
        let value = Value::new(&self.registry, value)?;
        if self.resources.contains_key(&key) {
            return Err(EcsError::DuplicateResource(
                self.registry.info(key).name.clone(),
            ));
        }
        self.resources.insert(key, value);
        Ok(())
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

    /// Removes a resource, returning its value.
    pub fn remove_resource<T: Component>(&mut self) -> Result<T, EcsError> {
        let missing = || EcsError::MissingResource(std::any::type_name::<T>().to_owned());
        let key = self.registry.key_of::<T>().ok_or_else(missing)?;
        let value = self.resources.remove(&key).ok_or_else(missing)?;
        value.downcast::<T>()
    }

    pub fn contains_resource<T: Component>(&self) -> bool {
        self.registry
            .key_of::<T>()
            .is_some_and(|key| self.resources.contains_key(&key))
    }

    // -- events -------------------------------------------------------------

    /// Opens the event channel for `E`. Idempotent.
    pub fn add_event<E: Component>(&mut self) -> TypeKey {
        let key = self.registry.register_auto::<E>();
        let info = self.registry.info(key).clone();
        self.events.entry(key).or_insert_with(|| Events::new(info));
        key
    }

    /// Sends one event on an open channel.
    pub fn send_event<E: Component>(&mut self, event: E) -> Result<(), EcsError> {
        let missing = || EcsError::UnknownEvent(std::any::type_name::<E>().to_owned());
        let key = self.registry.key_of::<E>().ok_or_else(missing)?;
        let events = self.events.get_mut(&key).ok_or_else(missing)?;
        events.send(event)
    }

    /// A typed reader over the channel for `E`, resuming at `cursor`.
    pub fn event_reader<'w, E: Component>(
        &'w self,
        cursor: &'w mut EventCursor,
    ) -> Result<EventReader<'w, E>, EcsError> {
        let missing = || EcsError::UnknownEvent(std::any::type_name::<E>().to_owned());
        let key = self.registry.key_of::<E>().ok_or_else(missing)?;
        let events = self.events.get(&key).ok_or_else(missing)?;
        Ok(EventReader::new(events, cursor))
    }

    /// Retires the current buffer of every channel. Events sent before
    /// this call remain readable for one more cycle, then drop.
    pub fn swap_event_buffers(&mut self) {
        for events in self.events.values_mut() {
            events.swap();
        }
    }

    pub(crate) fn events_for(&self, key: TypeKey) -> Option<&Events> {
        self.events.get(&key)
    }

    // -- deferred commands --------------------------------------------------

    /// Records structural edits to apply later via
    /// [`World::flush_commands`].
    pub fn commands(&mut self) -> Commands<'_> {
        Commands::new(
            &mut self.allocator,
            &mut self.pending,
            &self.locations,
            &self.sets,
            &self.registry,
            &mut self.stop_requested,
        )
    }

    /// Applies all queued commands in record order.
    pub fn flush_commands(&mut self) -> ApplyReport {
        let queue = std::mem::take(&mut self.pending);
        queue.apply(self)
    }
}
