//! Queries: cached archetype matching plus row iteration.
//!
//! A query names a set of required component types. Matching is cached
//! in [`QueryCache`]: each archetype is tested against each cached query
//! exactly once, when the archetype is created, so repeated runs reuse
//! the matched-table list. Iteration comes in an erased flavor
//! ([`RowIter`]/[`RowIterMut`], yielding [`Ref`]/[`RefMut`] handles) and
//! a typed flavor (`(&A, &mut B)` tuples up to four items).
//!
//! ## Soundness
//!
//! Read-only typed queries go through [`World::query`] (`&self`).
//! Queries with `&mut T` items go through [`World::query_mut`]
//! (`&mut self`), so the pointer casts in the mutable fetch paths are
//! backed by an exclusive borrow of the storage.

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;

use crate::archetype::{Archetype, ArchetypeId, ComponentSet};
use crate::entity::Entity;
use crate::reflect::{Ref, RefMut, TypeKey, TypeRegistry};

/// Handle to a cached query, stable for the lifetime of the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(pub(crate) u32);

/// One cached query: the required set plus every table matched so far.
#[derive(Debug)]
pub struct QueryState {
    set: ComponentSet,
    matched: Vec<ArchetypeId>,
}

impl QueryState {
    pub fn set(&self) -> &ComponentSet {
        &self.set
    }

    pub(crate) fn matched(&self) -> &[ArchetypeId] {
        &self.matched
    }
}

#[derive(Debug, Default)]
pub(crate) struct QueryCache {
    states: Vec<QueryState>,
    index: HashMap<ComponentSet, QueryId>,
}

impl QueryCache {
    pub(crate) fn get_or_create(&mut self, set: ComponentSet, matched: Vec<ArchetypeId>) -> QueryId {
        if let Some(&id) = self.index.get(&set) {
            return id;
        }
        let id = QueryId(self.states.len() as u32);
        self.index.insert(set.clone(), id);
        self.states.push(QueryState { set, matched });
        id
    }

    pub(crate) fn lookup(&self, set: &ComponentSet) -> Option<QueryId> {
        self.index.get(set).copied()
    }

    pub(crate) fn state(&self, id: QueryId) -> &QueryState {
        &self.states[id.0 as usize]
    }

    /// Called once per new archetype; extends every matching query.
    pub(crate) fn on_new_archetype(&mut self, id: ArchetypeId, set: &ComponentSet) {
        for state in &mut self.states {
            if set.contains_all(&state.set) {
                state.matched.push(id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Erased iteration
// ---------------------------------------------------------------------------

/// One matched row; hands out erased component borrows.
#[derive(Clone, Copy)]
pub struct RowRef<'w> {
    table: &'w Archetype,
    row: usize,
}

impl<'w> RowRef<'w> {
    pub fn entity(&self) -> Entity {
        self.table.entities()[self.row]
    }

    pub fn get(&self, key: TypeKey) -> Option<Ref<'w>> {
        self.table.get_ref(self.row, key)
    }
}

/// Erased read-only iteration over the rows of the matched tables.
pub struct RowIter<'w> {
    tables: &'w [Archetype],
    matched: &'w [ArchetypeId],
    arch_cursor: usize,
    row_cursor: usize,
}

impl<'w> RowIter<'w> {
    pub(crate) fn new(tables: &'w [Archetype], matched: &'w [ArchetypeId]) -> Self {
        Self {
            tables,
            matched,
            arch_cursor: 0,
            row_cursor: 0,
        }
    }
}

impl<'w> Iterator for RowIter<'w> {
    type Item = RowRef<'w>;

    fn next(&mut self) -> Option<Self::Item> {
        let tables = self.tables;
        loop {
            let &id = self.matched.get(self.arch_cursor)?;
            let table = &tables[id.index()];
            if self.row_cursor < table.len() {
                let row = self.row_cursor;
                self.row_cursor += 1;
                return Some(RowRef { table, row });
            }
            self.arch_cursor += 1;
            self.row_cursor = 0;
        }
    }
}

/// One matched row with mutable access.
pub struct RowMut<'w> {
    table: &'w Archetype,
    row: usize,
}

impl<'w> RowMut<'w> {
    pub fn entity(&self) -> Entity {
        self.table.entities()[self.row]
    }

    pub fn get(&self, key: TypeKey) -> Option<Ref<'w>> {
        self.table.get_ref(self.row, key)
    }

    /// Erased mutable borrow of one component of this row.
    pub fn get_mut(&mut self, key: TypeKey) -> Option<RefMut<'w>> {
        let r = self.table.get_ref(self.row, key)?;
        // Safety: the iterator was constructed from `&mut` storage and
        // yields each row at most once, so this row is exclusively ours.
        Some(unsafe { RefMut::from_raw(r.as_ptr() as *mut u8, r.info()) })
    }
}

/// Erased iteration with per-row mutable access. Constructed only from
/// an exclusive borrow of the table storage.
pub struct RowIterMut<'w> {
    tables: &'w [Archetype],
    matched: &'w [ArchetypeId],
    arch_cursor: usize,
    row_cursor: usize,
    _exclusive: PhantomData<&'w mut Archetype>,
}

impl<'w> RowIterMut<'w> {
    pub(crate) fn new(tables: &'w mut [Archetype], matched: &'w [ArchetypeId]) -> Self {
        Self {
            tables: &*tables,
            matched,
            arch_cursor: 0,
            row_cursor: 0,
            _exclusive: PhantomData,
        }
    }
}

impl<'w> Iterator for RowIterMut<'w> {
    type Item = RowMut<'w>;

    fn next(&mut self) -> Option<Self::Item> {
        let tables = self.tables;
        loop {
            let &id = self.matched.get(self.arch_cursor)?;
            let table = &tables[id.index()];
            if self.row_cursor < table.len() {
                let row = self.row_cursor;
                self.row_cursor += 1;
                return Some(RowMut { table, row });
            }
            self.arch_cursor += 1;
            self.row_cursor = 0;
        }
    }
}

// ---------------------------------------------------------------------------
// Typed queries
// ---------------------------------------------------------------------------

/// One element of a typed query tuple: `&T` (read) or `&mut T` (write).
pub trait QueryItem {
    /// The output yielded per row.
    type Item<'w>;
    /// Whether this item borrows mutably.
    const MUTABLE: bool;
    /// Rust type identity, for access-conflict validation.
    fn rust_type_id() -> TypeId;
    /// Key of the accessed component type, if registered.
    fn key(registry: &TypeRegistry) -> Option<TypeKey>;
    /// Fetch one item from a table row.
    ///
    /// For `&mut T` items the caller must hold exclusive access to the
    /// table storage; the typed iterators guarantee this through their
    /// constructors.
    fn fetch(table: &Archetype, key: TypeKey, row: usize) -> Self::Item<'_>;
}

impl<T: 'static> QueryItem for &T {
    type Item<'w> = &'w T;
    const MUTABLE: bool = false;

    fn rust_type_id() -> TypeId {
        TypeId::of::<T>()
    }

    fn key(registry: &TypeRegistry) -> Option<TypeKey> {
        registry.key_of::<T>()
    }

    fn fetch(table: &Archetype, key: TypeKey, row: usize) -> Self::Item<'_> {
        // Safety: `key` resolves `T` through the registry, and the
        // iterator only visits in-bounds rows of matching tables.
        unsafe { table.get::<T>(row, key) }.expect("matched table must contain queried component")
    }
}

impl<T: 'static> QueryItem for &mut T {
    type Item<'w> = &'w mut T;
    const MUTABLE: bool = true;

    fn rust_type_id() -> TypeId {
        TypeId::of::<T>()
    }

    fn key(registry: &TypeRegistry) -> Option<TypeKey> {
        registry.key_of::<T>()
    }

    fn fetch(table: &Archetype, key: TypeKey, row: usize) -> Self::Item<'_> {
        // Safety: mutable fetches only run inside iterators constructed
        // from `&mut` storage, and access validation rejects duplicate
        // mutable access to the same type, so this reference is unique.
        unsafe {
            let ptr = table
                .get_raw(row, key)
                .expect("matched table must contain queried component");
            &mut *(ptr as *mut T)
        }
    }
}

/// A tuple of query items: `(&A,)`, `(&mut A, &B)`, up to four items.
pub trait Query {
    type Item<'w>;
    const HAS_MUTABLE: bool;
    /// Required keys in tuple order. `None` when any item's type is
    /// unregistered (such a query matches nothing).
    fn keys(registry: &TypeRegistry) -> Option<Vec<TypeKey>>;
    /// Panics when the tuple aliases a mutably accessed type.
    fn validate_access();
    fn fetch_row<'w>(table: &'w Archetype, keys: &[TypeKey], row: usize) -> Self::Item<'w>;
}

/// Rejects `&mut T` together with any other access to `T`.
fn validate_no_access_conflicts(items: &[(bool, TypeId)]) {
    for (i, &(mutable, type_id)) in items.iter().enumerate() {
        if !mutable {
            continue;
        }
        for (j, &(_, other)) in items.iter().enumerate() {
            if i != j && type_id == other {
                panic!("query aliases a mutably accessed component type");
            }
        }
    }
}

macro_rules! impl_query_tuple {
    ($(($($name:ident $idx:tt),+))+) => {
        $(
            impl<$($name: QueryItem),+> Query for ($($name,)+) {
                type Item<'w> = ($($name::Item<'w>,)+);
                const HAS_MUTABLE: bool = $($name::MUTABLE)||+;

                fn keys(registry: &TypeRegistry) -> Option<Vec<TypeKey>> {
                    Some(vec![$($name::key(registry)?),+])
                }

                fn validate_access() {
                    validate_no_access_conflicts(&[
                        $(($name::MUTABLE, $name::rust_type_id())),+
                    ]);
                }

                fn fetch_row<'w>(
                    table: &'w Archetype,
                    keys: &[TypeKey],
                    row: usize,
                ) -> Self::Item<'w> {
                    ($($name::fetch(table, keys[$idx], row),)+)
                }
            }
        )+
    };
}

impl_query_tuple! {
    (A 0)
    (A 0, B 1)
    (A 0, B 1, C 2)
    (A 0, B 1, C 2, D 3)
}

/// Typed read-only iterator yielding `(Entity, Q::Item)`.
pub struct QueryIter<'w, Q: Query> {
    tables: &'w [Archetype],
    matched: Vec<ArchetypeId>,
    keys: Vec<TypeKey>,
    arch_cursor: usize,
    row_cursor: usize,
    _marker: PhantomData<Q>,
}

impl<'w, Q: Query> QueryIter<'w, Q> {
    pub(crate) fn new(tables: &'w [Archetype], matched: Vec<ArchetypeId>, keys: Vec<TypeKey>) -> Self {
        Self {
            tables,
            matched,
            keys,
            arch_cursor: 0,
            row_cursor: 0,
            _marker: PhantomData,
        }
    }
}

impl<'w, Q: Query> Iterator for QueryIter<'w, Q> {
    type Item = (Entity, Q::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        let tables = self.tables;
        loop {
            let &id = self.matched.get(self.arch_cursor)?;
            let table = &tables[id.index()];
            if self.row_cursor < table.len() {
                let row = self.row_cursor;
                self.row_cursor += 1;
                let entity = table.entities()[row];
                return Some((entity, Q::fetch_row(table, &self.keys, row)));
            }
            self.arch_cursor += 1;
            self.row_cursor = 0;
        }
    }
}

/// Typed iterator allowing `&mut` items. The constructor takes the
/// storage by exclusive borrow; that borrow backs every mutable
/// reference this iterator yields.
pub struct QueryIterMut<'w, Q: Query> {
    tables: &'w [Archetype],
    matched: Vec<ArchetypeId>,
    keys: Vec<TypeKey>,
    arch_cursor: usize,
    row_cursor: usize,
    _marker: PhantomData<(Q, &'w mut Archetype)>,
}

impl<'w, Q: Query> QueryIterMut<'w, Q> {
    pub(crate) fn new(
        tables: &'w mut [Archetype],
        matched: Vec<ArchetypeId>,
        keys: Vec<TypeKey>,
    ) -> Self {
        Self {
            tables: &*tables,
            matched,
            keys,
            arch_cursor: 0,
            row_cursor: 0,
            _marker: PhantomData,
        }
    }
}

impl<'w, Q: Query> Iterator for QueryIterMut<'w, Q> {
    type Item = (Entity, Q::Item<'w>);

    fn next(&mut self) -> Option<Self::Item> {
        let tables = self.tables;
        loop {
            let &id = self.matched.get(self.arch_cursor)?;
            let table = &tables[id.index()];
            if self.row_cursor < table.len() {
                let row = self.row_cursor;
                self.row_cursor += 1;
                let entity = table.entities()[row];
                return Some((entity, Q::fetch_row(table, &self.keys, row)));
            }
            self.arch_cursor += 1;
            self.row_cursor = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::world::{Bundle, World};

    #[derive(Debug, Clone, PartialEq)]
    struct Pos {
        x: f32,
        y: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Vel {
        dx: f32,
        dy: f32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Health(u32);

    fn setup_world() -> World {
        let mut world = World::new();
        world.register_component::<Pos>("position");
        world.register_component::<Vel>("velocity");
        world.register_component::<Health>("health");
        world
    }

    #[test]
    fn query_yields_matching_rows_only() {
        let mut world = setup_world();

        let mut b = Bundle::new();
        b.add(world.registry(), Pos { x: 1.0, y: 2.0 });
        b.add(world.registry(), Vel { dx: 3.0, dy: 4.0 });
        let e1 = world.spawn_bundle(b);

        let _e2 = world.spawn_with(Pos { x: 10.0, y: 20.0 });

        let results: Vec<_> = world.query::<(&Pos, &Vel)>().collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, e1);
        assert_eq!(results[0].1 .0, &Pos { x: 1.0, y: 2.0 });
        assert_eq!(results[0].1 .1, &Vel { dx: 3.0, dy: 4.0 });
    }

    #[test]
    fn query_spans_multiple_archetypes() {
        let mut world = setup_world();

        world.spawn_with(Pos { x: 1.0, y: 0.0 });
        let mut b = Bundle::new();
        b.add(world.registry(), Pos { x: 2.0, y: 0.0 });
        b.add(world.registry(), Vel { dx: 0.0, dy: 0.0 });
        world.spawn_bundle(b);

        let results: Vec<_> = world.query::<(&Pos,)>().collect();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn mutable_query_modifies_in_place() {
        let mut world = setup_world();

        let mut b = Bundle::new();
        b.add(world.registry(), Pos { x: 5.0, y: 6.0 });
        b.add(world.registry(), Vel { dx: 4.0, dy: 4.0 });
        let e = world.spawn_bundle(b);

        for (_entity, (pos, vel)) in world.query_mut::<(&mut Pos, &Vel)>() {
            pos.x += vel.dx;
            pos.y += vel.dy;
        }

        assert_eq!(
            world.get_component::<Pos>(e).unwrap(),
            &Pos { x: 9.0, y: 10.0 }
        );
    }

    #[test]
    fn unregistered_item_type_matches_nothing() {
        #[derive(Debug, Clone, PartialEq)]
        struct NeverRegistered;

        let mut world = setup_world();
        world.spawn_with(Pos { x: 0.0, y: 0.0 });
        assert_eq!(world.query::<(&NeverRegistered,)>().count(), 0);
    }

    #[test]
    #[should_panic(expected = "requires World::query_mut")]
    fn read_query_rejects_mutable_items() {
        let mut world = setup_world();
        world.spawn_with(Pos { x: 0.0, y: 0.0 });
        let _ = world.query::<(&mut Pos,)>().count();
    }

    #[test]
    #[should_panic(expected = "aliases a mutably accessed component type")]
    fn aliased_mutable_access_rejected() {
        let mut world = setup_world();
        world.spawn_with(Pos { x: 0.0, y: 0.0 });
        let _ = world.query_mut::<(&mut Pos, &Pos)>().count();
    }

    #[test]
    fn cached_query_sees_archetypes_created_later() {
        let mut world = setup_world();
        let pos_key = world.registry().key_of::<Pos>().unwrap();
        let id = world.query_state(&[pos_key]);

        world.spawn_with(Pos { x: 1.0, y: 1.0 });
        assert_eq!(world.rows(id).count(), 1);

        // A new archetype that also carries Pos joins the cached query.
        let mut b = Bundle::new();
        b.add(world.registry(), Pos { x: 2.0, y: 2.0 });
        b.add(world.registry(), Vel { dx: 0.0, dy: 0.0 });
        world.spawn_bundle(b);
        assert_eq!(world.rows(id).count(), 2);

        // Requesting the same set again returns the same cached state.
        assert_eq!(world.query_state(&[pos_key]), id);
    }

    #[test]
    fn erased_rows_expose_components() {
        let mut world = setup_world();
        let pos_key = world.registry().key_of::<Pos>().unwrap();
        let vel_key = world.registry().key_of::<Vel>().unwrap();
        let id = world.query_state(&[pos_key]);

        let e = world.spawn_with(Pos { x: 3.0, y: 4.0 });

        let rows: Vec<_> = world.rows(id).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].entity(), e);
        let pos = rows[0].get(pos_key).unwrap();
        assert_eq!(pos.get::<Pos>().unwrap(), &Pos { x: 3.0, y: 4.0 });
        assert!(rows[0].get(vel_key).is_none());

        for mut row in world.rows_mut(id) {
            let mut pos = row.get_mut(pos_key).unwrap();
            pos.get_mut::<Pos>().unwrap().x = 0.0;
        }
        assert_eq!(world.get_component::<Pos>(e).unwrap().x, 0.0);
    }
}
