//! Archetype tables: SoA storage for entities sharing a component set.
//!
//! An [`Archetype`] stores every entity whose component set is exactly the
//! same, one type-erased [`Column`] per component type plus a parallel
//! `Vec<Entity>` mapping row index to entity. Removal is swap-remove, so
//! rows stay dense and iteration never skips holes.
//!
//! # Safety
//!
//! [`Column`] manages raw byte buffers. Each column carries the
//! [`TypeInfo`] of its element type, so layout, drop, and clone always
//! come from the same descriptor the bytes were written with. Row bounds
//! are the caller's responsibility on the `unsafe` accessors.

use std::alloc::{self, Layout};
use std::ptr;
use std::sync::Arc;

use crate::entity::Entity;
use crate::reflect::{alloc_buffer, Ref, RefMut, TypeInfo, TypeKey, Value};

/// Identifies an archetype within the world. Indexes into the world's
/// table list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArchetypeId(pub(crate) u32);

impl ArchetypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Canonical identity of an archetype: its component keys, sorted and
/// deduplicated. Two sets compare equal iff they contain the same types,
/// regardless of construction order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ComponentSet(Box<[TypeKey]>);

impl ComponentSet {
    pub fn new(mut keys: Vec<TypeKey>) -> Self {
        keys.sort_unstable();
        keys.dedup();
        Self(keys.into_boxed_slice())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn contains(&self, key: TypeKey) -> bool {
        self.0.binary_search(&key).is_ok()
    }

    /// Whether every key of `required` is present in `self`.
    pub fn contains_all(&self, required: &ComponentSet) -> bool {
        required.0.iter().all(|&key| self.contains(key))
    }

    /// The set extended by `key`.
    pub fn with(&self, key: TypeKey) -> Self {
        let mut keys = self.0.to_vec();
        keys.push(key);
        Self::new(keys)
    }

    /// The set with `key` removed.
    pub fn without(&self, key: TypeKey) -> Self {
        let keys = self.0.iter().copied().filter(|&k| k != key).collect();
        Self(keys)
    }

    #[inline]
    pub fn keys(&self) -> &[TypeKey] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<TypeKey> for ComponentSet {
    fn from_iter<I: IntoIterator<Item = TypeKey>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// A type-erased, densely packed array of values of a single type.
///
/// A manually managed byte buffer; layout and drop/clone come from the
/// [`TypeInfo`] the column was created with.
pub struct Column {
    /// Heap allocation; null while capacity is zero and for zero-sized
    /// element types.
    data: *mut u8,
    len: usize,
    capacity: usize,
    info: Arc<TypeInfo>,
}

// The column only stores bytes of `Component` types, which are Send + Sync.
unsafe impl Send for Column {}
unsafe impl Sync for Column {}

impl Column {
    pub fn new(info: Arc<TypeInfo>) -> Self {
        Self {
            data: ptr::null_mut(),
            len: 0,
            capacity: 0,
            info,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn item_size(&self) -> usize {
        self.info.size()
    }

    fn layout_for_capacity(&self, cap: usize) -> Option<Layout> {
        if self.item_size() == 0 || cap == 0 {
            return None;
        }
        Layout::from_size_align(self.item_size() * cap, self.info.align()).ok()
    }

    fn grow_if_needed(&mut self) {
        if self.len < self.capacity {
            return;
        }
        let new_cap = if self.capacity == 0 {
            4
        } else {
            self.capacity * 2
        };
        if self.item_size() == 0 {
            // ZST: bookkeeping only, no allocation.
            self.capacity = new_cap;
            return;
        }
        let new_layout = self
            .layout_for_capacity(new_cap)
            .expect("column layout overflow");
        unsafe {
            let new_data = if self.capacity == 0 {
                alloc::alloc(new_layout)
            } else {
                let old_layout = self
                    .layout_for_capacity(self.capacity)
                    .expect("old layout must be valid");
                alloc::realloc(self.data, old_layout, new_layout.size())
            };
            if new_data.is_null() {
                alloc::handle_alloc_error(new_layout);
            }
            self.data = new_data;
        }
        self.capacity = new_cap;
    }

    #[inline]
    fn ptr_at(&self, index: usize) -> *mut u8 {
        debug_assert!(index < self.len);
        if self.item_size() == 0 {
            return self.info.dangling();
        }
        unsafe { self.data.add(index * self.item_size()) }
    }

    /// Pushes a value onto the end of the column.
    ///
    /// # Safety
    /// `value_ptr` must point to a valid, initialized value of the
    /// column's element type. Ownership moves into the column; the
    /// caller must not drop the source.
    pub unsafe fn push_raw(&mut self, value_ptr: *const u8) {
        self.grow_if_needed();
        if self.item_size() > 0 {
            let dst = self.data.add(self.len * self.item_size());
            ptr::copy_nonoverlapping(value_ptr, dst, self.item_size());
        }
        self.len += 1;
    }

    /// Raw pointer to the element at `index`.
    ///
    /// # Safety
    /// `index` must be less than `self.len`.
    #[inline]
    pub unsafe fn get_raw(&self, index: usize) -> *const u8 {
        self.ptr_at(index)
    }

    /// Mutable raw pointer to the element at `index`.
    ///
    /// # Safety
    /// `index` must be less than `self.len`.
    #[inline]
    pub unsafe fn get_raw_mut(&mut self, index: usize) -> *mut u8 {
        self.ptr_at(index)
    }

    /// Drops the element at `index` and moves the last element into its
    /// place.
    ///
    /// # Safety
    /// `index` must be less than `self.len`.
    pub unsafe fn swap_remove(&mut self, index: usize) {
        debug_assert!(index < self.len);
        let last = self.len - 1;
        (self.info.vtable.drop_fn)(self.ptr_at(index));
        if self.item_size() > 0 && index != last {
            let src = self.ptr_at(last);
            let dst = self.data.add(index * self.item_size());
            ptr::copy_nonoverlapping(src, dst, self.item_size());
        }
        self.len -= 1;
    }

    /// Moves the element at `index` out into an owned [`Value`] instead
    /// of dropping it; the last element fills the gap.
    ///
    /// # Safety
    /// `index` must be less than `self.len`.
    pub unsafe fn swap_remove_into(&mut self, index: usize) -> Value {
        debug_assert!(index < self.len);
        let last = self.len - 1;
        let buf = alloc_buffer(&self.info);
        if self.item_size() > 0 {
            ptr::copy_nonoverlapping(self.ptr_at(index), buf, self.item_size());
            if index != last {
                let src = self.ptr_at(last);
                let dst = self.data.add(index * self.item_size());
                ptr::copy_nonoverlapping(src, dst, self.item_size());
            }
        }
        self.len -= 1;
        Value::from_buffer(buf, self.info.clone())
    }

    /// Drops the element at `index` in place and moves ownership of
    /// `value` into the slot.
    ///
    /// # Safety
    /// `index` must be less than `self.len`, and `value` must erase the
    /// column's element type.
    pub unsafe fn overwrite(&mut self, index: usize, mut value: Value) {
        debug_assert!(index < self.len);
        debug_assert_eq!(value.key(), self.info.key);
        (self.info.vtable.drop_fn)(self.ptr_at(index));
        if self.item_size() > 0 {
            ptr::copy_nonoverlapping(value.as_ptr(), self.ptr_at(index), self.item_size());
        }
        value.mark_moved();
    }
}

impl Drop for Column {
    fn drop(&mut self) {
        unsafe {
            for i in 0..self.len {
                (self.info.vtable.drop_fn)(self.ptr_at(i));
            }
            if let Some(layout) = self.layout_for_capacity(self.capacity) {
                alloc::dealloc(self.data, layout);
            }
        }
    }
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("type", &self.info.name)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Storage table for one component set. Columns are kept sorted by
/// [`TypeKey`] for deterministic order and binary-search lookups.
#[derive(Debug)]
pub struct Archetype {
    id: ArchetypeId,
    /// Invariant: sorted by key; parallel to the defining component set.
    columns: Vec<(TypeKey, Column)>,
    /// Row-to-entity mapping, same indexing as every column.
    entities: Vec<Entity>,
}

impl Archetype {
    pub fn new(id: ArchetypeId, infos: impl IntoIterator<Item = Arc<TypeInfo>>) -> Self {
        let mut columns: Vec<(TypeKey, Column)> = infos
            .into_iter()
            .map(|info| (info.key, Column::new(info)))
            .collect();
        columns.sort_by_key(|(key, _)| *key);
        Self {
            id,
            columns,
            entities: Vec::new(),
        }
    }

    #[inline]
    fn column_index(&self, key: TypeKey) -> Option<usize> {
        self.columns.binary_search_by_key(&key, |(k, _)| *k).ok()
    }

    #[inline]
    pub fn id(&self) -> ArchetypeId {
        self.id
    }

    #[inline]
    pub fn has(&self, key: TypeKey) -> bool {
        self.column_index(key).is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    #[inline]
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    /// Adds a row. `components` must hold exactly one value per column
    /// of this archetype; order does not matter.
    pub fn push_row(&mut self, entity: Entity, mut components: Vec<(TypeKey, Value)>) -> usize {
        assert_eq!(
            components.len(),
            self.columns.len(),
            "row must provide exactly one value per component type"
        );
        components.sort_by_key(|(key, _)| *key);
        let row = self.entities.len();
        self.entities.push(entity);
        for (i, (key, value)) in components.iter_mut().enumerate() {
            let (column_key, column) = &mut self.columns[i];
            assert_eq!(key, column_key, "component type not in archetype");
            unsafe {
                column.push_raw(value.as_ptr());
            }
            value.mark_moved();
        }
        row
    }

    /// Removes the row, dropping its components. Returns the entity that
    /// was swapped into `row`, if any.
    pub fn swap_remove_row(&mut self, row: usize) -> Option<Entity> {
        let last = self.entities.len() - 1;
        self.entities.swap_remove(row);
        for (_, column) in &mut self.columns {
            unsafe {
                column.swap_remove(row);
            }
        }
        if row < last {
            Some(self.entities[row])
        } else {
            None
        }
    }

    /// Removes the row, moving its components out as owned values for
    /// re-insertion into another archetype. Returns the extracted values
    /// and the entity swapped into `row`, if any.
    pub fn take_row(&mut self, row: usize) -> (Vec<(TypeKey, Value)>, Option<Entity>) {
        let last = self.entities.len() - 1;
        self.entities.swap_remove(row);
        let values = self
            .columns
            .iter_mut()
            .map(|(key, column)| (*key, unsafe { column.swap_remove_into(row) }))
            .collect();
        let swapped = if row < last {
            Some(self.entities[row])
        } else {
            None
        };
        (values, swapped)
    }

    /// Replaces the component at `row` with `value`, dropping the old
    /// one. Panics if the type is not part of this archetype.
    pub fn overwrite(&mut self, row: usize, value: Value) {
        assert!(row < self.entities.len());
        let idx = self
            .column_index(value.key())
            .expect("component type not in archetype");
        unsafe {
            self.columns[idx].1.overwrite(row, value);
        }
    }

    /// Erased borrow of one component.
    pub fn get_ref(&self, row: usize, key: TypeKey) -> Option<Ref<'_>> {
        let idx = self.column_index(key)?;
        let column = &self.columns[idx].1;
        if row >= column.len() {
            return None;
        }
        Some(unsafe { Ref::from_raw(column.get_raw(row), column.info.as_ref()) })
    }

    /// Erased mutable borrow of one component.
    pub fn get_ref_mut(&mut self, row: usize, key: TypeKey) -> Option<RefMut<'_>> {
        let idx = self.column_index(key)?;
        let column = &mut self.columns[idx].1;
        if row >= column.len() {
            return None;
        }
        let ptr = unsafe { column.get_raw_mut(row) };
        Some(unsafe { RefMut::from_raw(ptr, column.info.as_ref()) })
    }

    /// Typed borrow of one component.
    ///
    /// # Safety
    /// `T` must be the type stored in the column for `key`.
    pub unsafe fn get<T: 'static>(&self, row: usize, key: TypeKey) -> Option<&T> {
        let idx = self.column_index(key)?;
        let column = &self.columns[idx].1;
        if row >= column.len() {
            return None;
        }
        Some(&*(column.get_raw(row) as *const T))
    }

    /// Typed mutable borrow of one component.
    ///
    /// # Safety
    /// `T` must be the type stored in the column for `key`.
    pub unsafe fn get_mut<T: 'static>(&mut self, row: usize, key: TypeKey) -> Option<&mut T> {
        let idx = self.column_index(key)?;
        let column = &mut self.columns[idx].1;
        if row >= column.len() {
            return None;
        }
        Some(&mut *(column.get_raw_mut(row) as *mut T))
    }

    /// Raw pointer to one component, for query fetch paths that manage
    /// exclusivity themselves.
    ///
    /// # Safety
    /// `row` must be in bounds; mutation through the returned pointer
    /// requires the caller to hold exclusive access to this table.
    pub(crate) unsafe fn get_raw(&self, row: usize, key: TypeKey) -> Option<*const u8> {
        let idx = self.column_index(key)?;
        let column = &self.columns[idx].1;
        if row >= column.len() {
            return None;
        }
        Some(column.get_raw(row))
    }
}
