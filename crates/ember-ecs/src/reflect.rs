//! Runtime type registry and type-erased value handles.
//!
//! Components are plain Rust types. The [`TypeRegistry`] assigns each
//! registered type a dense [`TypeKey`] and records its layout plus erased
//! drop/clone function pointers, so the storage layer can own component
//! values without knowing their static types. [`Ref`], [`RefMut`], and
//! [`Value`] are the erased handles the rest of the crate trades in:
//! borrowed views into columns and an owning heap buffer respectively.

use std::alloc::Layout;
use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::class::ClassInfo;
use crate::EcsError;

/// Marker for types usable as components, resources, and events.
///
/// Blanket-implemented; the bounds exist so erased clone and cross-thread
/// hand-off are always valid.
pub trait Component: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Component for T {}

/// Dense handle for a registered type. Indexes into the registry's info
/// table; stable for the lifetime of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeKey(pub(crate) u32);

impl TypeKey {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Erased drop and clone entry points for one type, created by
/// monomorphizing [`TypeVtable::new`].
#[derive(Clone, Copy)]
pub struct TypeVtable {
    /// Drops the value in place. The pointer must reference a live,
    /// properly aligned value of the vtable's type.
    pub drop_fn: unsafe fn(*mut u8),
    /// Clones `src` into uninitialized `dst`. Both pointers must be
    /// properly aligned for the vtable's type.
    pub clone_fn: unsafe fn(src: *const u8, dst: *mut u8),
}

impl TypeVtable {
    pub fn new<T: Component>() -> Self {
        Self {
            drop_fn: drop_fn_impl::<T>,
            clone_fn: clone_fn_impl::<T>,
        }
    }
}

impl std::fmt::Debug for TypeVtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeVtable").finish_non_exhaustive()
    }
}

unsafe fn drop_fn_impl<T>(ptr: *mut u8) {
    std::ptr::drop_in_place(ptr as *mut T);
}

unsafe fn clone_fn_impl<T: Clone>(src: *const u8, dst: *mut u8) {
    let value = (*(src as *const T)).clone();
    std::ptr::write(dst as *mut T, value);
}

/// Everything the runtime knows about one registered type.
#[derive(Debug)]
pub struct TypeInfo {
    pub key: TypeKey,
    pub name: String,
    pub(crate) layout: Layout,
    pub(crate) rust_id: TypeId,
    pub(crate) vtable: TypeVtable,
}

impl TypeInfo {
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn align(&self) -> usize {
        self.layout.align()
    }

    /// Non-null placeholder pointer for zero-sized values.
    pub(crate) fn dangling(&self) -> *mut u8 {
        self.layout.align() as *mut u8
    }
}

/// Registry of runtime type descriptors.
///
/// Registration is idempotent per Rust type: registering the same type
/// twice returns the existing key and ignores the second name.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    infos: Vec<Arc<TypeInfo>>,
    by_rust: HashMap<TypeId, TypeKey>,
    by_name: HashMap<String, TypeKey>,
    classes: HashMap<TypeKey, ClassInfo>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under `name` and returns its key.
    ///
    /// Panics if `name` is already bound to a different type; component
    /// names are a setup-time namespace and collisions are programming
    /// errors.
    pub fn register<T: Component>(&mut self, name: &str) -> TypeKey {
        let rust_id = TypeId::of::<T>();
        if let Some(&key) = self.by_rust.get(&rust_id) {
            return key;
        }
        if let Some(&existing) = self.by_name.get(name) {
            panic!(
                "type name '{name}' is already registered to {}",
                self.infos[existing.index()].name
            );
        }
        let key = TypeKey(self.infos.len() as u32);
        self.infos.push(Arc::new(TypeInfo {
            key,
            name: name.to_owned(),
            layout: Layout::new::<T>(),
            rust_id,
            vtable: TypeVtable::new::<T>(),
        }));
        self.by_rust.insert(rust_id, key);
        self.by_name.insert(name.to_owned(), key);
        key
    }

    /// Registers `T` under its Rust type path. Used by paths where no
    /// user-facing name was supplied (resources, events, member types).
    pub(crate) fn register_auto<T: Component>(&mut self) -> TypeKey {
        if let Some(&key) = self.by_rust.get(&TypeId::of::<T>()) {
            return key;
        }
        self.register::<T>(std::any::type_name::<T>())
    }

    pub fn key_of<T: 'static>(&self) -> Option<TypeKey> {
        self.by_rust.get(&TypeId::of::<T>()).copied()
    }

    pub fn key_by_name(&self, name: &str) -> Option<TypeKey> {
        self.by_name.get(name).copied()
    }

    /// Descriptor for a key. Keys are only handed out by this registry,
    /// so lookup by a valid key cannot miss.
    pub fn info(&self, key: TypeKey) -> &Arc<TypeInfo> {
        &self.infos[key.index()]
    }

    pub(crate) fn info_of<T: 'static>(&self) -> Option<&Arc<TypeInfo>> {
        self.key_of::<T>().map(|key| self.info(key))
    }

    pub fn type_count(&self) -> usize {
        self.infos.len()
    }

    pub(crate) fn insert_class(&mut self, key: TypeKey, class: ClassInfo) {
        self.classes.insert(key, class);
    }

    /// Class metadata for a type, if a class was registered for it.
    pub fn class(&self, key: TypeKey) -> Option<&ClassInfo> {
        self.classes.get(&key)
    }

    pub fn class_of<T: 'static>(&self) -> Option<&ClassInfo> {
        self.key_of::<T>().and_then(|key| self.class(key))
    }
}

fn mismatch<T>(info: &TypeInfo) -> EcsError {
    EcsError::TypeMismatch {
        expected: info.name.clone(),
        found: std::any::type_name::<T>().to_owned(),
    }
}

/// Borrowed, type-erased view of a single value.
#[derive(Clone, Copy)]
pub struct Ref<'a> {
    ptr: *const u8,
    info: &'a TypeInfo,
    _marker: PhantomData<&'a ()>,
}

impl<'a> Ref<'a> {
    /// Erases a typed reference. Fails if `T` was never registered.
    pub fn new<T: Component>(value: &'a T, registry: &'a TypeRegistry) -> Result<Self, EcsError> {
        let info = registry
            .info_of::<T>()
            .ok_or_else(|| EcsError::UnknownType(std::any::type_name::<T>().to_owned()))?;
        Ok(Self {
            ptr: value as *const T as *const u8,
            info,
            _marker: PhantomData,
        })
    }

    pub(crate) unsafe fn from_raw(ptr: *const u8, info: &'a TypeInfo) -> Self {
        Self {
            ptr,
            info,
            _marker: PhantomData,
        }
    }

    /// Recovers the typed reference, checking the erased type first.
    pub fn get<T: 'static>(&self) -> Result<&'a T, EcsError> {
        if self.info.rust_id != TypeId::of::<T>() {
            return Err(mismatch::<T>(self.info));
        }
        Ok(unsafe { &*(self.ptr as *const T) })
    }

    pub fn key(&self) -> TypeKey {
        self.info.key
    }

    pub fn type_name(&self) -> &'a str {
        &self.info.name
    }

    pub(crate) fn info(&self) -> &'a TypeInfo {
        self.info
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr
    }
}

impl std::fmt::Debug for Ref<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ref<{}>", self.info.name)
    }
}

/// Borrowed, type-erased mutable view of a single value.
pub struct RefMut<'a> {
    ptr: *mut u8,
    info: &'a TypeInfo,
    _marker: PhantomData<&'a mut ()>,
}

impl<'a> RefMut<'a> {
    pub fn new<T: Component>(
        value: &'a mut T,
        registry: &'a TypeRegistry,
    ) -> Result<Self, EcsError> {
        let info = registry
            .info_of::<T>()
            .ok_or_else(|| EcsError::UnknownType(std::any::type_name::<T>().to_owned()))?;
        Ok(Self {
            ptr: value as *mut T as *mut u8,
            info,
            _marker: PhantomData,
        })
    }

    pub(crate) unsafe fn from_raw(ptr: *mut u8, info: &'a TypeInfo) -> Self {
        Self {
            ptr,
            info,
            _marker: PhantomData,
        }
    }

    pub fn get<T: 'static>(&self) -> Result<&T, EcsError> {
        if self.info.rust_id != TypeId::of::<T>() {
            return Err(mismatch::<T>(self.info));
        }
        Ok(unsafe { &*(self.ptr as *const T) })
    }

    pub fn get_mut<T: 'static>(&mut self) -> Result<&mut T, EcsError> {
        if self.info.rust_id != TypeId::of::<T>() {
            return Err(mismatch::<T>(self.info));
        }
        Ok(unsafe { &mut *(self.ptr as *mut T) })
    }

    /// Consumes the handle, recovering a typed reference for the full
    /// borrow lifetime.
    pub fn into_mut<T: 'static>(self) -> Result<&'a mut T, EcsError> {
        if self.info.rust_id != TypeId::of::<T>() {
            return Err(mismatch::<T>(self.info));
        }
        Ok(unsafe { &mut *(self.ptr as *mut T) })
    }

    /// Replaces the pointee with a clone of `src`. Both sides must erase
    /// the same type.
    pub fn write_cloned(&mut self, src: Ref<'_>) -> Result<(), EcsError> {
        if self.info.rust_id != src.info().rust_id {
            return Err(EcsError::TypeMismatch {
                expected: self.info.name.clone(),
                found: src.type_name().to_owned(),
            });
        }
        unsafe {
            (self.info.vtable.drop_fn)(self.ptr);
            (self.info.vtable.clone_fn)(src.as_ptr(), self.ptr);
        }
        Ok(())
    }

    pub fn as_ref(&self) -> Ref<'_> {
        unsafe { Ref::from_raw(self.ptr, self.info) }
    }

    pub fn key(&self) -> TypeKey {
        self.info.key
    }

    pub fn type_name(&self) -> &'a str {
        &self.info.name
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }
}

impl std::fmt::Debug for RefMut<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RefMut<{}>", self.info.name)
    }
}

/// Owning, type-erased value on an aligned heap buffer.
///
/// Carries its own descriptor, so it stays valid independent of any
/// registry borrow. Dropping a `Value` runs the erased destructor unless
/// the payload was moved out into a column.
pub struct Value {
    ptr: *mut u8,
    info: Arc<TypeInfo>,
    moved: bool,
}

// Construction paths all require `Component`, so the erased payload is
// Send + Sync.
unsafe impl Send for Value {}
unsafe impl Sync for Value {}

impl Value {
    /// Erases an owned value. Fails if `T` was never registered.
    pub fn new<T: Component>(registry: &TypeRegistry, value: T) -> Result<Self, EcsError> {
        let info = registry
            .info_of::<T>()
            .ok_or_else(|| EcsError::UnknownType(std::any::type_name::<T>().to_owned()))?
            .clone();
        Ok(Self::from_typed(info, value))
    }

    /// Erases an owned value using an already-resolved descriptor.
    ///
    /// Panics if `info` does not describe `T`; callers pair the two by
    /// construction.
    pub(crate) fn from_typed<T: Component>(info: Arc<TypeInfo>, value: T) -> Self {
        assert_eq!(
            info.rust_id,
            TypeId::of::<T>(),
            "descriptor '{}' does not match {}",
            info.name,
            std::any::type_name::<T>()
        );
        let ptr = alloc_buffer(&info);
        unsafe {
            std::ptr::write(ptr as *mut T, value);
        }
        Self {
            ptr,
            info,
            moved: false,
        }
    }

    /// Takes ownership of an initialized value sitting in an allocated
    /// buffer of `info`'s layout.
    ///
    /// # Safety
    /// `ptr` must point to a live value of `info`'s type, allocated with
    /// `info.layout` (or be the dangling placeholder for zero-sized
    /// types), and must not be freed or read by anyone else afterwards.
    pub(crate) unsafe fn from_buffer(ptr: *mut u8, info: Arc<TypeInfo>) -> Self {
        Self {
            ptr,
            info,
            moved: false,
        }
    }

    pub fn key(&self) -> TypeKey {
        self.info.key
    }

    pub fn type_name(&self) -> &str {
        &self.info.name
    }

    pub(crate) fn info(&self) -> &Arc<TypeInfo> {
        &self.info
    }

    pub fn as_ref(&self) -> Ref<'_> {
        debug_assert!(!self.moved);
        unsafe { Ref::from_raw(self.ptr, &self.info) }
    }

    pub fn as_ref_mut(&mut self) -> RefMut<'_> {
        debug_assert!(!self.moved);
        unsafe { RefMut::from_raw(self.ptr, &self.info) }
    }

    /// Moves the payload back out as a typed value.
    pub fn downcast<T: 'static>(mut self) -> Result<T, EcsError> {
        if self.info.rust_id != TypeId::of::<T>() {
            return Err(mismatch::<T>(&self.info));
        }
        self.moved = true;
        Ok(unsafe { std::ptr::read(self.ptr as *const T) })
    }

    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Marks the payload as moved out; `Drop` will free the buffer
    /// without running the destructor. The caller now owns the pointee.
    pub(crate) fn mark_moved(&mut self) {
        self.moved = true;
    }
}

impl Clone for Value {
    fn clone(&self) -> Self {
        debug_assert!(!self.moved);
        let ptr = alloc_buffer(&self.info);
        unsafe {
            (self.info.vtable.clone_fn)(self.ptr, ptr);
        }
        Self {
            ptr,
            info: self.info.clone(),
            moved: false,
        }
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        unsafe {
            if !self.moved {
                (self.info.vtable.drop_fn)(self.ptr);
            }
            if self.info.size() > 0 {
                std::alloc::dealloc(self.ptr, self.info.layout);
            }
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Value<{}>", self.info.name)
    }
}

/// Allocates an uninitialized buffer for one value of `info`'s layout.
/// Zero-sized types get the aligned placeholder pointer.
pub(crate) fn alloc_buffer(info: &TypeInfo) -> *mut u8 {
    if info.size() == 0 {
        return info.dangling();
    }
    let ptr = unsafe { std::alloc::alloc(info.layout) };
    if ptr.is_null() {
        std::alloc::handle_alloc_error(info.layout);
    }
    ptr
}

/// Either an owned erased value or a borrowed view. Method invocation
/// takes its arguments as `Var`s so callers can pass temporaries or
/// live bindings interchangeably.
#[derive(Debug)]
pub enum Var<'a> {
    Owned(Value),
    Ref(Ref<'a>),
    RefMut(RefMut<'a>),
}

impl<'a> Var<'a> {
    pub fn owned<T: Component>(registry: &TypeRegistry, value: T) -> Result<Self, EcsError> {
        Ok(Var::Owned(Value::new(registry, value)?))
    }

    pub fn from_ref<T: Component>(
        value: &'a T,
        registry: &'a TypeRegistry,
    ) -> Result<Self, EcsError> {
        Ok(Var::Ref(Ref::new(value, registry)?))
    }

    pub fn from_mut<T: Component>(
        value: &'a mut T,
        registry: &'a TypeRegistry,
    ) -> Result<Self, EcsError> {
        Ok(Var::RefMut(RefMut::new(value, registry)?))
    }

    pub fn as_ref(&self) -> Ref<'_> {
        match self {
            Var::Owned(value) => value.as_ref(),
            Var::Ref(r) => *r,
            Var::RefMut(r) => r.as_ref(),
        }
    }

    /// Mutable view of the payload. Fails for immutably borrowed vars.
    pub fn as_mut(&mut self) -> Result<RefMut<'_>, EcsError> {
        match self {
            Var::Owned(value) => Ok(value.as_ref_mut()),
            Var::Ref(r) => Err(EcsError::TypeMismatch {
                expected: format!("&mut {}", r.type_name()),
                found: format!("&{}", r.type_name()),
            }),
            Var::RefMut(r) => {
                let (ptr, info) = (r.ptr, r.info);
                Ok(unsafe { RefMut::from_raw(ptr, info) })
            }
        }
    }

    pub fn key(&self) -> TypeKey {
        self.as_ref().key()
    }
}
