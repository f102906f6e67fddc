//! Named member and method metadata attached to registered types.
//!
//! A [`ClassInfo`] lets dynamic callers (tooling, scripting bridges)
//! read and write fields and invoke methods by string name, through the
//! erased handles from [`crate::reflect`]. Classes are built once at
//! setup time with [`TypeRegistry::class_builder`] and then looked up
//! through the registry.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::reflect::{Component, Ref, RefMut, TypeInfo, TypeKey, TypeRegistry, Value, Var};
use crate::EcsError;

type ProjectFn = Arc<dyn Fn(*const u8) -> *const u8 + Send + Sync>;
type ProjectMutFn = Arc<dyn Fn(*mut u8) -> *mut u8 + Send + Sync>;

/// Erased method body: instance pointer plus erased arguments in, owned
/// erased result out.
pub type InvokeFn = Box<dyn Fn(*mut u8, &mut [Var]) -> Result<Value, EcsError> + Send + Sync>;

/// A named field of a class, with erased accessors.
#[derive(Clone)]
pub struct Member {
    name: String,
    owner: TypeKey,
    owner_name: String,
    field: Arc<TypeInfo>,
    project: ProjectFn,
    project_mut: ProjectMutFn,
}

impl Member {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key of the field's type.
    pub fn field_key(&self) -> TypeKey {
        self.field.key
    }

    pub fn field_type_name(&self) -> &str {
        &self.field.name
    }

    fn check_owner(&self, key: TypeKey, found: &str) -> Result<(), EcsError> {
        if key != self.owner {
            return Err(EcsError::TypeMismatch {
                expected: self.owner_name.clone(),
                found: found.to_owned(),
            });
        }
        Ok(())
    }

    /// Borrows the field out of an erased instance.
    pub fn get<'a>(&'a self, instance: Ref<'a>) -> Result<Ref<'a>, EcsError> {
        self.check_owner(instance.key(), instance.type_name())?;
        let ptr = (self.project)(instance.as_ptr());
        Ok(unsafe { Ref::from_raw(ptr, &self.field) })
    }

    /// Mutably borrows the field out of an erased instance.
    pub fn get_mut<'a>(&'a self, mut instance: RefMut<'a>) -> Result<RefMut<'a>, EcsError> {
        self.check_owner(instance.key(), instance.type_name())?;
        let ptr = (self.project_mut)(instance.as_mut_ptr());
        Ok(unsafe { RefMut::from_raw(ptr, &self.field) })
    }

    /// Overwrites the field with an owned value.
    pub fn set<F: Component>(&self, instance: RefMut<'_>, value: F) -> Result<(), EcsError> {
        let mut field = self.get_mut(instance)?;
        *field.get_mut::<F>()? = value;
        Ok(())
    }

    /// Overwrites the field with a clone of an erased source value.
    pub fn set_cloned(&self, instance: RefMut<'_>, value: Ref<'_>) -> Result<(), EcsError> {
        let mut field = self.get_mut(instance)?;
        field.write_cloned(value)
    }
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Member({}.{})", self.owner_name, self.name)
    }
}

/// A named method of a class. Receives the instance by mutable borrow
/// and up to two by-ref arguments; returns its result as an owned
/// erased [`Value`].
pub struct Method {
    name: String,
    owner: TypeKey,
    owner_name: String,
    arity: usize,
    invoke_fn: InvokeFn,
}

impl Method {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Invokes the method on an erased instance. Mutations made through
    /// `RefMut` arguments are visible to the caller afterwards.
    pub fn invoke(&self, mut instance: RefMut<'_>, args: &mut [Var]) -> Result<Value, EcsError> {
        if instance.key() != self.owner {
            return Err(EcsError::TypeMismatch {
                expected: self.owner_name.clone(),
                found: instance.type_name().to_owned(),
            });
        }
        if args.len() != self.arity {
            return Err(EcsError::TypeMismatch {
                expected: format!("{} argument(s) to {}.{}", self.arity, self.owner_name, self.name),
                found: format!("{} argument(s)", args.len()),
            });
        }
        (self.invoke_fn)(instance.as_mut_ptr(), args)
    }
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Method({}.{}/{})", self.owner_name, self.name, self.arity)
    }
}

/// Member and method metadata for one registered type.
#[derive(Debug)]
pub struct ClassInfo {
    key: TypeKey,
    name: String,
    members: Vec<Member>,
    methods: Vec<Method>,
}

impl ClassInfo {
    pub fn key(&self) -> TypeKey {
        self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter()
    }

    pub fn methods(&self) -> impl Iterator<Item = &Method> {
        self.methods.iter()
    }
}

/// Callables registrable as class methods: `Fn(&mut S) -> R` plus the
/// one- and two-argument forms with `&mut` parameters.
pub trait ClassMethod<S, Args>: Send + Sync + 'static {
    const ARITY: usize;

    fn erase(self, registry: &mut TypeRegistry) -> InvokeFn;
}

impl<S, R, F> ClassMethod<S, ()> for F
where
    S: Component,
    R: Component,
    F: Fn(&mut S) -> R + Send + Sync + 'static,
{
    const ARITY: usize = 0;

    fn erase(self, registry: &mut TypeRegistry) -> InvokeFn {
        let ret_key = registry.register_auto::<R>();
        let ret = registry.info(ret_key).clone();
        Box::new(move |instance, _args| {
            let instance = unsafe { &mut *(instance as *mut S) };
            Ok(Value::from_typed(ret.clone(), self(instance)))
        })
    }
}

impl<S, A, R, F> ClassMethod<S, (A,)> for F
where
    S: Component,
    A: Component,
    R: Component,
    F: Fn(&mut S, &mut A) -> R + Send + Sync + 'static,
{
    const ARITY: usize = 1;

    fn erase(self, registry: &mut TypeRegistry) -> InvokeFn {
        registry.register_auto::<A>();
        let ret_key = registry.register_auto::<R>();
        let ret = registry.info(ret_key).clone();
        Box::new(move |instance, args| {
            let instance = unsafe { &mut *(instance as *mut S) };
            let mut a = args[0].as_mut()?;
            let a = a.get_mut::<A>()?;
            Ok(Value::from_typed(ret.clone(), self(instance, a)))
        })
    }
}

impl<S, A, B, R, F> ClassMethod<S, (A, B)> for F
where
    S: Component,
    A: Component,
    B: Component,
    R: Component,
    F: Fn(&mut S, &mut A, &mut B) -> R + Send + Sync + 'static,
{
    const ARITY: usize = 2;

    fn erase(self, registry: &mut TypeRegistry) -> InvokeFn {
        registry.register_auto::<A>();
        registry.register_auto::<B>();
        let ret_key = registry.register_auto::<R>();
        let ret = registry.info(ret_key).clone();
        Box::new(move |instance, args| {
            let instance = unsafe { &mut *(instance as *mut S) };
            let [arg_a, arg_b] = args else {
                return Err(EcsError::TypeMismatch {
                    expected: "2 argument(s)".to_owned(),
                    found: format!("{} argument(s)", args.len()),
                });
            };
            let mut a = arg_a.as_mut()?;
            let mut b = arg_b.as_mut()?;
            let a = a.get_mut::<A>()?;
            let b = b.get_mut::<B>()?;
            Ok(Value::from_typed(ret.clone(), self(instance, a, b)))
        })
    }
}

/// Fluent builder for a class. Field and argument types are registered
/// on demand under their Rust type paths.
pub struct ClassBuilder<'r, T> {
    registry: &'r mut TypeRegistry,
    class: ClassInfo,
    _marker: PhantomData<fn() -> T>,
}

impl TypeRegistry {
    /// Starts building class metadata for `T`, registering `T` if it is
    /// not yet known.
    pub fn class_builder<T: Component>(&mut self) -> ClassBuilder<'_, T> {
        let key = self.register_auto::<T>();
        let name = self.info(key).name.clone();
        ClassBuilder {
            registry: self,
            class: ClassInfo {
                key,
                name,
                members: Vec::new(),
                methods: Vec::new(),
            },
            _marker: PhantomData,
        }
    }
}

impl<'r, T: Component> ClassBuilder<'r, T> {
    /// Adds a named field with its projection pair.
    pub fn member<F: Component>(
        mut self,
        name: &str,
        project: fn(&T) -> &F,
        project_mut: fn(&mut T) -> &mut F,
    ) -> Self {
        let field_key = self.registry.register_auto::<F>();
        let field = self.registry.info(field_key).clone();
        self.class.members.push(Member {
            name: name.to_owned(),
            owner: self.class.key,
            owner_name: self.class.name.clone(),
            field,
            project: Arc::new(move |ptr| {
                project(unsafe { &*(ptr as *const T) }) as *const F as *const u8
            }),
            project_mut: Arc::new(move |ptr| {
                project_mut(unsafe { &mut *(ptr as *mut T) }) as *mut F as *mut u8
            }),
        });
        self
    }

    /// Adds a named method.
    pub fn method<Args, M: ClassMethod<T, Args>>(mut self, name: &str, method: M) -> Self {
        let invoke_fn = method.erase(self.registry);
        self.class.methods.push(Method {
            name: name.to_owned(),
            owner: self.class.key,
            owner_name: self.class.name.clone(),
            arity: M::ARITY,
            invoke_fn,
        });
        self
    }

    /// Finishes the build and attaches the class to the registry.
    pub fn register(self) -> TypeKey {
        let key = self.class.key;
        self.registry.insert_class(key, self.class);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Obj {
        a: i32,
        b: f32,
    }

    fn build_registry() -> TypeRegistry {
        let mut reg = TypeRegistry::new();
        reg.register::<Obj>("obj");
        reg.class_builder::<Obj>()
            .member("a", |o| &o.a, |o| &mut o.a)
            .member("b", |o| &o.b, |o| &mut o.b)
            .method("double_a", |o: &mut Obj| {
                o.a *= 2;
                o.a
            })
            .method("add_and_echo", |o: &mut Obj, x: &mut i32| {
                o.a += *x;
                *x = 10;
                o.a
            })
            .register();
        reg
    }

    #[test]
    fn member_get_reads_field() {
        let reg = build_registry();
        let cls = reg.class_of::<Obj>().unwrap();
        let obj = Obj { a: 5, b: 1.5 };

        let m = cls.member("a").unwrap();
        let field = m.get(Ref::new(&obj, &reg).unwrap()).unwrap();
        assert_eq!(field.get::<i32>().unwrap(), &5);

        assert!(cls.member("missing").is_none());
    }

    #[test]
    fn member_set_writes_field() {
        let reg = build_registry();
        let cls = reg.class_of::<Obj>().unwrap();
        let mut obj = Obj { a: 5, b: 1.5 };

        let m = cls.member("a").unwrap();
        m.set(RefMut::new(&mut obj, &reg).unwrap(), 10i32).unwrap();
        assert_eq!(obj.a, 10);

        // Wrong field type is rejected without writing.
        let err = m
            .set(RefMut::new(&mut obj, &reg).unwrap(), 1.0f32)
            .unwrap_err();
        assert!(matches!(err, EcsError::TypeMismatch { .. }));
        assert_eq!(obj.a, 10);
    }

    #[test]
    fn member_set_cloned_from_erased_source() {
        let reg = build_registry();
        let cls = reg.class_of::<Obj>().unwrap();
        let mut obj = Obj { a: 1, b: 0.0 };
        let source = 42i32;

        let m = cls.member("a").unwrap();
        m.set_cloned(
            RefMut::new(&mut obj, &reg).unwrap(),
            Ref::new(&source, &reg).unwrap(),
        )
        .unwrap();
        assert_eq!(obj.a, 42);
    }

    #[test]
    fn method_invoke_mutates_instance_and_returns_value() {
        let reg = build_registry();
        let cls = reg.class_of::<Obj>().unwrap();
        let mut obj = Obj { a: 3, b: 0.0 };

        let m = cls.method("double_a").unwrap();
        let out = m
            .invoke(RefMut::new(&mut obj, &reg).unwrap(), &mut [])
            .unwrap();
        assert_eq!(out.downcast::<i32>().unwrap(), 6);
        assert_eq!(obj.a, 6);
    }

    #[test]
    fn method_invoke_writes_through_byref_argument() {
        let reg = build_registry();
        let cls = reg.class_of::<Obj>().unwrap();
        let mut obj = Obj { a: 5, b: 0.0 };
        let mut x = 2i32;

        let m = cls.method("add_and_echo").unwrap();
        let out = {
            let mut args = [Var::from_mut(&mut x, &reg).unwrap()];
            m.invoke(RefMut::new(&mut obj, &reg).unwrap(), &mut args)
                .unwrap()
        };
        assert_eq!(out.downcast::<i32>().unwrap(), 7);
        assert_eq!(obj.a, 7);
        // The by-ref argument was overwritten by the method body.
        assert_eq!(x, 10);
    }

    #[test]
    fn method_invoke_checks_arity_and_receiver() {
        let reg = build_registry();
        let cls = reg.class_of::<Obj>().unwrap();
        let mut obj = Obj { a: 0, b: 0.0 };

        let m = cls.method("add_and_echo").unwrap();
        let err = m
            .invoke(RefMut::new(&mut obj, &reg).unwrap(), &mut [])
            .unwrap_err();
        assert!(matches!(err, EcsError::TypeMismatch { .. }));
    }

    #[test]
    fn immutable_argument_is_rejected() {
        let reg = build_registry();
        let cls = reg.class_of::<Obj>().unwrap();
        let mut obj = Obj { a: 0, b: 0.0 };
        let x = 1i32;

        let m = cls.method("add_and_echo").unwrap();
        let mut args = [Var::from_ref(&x, &reg).unwrap()];
        let err = m
            .invoke(RefMut::new(&mut obj, &reg).unwrap(), &mut args)
            .unwrap_err();
        assert!(matches!(err, EcsError::TypeMismatch { .. }));
    }
}
