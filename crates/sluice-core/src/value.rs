//! Runtime type registry and type-erased socket values.
//!
//! Graph wires carry [`TypedValue`]s, type-erased boxes paired with a
//! [`SocketType`] handle. Types are registered once per process in a
//! [`TypeRegistry`]; the handle carries everything needed to
//! default-construct, copy, and compare values of that type without the
//! registry being in scope.
//!
//! # Example
//!
//! ```
//! use sluice_core::{TypeRegistry, TypedValue};
//!
//! let mut registry = TypeRegistry::new();
//! let int_ty = registry.register::<i32>("i32");
//!
//! let v = registry.value_of(41i32).unwrap();
//! assert_eq!(v.downcast_ref::<i32>(), Some(&41));
//! assert_eq!(v.ty(), Some(&int_ty));
//!
//! // A default-constructed value is typed but zeroed; an empty value has
//! // no type at all. The two are distinct states.
//! let d = int_ty.default_value();
//! assert_eq!(d.downcast_ref::<i32>(), Some(&0));
//! assert!(TypedValue::empty().ty().is_none());
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use glam::{Vec2, Vec3, Vec4};

use crate::error::TypeError;

type BoxedAny = Box<dyn Any + Send + Sync>;

/// Operations a registered type must support, captured as closures at
/// registration time.
struct TypeVtable {
    type_id: TypeId,
    name: String,
    default_construct: Box<dyn Fn() -> BoxedAny + Send + Sync>,
    clone_value: Box<dyn Fn(&(dyn Any + Send + Sync)) -> BoxedAny + Send + Sync>,
    values_equal:
        Box<dyn Fn(&(dyn Any + Send + Sync), &(dyn Any + Send + Sync)) -> bool + Send + Sync>,
}

/// Handle to a registered runtime type.
///
/// Cheap to clone (it is an `Arc` around the type's vtable). Equality and
/// hashing go by the underlying `TypeId`, so two handles for the same Rust
/// type compare equal even if registered under different registries.
#[derive(Clone)]
pub struct SocketType {
    vtable: Arc<TypeVtable>,
}

impl SocketType {
    fn of<T>(name: impl Into<String>) -> Self
    where
        T: Default + Clone + PartialEq + Send + Sync + 'static,
    {
        Self {
            vtable: Arc::new(TypeVtable {
                type_id: TypeId::of::<T>(),
                name: name.into(),
                default_construct: Box::new(|| Box::new(T::default())),
                clone_value: Box::new(|v| {
                    // The box is only ever paired with its own vtable.
                    let v = v.downcast_ref::<T>().expect("vtable type invariant");
                    Box::new(v.clone())
                }),
                values_equal: Box::new(|a, b| {
                    match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                        (Some(a), Some(b)) => a == b,
                        _ => false,
                    }
                }),
            }),
        }
    }

    /// The `TypeId` this handle stands for.
    pub fn type_id(&self) -> TypeId {
        self.vtable.type_id
    }

    /// The name this type was registered under.
    pub fn name(&self) -> &str {
        &self.vtable.name
    }

    /// Whether this handle stands for the concrete type `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.vtable.type_id == TypeId::of::<T>()
    }

    /// A default-constructed value of this type.
    pub fn default_value(&self) -> TypedValue {
        TypedValue {
            inner: Some((self.clone(), (self.vtable.default_construct)())),
        }
    }
}

impl PartialEq for SocketType {
    fn eq(&self, other: &Self) -> bool {
        self.vtable.type_id == other.vtable.type_id
    }
}

impl Eq for SocketType {}

impl Hash for SocketType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.vtable.type_id.hash(state);
    }
}

impl fmt::Debug for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SocketType({})", self.vtable.name)
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.vtable.name)
    }
}

/// Type-erased value carried on graph sockets.
///
/// Either *empty* (no type, nothing stored) or *typed* (a [`SocketType`]
/// plus an owned boxed value). Copying goes through the type's registered
/// clone operation, so `TypedValue` is `Clone` regardless of what it holds.
pub struct TypedValue {
    inner: Option<(SocketType, BoxedAny)>,
}

impl TypedValue {
    /// The polymorphic empty value.
    pub fn empty() -> Self {
        Self { inner: None }
    }

    /// Wrap a concrete value under the given type handle.
    ///
    /// Fails if `T` is not the type the handle stands for.
    pub fn with<T: Send + Sync + 'static>(ty: &SocketType, value: T) -> Result<Self, TypeError> {
        if !ty.is::<T>() {
            return Err(TypeError::mismatch(
                ty.name(),
                std::any::type_name::<T>(),
            ));
        }
        Ok(Self {
            inner: Some((ty.clone(), Box::new(value))),
        })
    }

    /// The type of the stored value, or `None` when empty.
    pub fn ty(&self) -> Option<&SocketType> {
        self.inner.as_ref().map(|(ty, _)| ty)
    }

    /// Whether this value is the polymorphic empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// Borrow the stored value as `T`, if the types agree.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.inner.as_ref().and_then(|(_, v)| v.downcast_ref())
    }

    /// Mutably borrow the stored value as `T`, if the types agree.
    pub fn downcast_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.inner.as_mut().and_then(|(_, v)| v.downcast_mut())
    }

    /// Copy-assign from another value, taking on its type and contents.
    pub fn assign(&mut self, other: &TypedValue) {
        *self = other.clone();
    }

    /// Structural equality through the registered comparison op.
    ///
    /// Two empties are equal; an empty never equals a typed value.
    pub fn equals(&self, other: &TypedValue) -> bool {
        match (&self.inner, &other.inner) {
            (None, None) => true,
            (Some((ta, va)), Some((tb, vb))) => {
                ta == tb && (ta.vtable.values_equal)(va.as_ref(), vb.as_ref())
            }
            _ => false,
        }
    }

    /// Reset back to the empty state.
    pub fn reset(&mut self) {
        self.inner = None;
    }

    /// Take the value out, leaving empty behind.
    pub fn take(&mut self) -> TypedValue {
        std::mem::take(self)
    }
}

impl Default for TypedValue {
    fn default() -> Self {
        Self::empty()
    }
}

impl Clone for TypedValue {
    fn clone(&self) -> Self {
        Self {
            inner: self
                .inner
                .as_ref()
                .map(|(ty, v)| (ty.clone(), (ty.vtable.clone_value)(v.as_ref()))),
        }
    }
}

impl PartialEq for TypedValue {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl fmt::Debug for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => write!(f, "TypedValue(empty)"),
            Some((ty, _)) => write!(f, "TypedValue({})", ty.name()),
        }
    }
}

/// Process-wide registry of socket types.
///
/// Registration is expected to finish before any graph runs; afterwards the
/// registry is shared read-only (typically behind an `Arc`).
pub struct TypeRegistry {
    by_id: HashMap<TypeId, SocketType>,
    by_name: HashMap<String, SocketType>,
}

impl TypeRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        }
    }

    /// Create a registry pre-loaded with the standard scalar, string, and
    /// vector types.
    pub fn with_standard_types() -> Self {
        let mut registry = Self::new();
        registry.register::<i32>("i32");
        registry.register::<i64>("i64");
        registry.register::<f32>("f32");
        registry.register::<f64>("f64");
        registry.register::<bool>("bool");
        registry.register::<String>("string");
        registry.register::<Vec2>("vec2");
        registry.register::<Vec3>("vec3");
        registry.register::<Vec4>("vec4");
        registry
    }

    /// Register `T` under `name` and return its handle.
    ///
    /// Registering the same type twice returns the existing handle.
    pub fn register<T>(&mut self, name: &str) -> SocketType
    where
        T: Default + Clone + PartialEq + Send + Sync + 'static,
    {
        if let Some(existing) = self.by_id.get(&TypeId::of::<T>()) {
            return existing.clone();
        }
        let ty = SocketType::of::<T>(name);
        self.by_id.insert(ty.type_id(), ty.clone());
        self.by_name.insert(name.to_string(), ty.clone());
        ty
    }

    /// Look up the handle for a concrete type.
    pub fn resolve<T: 'static>(&self) -> Option<SocketType> {
        self.by_id.get(&TypeId::of::<T>()).cloned()
    }

    /// Look up a handle by its registered name.
    pub fn resolve_by_name(&self, name: &str) -> Option<SocketType> {
        self.by_name.get(name).cloned()
    }

    /// The registered name of a type handle.
    pub fn name_of<'a>(&self, ty: &'a SocketType) -> &'a str {
        ty.name()
    }

    /// Wrap a concrete value, resolving its type handle from the registry.
    pub fn value_of<T>(&self, value: T) -> Result<TypedValue, TypeError>
    where
        T: Send + Sync + 'static,
    {
        let ty = self
            .resolve::<T>()
            .ok_or_else(|| TypeError::NotRegistered(std::any::type_name::<T>().to_string()))?;
        TypedValue::with(&ty, value)
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether no types are registered.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = TypeRegistry::new();
        let ty = registry.register::<i32>("i32");

        assert_eq!(registry.resolve::<i32>(), Some(ty.clone()));
        assert_eq!(registry.resolve_by_name("i32"), Some(ty.clone()));
        assert_eq!(registry.name_of(&ty), "i32");
        assert!(registry.resolve::<f32>().is_none());
        assert!(registry.resolve_by_name("f32").is_none());
    }

    #[test]
    fn test_register_twice_returns_same_handle() {
        let mut registry = TypeRegistry::new();
        let a = registry.register::<i32>("i32");
        let b = registry.register::<i32>("int");
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_standard_types() {
        let registry = TypeRegistry::with_standard_types();
        for name in ["i32", "f32", "f64", "bool", "string", "vec2", "vec3", "vec4"] {
            assert!(registry.resolve_by_name(name).is_some(), "missing {name}");
        }
    }

    #[test]
    fn test_default_value_is_typed() {
        let mut registry = TypeRegistry::new();
        let ty = registry.register::<i32>("i32");

        let v = ty.default_value();
        assert!(!v.is_empty());
        assert_eq!(v.ty(), Some(&ty));
        assert_eq!(v.downcast_ref::<i32>(), Some(&0));
    }

    #[test]
    fn test_empty_vs_typed_default() {
        let mut registry = TypeRegistry::new();
        let ty = registry.register::<i32>("i32");

        let empty = TypedValue::empty();
        let default = ty.default_value();
        assert!(empty.is_empty());
        assert!(!default.is_empty());
        assert!(!empty.equals(&default));
        assert!(empty.equals(&TypedValue::empty()));
    }

    #[test]
    fn test_value_roundtrip() {
        let registry = TypeRegistry::with_standard_types();
        let v = registry.value_of(7i32).unwrap();
        assert_eq!(v.downcast_ref::<i32>(), Some(&7));
        assert!(v.downcast_ref::<f32>().is_none());
    }

    #[test]
    fn test_value_clone_is_deep() {
        let registry = TypeRegistry::with_standard_types();
        let mut a = registry.value_of("hello".to_string()).unwrap();
        let b = a.clone();

        a.downcast_mut::<String>().unwrap().push_str(" world");
        assert_eq!(a.downcast_ref::<String>().unwrap(), "hello world");
        assert_eq!(b.downcast_ref::<String>().unwrap(), "hello");
    }

    #[test]
    fn test_value_equals() {
        let registry = TypeRegistry::with_standard_types();
        let a = registry.value_of(1i32).unwrap();
        let b = registry.value_of(1i32).unwrap();
        let c = registry.value_of(2i32).unwrap();
        let f = registry.value_of(1.0f32).unwrap();

        assert!(a.equals(&b));
        assert!(!a.equals(&c));
        assert!(!a.equals(&f));
    }

    #[test]
    fn test_assign_replaces_type_and_contents() {
        let registry = TypeRegistry::with_standard_types();
        let mut v = registry.value_of(1i32).unwrap();
        let f = registry.value_of(2.5f32).unwrap();

        v.assign(&f);
        assert!(v.ty().unwrap().is::<f32>());
        assert_eq!(v.downcast_ref::<f32>(), Some(&2.5));
    }

    #[test]
    fn test_with_wrong_type_fails() {
        let mut registry = TypeRegistry::new();
        let ty = registry.register::<i32>("i32");
        assert!(TypedValue::with(&ty, 1.0f32).is_err());
    }

    #[test]
    fn test_take_leaves_empty() {
        let registry = TypeRegistry::with_standard_types();
        let mut v = registry.value_of(9i32).unwrap();
        let taken = v.take();
        assert!(v.is_empty());
        assert_eq!(taken.downcast_ref::<i32>(), Some(&9));
    }

    #[test]
    fn test_vector_values() {
        let registry = TypeRegistry::with_standard_types();
        let v = registry.value_of(Vec3::new(1.0, 2.0, 3.0)).unwrap();
        assert_eq!(v.downcast_ref::<Vec3>(), Some(&Vec3::new(1.0, 2.0, 3.0)));
    }
}
