use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::hash::Hasher;

use rustc_hash::FxHasher;

use crate::entity::EntityId;

/// Name of the implicit id column every table carries.
pub const ID_COLUMN: &str = "id";

/// Canonical column name for a `(namespace, component)` pair.
pub fn column_name(namespace: &str, component: &str) -> String {
    format!("{namespace}.{component}")
}

/// Stable 64-bit hash of a column name.
///
/// A table's identity is the xor-fold of these over its column set; xor is
/// commutative, so the fold is invariant under the canonical column sort.
pub fn hash_name(name: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(name.as_bytes());
    hasher.finish()
}

/// Everything a table needs to know about one column.
///
/// The type token distinguishes types with identical layout; the typed
/// get/set front door compares it against the caller's type before touching
/// cell bytes.
#[derive(Clone, Debug)]
pub struct ComponentDescriptor {
    pub name: String,
    pub token: TypeId,
    pub type_name: &'static str,
    pub size: usize,
    pub align: usize,
}

impl ComponentDescriptor {
    pub fn of<T: Copy + 'static>(name: String) -> Self {
        Self {
            name,
            token: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            size: size_of::<T>(),
            align: align_of::<T>(),
        }
    }

    pub(crate) fn id() -> Self {
        Self::of::<EntityId>(ID_COLUMN.to_owned())
    }
}

/// The component-set declaration: maps `(namespace, component)` pairs to
/// column descriptors.
///
/// Populated before the store is constructed. Component values are plain
/// data (`Copy`): rows move between tables as raw byte copies and column
/// buffers are freed without running destructors.
#[derive(Default)]
pub struct ComponentRegistry {
    by_name: HashMap<String, ComponentDescriptor>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `namespace.component` as a column of type `T`.
    ///
    /// Re-registering the same pair with the same type is a no-op; with a
    /// different type it panics.
    pub fn register<T: Copy + 'static>(&mut self, namespace: &str, component: &str) {
        // Derived names always contain a dot, so they can never collide with
        // the implicit id column.
        let name = column_name(namespace, component);
        let descriptor = ComponentDescriptor::of::<T>(name.clone());
        if let Some(existing) = self.by_name.get(&name) {
            assert!(
                existing.token == descriptor.token,
                "component {name:?} registered twice with conflicting types: {} and {}",
                existing.type_name,
                descriptor.type_name,
            );
            return;
        }
        self.by_name.insert(name, descriptor);
    }

    pub fn get(&self, namespace: &str, component: &str) -> Option<&ComponentDescriptor> {
        self.by_name.get(&column_name(namespace, component))
    }

    pub(crate) fn expect(&self, namespace: &str, component: &str) -> &ComponentDescriptor {
        self.get(namespace, component).unwrap_or_else(|| {
            panic!("component {namespace}.{component} is not registered")
        })
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}
