// Copyright James Carl (C) 2020-2021
// AGPL-3.0-or-later

//! Per component type storage and the views systems use to iterate over it.

use super::{Component, Entity};
use antidote::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::{
    any::Any,
    collections::{hash_map, HashMap},
};

/// The world keeps its storages behind this trait so it can purge an entity without knowing
/// every component type that exists.
pub(crate) trait AnyStorage: Send + Sync {
    /// Remove the entity's component from this storage, if it has one.
    fn purge(&self, entity: Entity);

    /// Used to get back to the concrete storage type.
    fn as_any(&self) -> &dyn Any;
}

/// Storage for a single component type.
pub(crate) struct ComponentStorage<T> {
    components: RwLock<HashMap<Entity, T>>,
}

impl<T: Component> ComponentStorage<T> {
    /// Create an empty storage.
    pub(crate) fn new() -> ComponentStorage<T> {
        ComponentStorage { components: RwLock::new(HashMap::new()) }
    }

    /// Lock the storage for reading.
    pub(crate) fn read(&self) -> ReadStorage<T> {
        ReadStorage { components: self.components.read() }
    }

    /// Lock the storage for writing.
    pub(crate) fn write(&self) -> WriteStorage<T> {
        WriteStorage { components: self.components.write() }
    }
}

impl<T: Component> AnyStorage for ComponentStorage<T> {
    fn purge(&self, entity: Entity) {
        self.components.write().remove(&entity);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Shared access to every component of one type.
///
/// The storage stays locked for reading until this is dropped. Iteration order is whatever order
/// the underlying hash map happens to have.
///
/// Views don't consult the set of live entities. While another thread is in the middle of
/// [`World::destroy`](super::World::destroy), a view can still yield the entity being destroyed. Use
/// [`World::exists`](super::World::exists) if that matters to you.
pub struct ReadStorage<'a, T> {
    components: RwLockReadGuard<'a, HashMap<Entity, T>>,
}

impl<'a, T> ReadStorage<'a, T> {
    /// Get the component of an entity.
    pub fn get(&self, entity: Entity) -> Option<&T> {
        self.components.get(&entity)
    }

    /// True if the entity has this component.
    pub fn contains(&self, entity: Entity) -> bool {
        self.components.contains_key(&entity)
    }

    /// The number of entities with this component.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// True if no entity has this component.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Iterate over every entity that has this component.
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.components.keys().copied()
    }

    /// Iterate over every entity that has this component, along with the component.
    pub fn iter(&self) -> impl Iterator<Item = (Entity, &T)> + '_ {
        self.components.iter().map(|(entity, component)| (*entity, component))
    }

    /// Iterate over the entities that have both this component and the component of `other`.
    /// Entities are visited in this storage's order.
    pub fn join<'b, U>(&'b self, other: &'b ReadStorage<'_, U>) -> Join<'b, T, U> {
        Join { primary: self.components.iter(), secondary: &*other.components }
    }
}

/// Exclusive access to every component of one type.
///
/// The storage stays locked for writing until this is dropped. Components can be modified in place,
/// but entities can only gain a component through the world, since only the world knows which
/// entities are still alive.
///
/// Like [`ReadStorage`], this can briefly yield an entity that is being destroyed on another thread.
pub struct WriteStorage<'a, T> {
    components: RwLockWriteGuard<'a, HashMap<Entity, T>>,
}

impl<'a, T> WriteStorage<'a, T> {
    /// Get the component of an entity.
    pub fn get(&self, entity: Entity) -> Option<&T> {
        self.components.get(&entity)
    }

    /// Get the component of an entity so it can be modified.
    pub fn get_mut(&mut self, entity: Entity) -> Option<&mut T> {
        self.components.get_mut(&entity)
    }

    /// True if the entity has this component.
    pub fn contains(&self, entity: Entity) -> bool {
        self.components.contains_key(&entity)
    }

    /// The number of entities with this component.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// True if no entity has this component.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Take the component away from an entity.
    pub fn remove(&mut self, entity: Entity) -> Option<T> {
        self.components.remove(&entity)
    }

    /// Only the world may insert, since it has to check that the entity is alive first.
    pub(crate) fn insert(&mut self, entity: Entity, component: T) -> Option<T> {
        self.components.insert(entity, component)
    }

    /// Iterate over every entity that has this component.
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.components.keys().copied()
    }

    /// Iterate over every entity that has this component, along with the component.
    pub fn iter(&self) -> impl Iterator<Item = (Entity, &T)> + '_ {
        self.components.iter().map(|(entity, component)| (*entity, component))
    }

    /// Iterate over every component of this type so they can be modified.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Entity, &mut T)> + '_ {
        self.components.iter_mut().map(|(entity, component)| (*entity, component))
    }

    /// Like [`ReadStorage::join`], but the components of this storage can be modified.
    pub fn join_mut<'b, U>(&'b mut self, other: &'b ReadStorage<'_, U>) -> JoinMut<'b, T, U> {
        JoinMut { primary: self.components.iter_mut(), secondary: &*other.components }
    }
}

/// Iterator over entities that have two components. See [`ReadStorage::join`].
pub struct Join<'b, T, U> {
    primary: hash_map::Iter<'b, Entity, T>,
    secondary: &'b HashMap<Entity, U>,
}

impl<'b, T, U> Iterator for Join<'b, T, U> {
    type Item = (Entity, &'b T, &'b U);

    fn next(&mut self) -> Option<Self::Item> {
        let secondary = self.secondary;
        self.primary.find_map(|(entity, first)| secondary.get(entity).map(|second| (*entity, first, second)))
    }
}

/// Iterator over entities that have two components. See [`WriteStorage::join_mut`].
pub struct JoinMut<'b, T, U> {
    primary: hash_map::IterMut<'b, Entity, T>,
    secondary: &'b HashMap<Entity, U>,
}

impl<'b, T, U> Iterator for JoinMut<'b, T, U> {
    type Item = (Entity, &'b mut T, &'b U);

    fn next(&mut self) -> Option<Self::Item> {
        let secondary = self.secondary;
        self.primary.find_map(|(entity, first)| secondary.get(entity).map(|second| (*entity, first, second)))
    }
}
