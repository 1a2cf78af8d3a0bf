// Copyright James Carl (C) 2020-2021
// AGPL-3.0-or-later

//! The entity store. Entities are nothing but identifiers, and each component type gets its own storage.
//!
//! Component types must be registered with [`World::register`] before they can be attached to anything.
//! Every storage sits behind its own lock, so systems working on different component types never wait
//! on each other, even when they run in parallel. A [`ReadStorage`] or [`WriteStorage`] holds its lock
//! for as long as it lives. Do not touch a component type through the world while you are holding a
//! view of that same type. Collect what you need, drop the view, then make your changes.
//!
//! Locks are always taken in the same order: a component storage first, then the set of live entities.
//! The live set is never held while waiting on a storage.

use antidote::RwLock;
use std::{
    any::{type_name, TypeId},
    collections::{HashMap, HashSet},
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};
use thiserror::Error;

mod storage;
use storage::{AnyStorage, ComponentStorage};
pub use storage::{Join, JoinMut, ReadStorage, WriteStorage};

/// Anything that can be attached to an entity.
pub trait Component: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Component for T {}

/// An entity. It is only an identifier and carries no data of its own.
/// Identifiers are handed out in increasing order and are never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Entity(u64);

impl Entity {
    /// The raw identifier of the entity.
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({})", self.0)
    }
}

/// Error type for the world.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorldError {
    /// The component type was never registered with the world.
    #[error("Component type {0} was never registered with the world.")]
    UnregisteredComponent(&'static str),

    /// The entity does not have the component, or the entity is dead.
    #[error("{entity} does not have a {component} component.")]
    MissingComponent {
        /// The entity that was looked up.
        entity: Entity,
        /// The name of the component type.
        component: &'static str,
    },
}

/// A world result type.
pub type WorldResult<O> = std::result::Result<O, WorldError>;

/// Holds every live entity and all of their components.
pub struct World {
    next_entity: AtomicU64,
    live: RwLock<HashSet<Entity>>,
    storages: HashMap<TypeId, Box<dyn AnyStorage>>,
}

impl Default for World {
    fn default() -> Self {
        World::new()
    }
}

impl World {
    /// Create an empty world with no registered components.
    pub fn new() -> World {
        World { next_entity: AtomicU64::new(1), live: RwLock::new(HashSet::new()), storages: HashMap::new() }
    }

    /// Make a component type usable with this world. Registering the same type twice does nothing.
    pub fn register<T: Component>(&mut self) {
        self.storages.entry(TypeId::of::<T>()).or_insert_with(|| Box::new(ComponentStorage::<T>::new()));
    }

    /// True if the component type has been registered.
    pub fn is_registered<T: Component>(&self) -> bool {
        self.storages.contains_key(&TypeId::of::<T>())
    }

    /// Create a new entity with no components.
    pub fn create_entity(&self) -> Entity {
        let entity = Entity(self.next_entity.fetch_add(1, Ordering::Relaxed));
        self.live.write().insert(entity);

        entity
    }

    /// Destroy an entity and every component attached to it.
    /// Returns false if the entity was already dead.
    pub fn destroy(&self, entity: Entity) -> bool {
        // Once it's out of the live set, every lookup treats it as gone, even while we're still
        // purging its components.
        if !self.live.write().remove(&entity) {
            return false;
        }

        for storage in self.storages.values() {
            storage.purge(entity);
        }

        true
    }

    /// True if the entity is alive.
    pub fn exists(&self, entity: Entity) -> bool {
        self.live.read().contains(&entity)
    }

    /// The number of live entities.
    pub fn entity_count(&self) -> usize {
        self.live.read().len()
    }

    /// Attach a component to an entity. Same as [`World::set`].
    pub fn add<T: Component>(&self, entity: Entity, component: T) -> WorldResult<()> {
        self.set(entity, component)
    }

    /// Attach a component to an entity, replacing the one it already had.
    /// Does nothing if the entity is dead.
    pub fn set<T: Component>(&self, entity: Entity, component: T) -> WorldResult<()> {
        let mut components = self.storage::<T>()?.write();

        // A destroy that gets in after this check will purge what we insert.
        if self.live.read().contains(&entity) {
            components.insert(entity, component);
        }

        Ok(())
    }

    /// Remove a component from an entity, returning it if the entity had one.
    pub fn remove<T: Component>(&self, entity: Entity) -> Option<T> {
        let mut components = self.storage::<T>().ok()?.write();

        if self.live.read().contains(&entity) {
            components.remove(entity)
        } else {
            None
        }
    }

    /// Get a copy of an entity's component. Fails if the entity does not have one, or is dead.
    pub fn get<T: Component + Clone>(&self, entity: Entity) -> WorldResult<T> {
        let components = self.storage::<T>()?.read();
        let component = if self.live.read().contains(&entity) { components.get(entity).cloned() } else { None };

        component.ok_or(WorldError::MissingComponent { entity, component: type_name::<T>() })
    }

    /// Get a copy of an entity's component, if it has one.
    pub fn try_get<T: Component + Clone>(&self, entity: Entity) -> Option<T> {
        let components = self.storage::<T>().ok()?.read();

        if self.live.read().contains(&entity) {
            components.get(entity).cloned()
        } else {
            None
        }
    }

    /// True if the entity is alive and has the component.
    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        match self.storage::<T>() {
            Ok(storage) => {
                let components = storage.read();
                components.contains(entity) && self.live.read().contains(&entity)
            }
            Err(_) => false,
        }
    }

    /// Lock a component type for reading. This is how you iterate over entities and their components.
    pub fn read<T: Component>(&self) -> WorldResult<ReadStorage<T>> {
        Ok(self.storage::<T>()?.read())
    }

    /// Lock a component type for writing, so components can be modified in place.
    pub fn write<T: Component>(&self) -> WorldResult<WriteStorage<T>> {
        Ok(self.storage::<T>()?.write())
    }

    fn storage<T: Component>(&self) -> WorldResult<&ComponentStorage<T>> {
        self.storages
            .get(&TypeId::of::<T>())
            .and_then(|storage| storage.as_any().downcast_ref::<ComponentStorage<T>>())
            .ok_or(WorldError::UnregisteredComponent(type_name::<T>()))
    }
}

#[cfg(test)]
mod test_world {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Position(i32, i32);

    #[derive(Clone, Debug, PartialEq)]
    struct Velocity(i32, i32);

    #[derive(Clone, Debug, PartialEq)]
    struct Name(&'static str);

    fn new_world() -> World {
        let mut world = World::new();
        world.register::<Position>();
        world.register::<Velocity>();
        world.register::<Name>();

        world
    }

    #[test]
    fn entities_are_never_reused() {
        let world = new_world();
        let first = world.create_entity();
        let second = world.create_entity();
        world.destroy(first);
        let third = world.create_entity();

        assert!(first.id() < second.id());
        assert!(second.id() < third.id());
        assert_eq!(world.entity_count(), 2);
    }

    #[test]
    fn set_and_get() {
        let world = new_world();
        let entity = world.create_entity();

        world.add(entity, Position(1, 2)).unwrap();
        assert_eq!(world.get::<Position>(entity).unwrap(), Position(1, 2));

        // Setting again overwrites.
        world.set(entity, Position(3, 4)).unwrap();
        assert_eq!(world.get::<Position>(entity).unwrap(), Position(3, 4));
        assert_eq!(world.try_get::<Position>(entity), Some(Position(3, 4)));
        assert!(world.has::<Position>(entity));
        assert!(!world.has::<Velocity>(entity));
    }

    #[test]
    fn missing_component() {
        let world = new_world();
        let entity = world.create_entity();

        assert_eq!(
            world.get::<Velocity>(entity),
            Err(WorldError::MissingComponent { entity, component: type_name::<Velocity>() })
        );
        assert_eq!(world.try_get::<Velocity>(entity), None);
    }

    #[test]
    fn add_to_dead_entity_does_nothing() {
        let world = new_world();
        let entity = world.create_entity();
        world.destroy(entity);

        world.add(entity, Name("ghost")).unwrap();
        assert!(!world.has::<Name>(entity));
        assert!(world.read::<Name>().unwrap().is_empty());
    }

    #[test]
    fn destroy_purges_every_component() {
        let world = new_world();
        let entity = world.create_entity();
        let survivor = world.create_entity();

        world.add(entity, Position(0, 0)).unwrap();
        world.add(entity, Velocity(1, 1)).unwrap();
        world.add(entity, Name("doomed")).unwrap();
        world.add(survivor, Name("survivor")).unwrap();

        assert!(world.destroy(entity));
        assert!(!world.exists(entity));

        assert!(!world.has::<Position>(entity));
        assert!(!world.has::<Velocity>(entity));
        assert!(!world.has::<Name>(entity));
        assert!(world.get::<Position>(entity).is_err());
        assert!(world.get::<Velocity>(entity).is_err());
        assert!(world.get::<Name>(entity).is_err());

        assert!(world.read::<Position>().unwrap().is_empty());
        assert_eq!(world.read::<Name>().unwrap().len(), 1);
        assert_eq!(world.get::<Name>(survivor).unwrap(), Name("survivor"));

        // Destroying twice is fine.
        assert!(!world.destroy(entity));
    }

    #[test]
    fn remove_component() {
        let world = new_world();
        let entity = world.create_entity();
        world.add(entity, Position(5, 5)).unwrap();

        assert_eq!(world.remove::<Position>(entity), Some(Position(5, 5)));
        assert_eq!(world.remove::<Position>(entity), None);
        assert!(!world.has::<Position>(entity));
        assert!(world.exists(entity));
    }

    #[test]
    fn unregistered_component() {
        #[derive(Clone)]
        struct Unknown;

        let world = new_world();
        let entity = world.create_entity();

        assert_eq!(world.add(entity, Unknown).unwrap_err(), WorldError::UnregisteredComponent(type_name::<Unknown>()));
        assert!(world.get::<Unknown>(entity).is_err());
        assert!(world.try_get::<Unknown>(entity).is_none());
        assert!(!world.has::<Unknown>(entity));
        assert!(world.read::<Unknown>().is_err());
        assert!(!world.is_registered::<Unknown>());
    }

    #[test]
    fn entities_with() {
        let world = new_world();
        let a = world.create_entity();
        let b = world.create_entity();
        let c = world.create_entity();

        world.add(a, Name("a")).unwrap();
        world.add(c, Name("c")).unwrap();
        world.add(b, Position(0, 0)).unwrap();

        let names = world.read::<Name>().unwrap();
        let mut entities: Vec<Entity> = names.entities().collect();
        entities.sort();
        assert_eq!(entities, vec![a, c]);

        let mut pairs: Vec<(Entity, Name)> = names.iter().map(|(entity, name)| (entity, name.clone())).collect();
        pairs.sort_by_key(|(entity, _)| *entity);
        assert_eq!(pairs, vec![(a, Name("a")), (c, Name("c"))]);
    }

    #[test]
    fn join_is_an_inner_join() {
        let world = new_world();
        let e1 = world.create_entity();
        let e2 = world.create_entity();
        let e3 = world.create_entity();

        world.add(e1, Position(1, 1)).unwrap();
        world.add(e2, Position(2, 2)).unwrap();
        world.add(e2, Velocity(20, 20)).unwrap();
        world.add(e3, Velocity(30, 30)).unwrap();

        let positions = world.read::<Position>().unwrap();
        let velocities = world.read::<Velocity>().unwrap();
        let joined: Vec<(Entity, &Position, &Velocity)> = positions.join(&velocities).collect();

        assert_eq!(joined, vec![(e2, &Position(2, 2), &Velocity(20, 20))]);
    }

    #[test]
    fn modify_in_place() {
        let world = new_world();
        let moving = world.create_entity();
        let still = world.create_entity();

        world.add(moving, Position(0, 0)).unwrap();
        world.add(moving, Velocity(1, 2)).unwrap();
        world.add(still, Position(7, 7)).unwrap();

        {
            let velocities = world.read::<Velocity>().unwrap();
            let mut positions = world.write::<Position>().unwrap();
            for (_entity, position, velocity) in positions.join_mut(&velocities) {
                position.0 += velocity.0;
                position.1 += velocity.1;
            }
        }

        {
            let mut names = world.write::<Name>().unwrap();
            assert!(names.get_mut(moving).is_none());
        }

        assert_eq!(world.get::<Position>(moving).unwrap(), Position(1, 2));
        assert_eq!(world.get::<Position>(still).unwrap(), Position(7, 7));
    }

    #[test]
    fn disjoint_types_from_two_threads() {
        let world = new_world();
        let entities: Vec<Entity> = (0..100).map(|_| world.create_entity()).collect();

        rayon::join(
            || {
                for (index, entity) in entities.iter().enumerate() {
                    world.set(*entity, Position(index as i32, 0)).unwrap();
                }
            },
            || {
                for entity in &entities {
                    world.set(*entity, Velocity(0, 1)).unwrap();
                }
            },
        );

        let positions = world.read::<Position>().unwrap();
        let velocities = world.read::<Velocity>().unwrap();
        assert_eq!(positions.join(&velocities).count(), 100);
    }

    #[test]
    fn views_and_lookups_share_a_lock_order() {
        use std::{
            sync::{mpsc, Arc},
            thread,
            time::Duration,
        };

        let world = Arc::new(new_world());
        let entity = world.create_entity();
        let (done_tx, done_rx) = mpsc::channel();
        let (holding_tx, holding_rx) = mpsc::channel();

        // Holds a view of one type while writing another through the world.
        let reader = {
            let world = world.clone();
            let done_tx = done_tx.clone();
            thread::spawn(move || {
                let velocities = world.read::<Velocity>().unwrap();
                holding_tx.send(()).unwrap();

                // Give the other two time to start waiting on their locks.
                thread::sleep(Duration::from_millis(100));
                world.set(entity, Position(velocities.len() as i32, 0)).unwrap();
                drop(velocities);

                done_tx.send("reader").unwrap();
            })
        };

        holding_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let writer = {
            let world = world.clone();
            let done_tx = done_tx.clone();
            thread::spawn(move || {
                world.set(entity, Velocity(1, 1)).unwrap();
                done_tx.send("writer").unwrap();
            })
        };

        let creator = {
            let world = world.clone();
            thread::spawn(move || {
                world.create_entity();
                done_tx.send("creator").unwrap();
            })
        };

        let mut finished: Vec<&str> =
            (0..3).map(|_| done_rx.recv_timeout(Duration::from_secs(5)).expect("Threads deadlocked.")).collect();
        finished.sort_unstable();
        assert_eq!(finished, vec!["creator", "reader", "writer"]);

        for handle in vec![reader, writer, creator] {
            handle.join().unwrap();
        }

        assert_eq!(world.get::<Position>(entity).unwrap(), Position(0, 0));
        assert_eq!(world.get::<Velocity>(entity).unwrap(), Velocity(1, 1));
        assert_eq!(world.entity_count(), 2);
    }
}
