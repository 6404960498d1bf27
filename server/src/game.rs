//! Authoritative world state.
//!
//! Objects live in a single slot arena. Everything outside this module refers
//! to them by [`ObjectId`] and goes through [`GameState`]'s API, so destroying
//! an object can never leave a dangling handle behind.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use shared::{ConnectionId, Direction, ObjectId, Position, TypeTag};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

use crate::registry::ObjectFactoryRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameObject {
    pub id: ObjectId,
    pub type_tag: TypeTag,
    pub position: Position,
    pub facing: Direction,
    /// Connection controlling this object, if any
    pub owner: Option<ConnectionId>,
}

impl GameObject {
    pub fn new(id: ObjectId, type_tag: TypeTag, spawn: Spawn) -> Self {
        Self {
            id,
            type_tag,
            position: spawn.position,
            facing: spawn.facing,
            owner: spawn.owner,
        }
    }
}

/// Initial placement handed to an object factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Spawn {
    pub position: Position,
    pub facing: Direction,
    pub owner: Option<ConnectionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("object {0} already exists")]
    DuplicateId(ObjectId),

    #[error("no factory registered for {0:?}")]
    UnknownType(TypeTag),

    #[error("object {0} not found")]
    NotFound(ObjectId),

    #[error("object {id} is a {expected:?}, replacement is a {found:?}")]
    TypeMismatch {
        id: ObjectId,
        expected: TypeTag,
        found: TypeTag,
    },
}

/// Point-in-time copy of the world, handed to persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tick: u32,
    pub objects: Vec<GameObject>,
}

impl Snapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[derive(Debug, Clone)]
pub struct GameState {
    pub tick: u32,
    registry: Arc<ObjectFactoryRegistry>,
    slots: Vec<Option<GameObject>>,
    free_slots: Vec<usize>,
    by_id: HashMap<ObjectId, usize>,
    by_type: HashMap<TypeTag, BTreeSet<ObjectId>>,
    next_id: ObjectId,
}

impl GameState {
    pub fn new(registry: Arc<ObjectFactoryRegistry>) -> Self {
        Self {
            tick: 0,
            registry,
            slots: Vec::new(),
            free_slots: Vec::new(),
            by_id: HashMap::new(),
            by_type: HashMap::new(),
            next_id: 1,
        }
    }

    /// Rebuilds a state from a persisted snapshot.
    pub fn restore(
        registry: Arc<ObjectFactoryRegistry>,
        snapshot: Snapshot,
    ) -> Result<Self, StateError> {
        let mut state = Self::new(registry);
        state.tick = snapshot.tick;
        for object in snapshot.objects {
            state.insert(object)?;
        }
        Ok(state)
    }

    pub fn registry(&self) -> &ObjectFactoryRegistry {
        &self.registry
    }

    /// Creates an object with default placement.
    pub fn create_object(&mut self, id: ObjectId, type_tag: TypeTag) -> Result<(), StateError> {
        self.spawn_object(id, type_tag, Spawn::default()).map(|_| ())
    }

    /// Creates an object through the registry factory for `type_tag`.
    pub fn spawn_object(
        &mut self,
        id: ObjectId,
        type_tag: TypeTag,
        spawn: Spawn,
    ) -> Result<&GameObject, StateError> {
        if self.by_id.contains_key(&id) {
            return Err(StateError::DuplicateId(id));
        }
        let factory = self
            .registry
            .get(type_tag)
            .ok_or(StateError::UnknownType(type_tag))?;

        let mut object = factory(id, spawn);
        object.id = id;
        object.type_tag = type_tag;

        let slot = self.insert(object)?;
        info!("Created {:?} {} at {:?}", type_tag, id, spawn.position);
        self.slots[slot].as_ref().ok_or(StateError::NotFound(id))
    }

    pub fn destroy_object(&mut self, id: ObjectId) -> Result<GameObject, StateError> {
        let slot = self.by_id.remove(&id).ok_or(StateError::NotFound(id))?;
        let object = self.slots[slot].take().ok_or(StateError::NotFound(id))?;

        if let Some(ids) = self.by_type.get_mut(&object.type_tag) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_type.remove(&object.type_tag);
            }
        }
        self.free_slots.push(slot);

        info!("Destroyed {:?} {}", object.type_tag, id);
        Ok(object)
    }

    /// Swaps in a new version of an existing object and returns the old one.
    ///
    /// Identity is fixed: the replacement must keep the id and type tag, so
    /// neither index changes.
    pub fn replace_object(&mut self, object: GameObject) -> Result<GameObject, StateError> {
        let slot = *self
            .by_id
            .get(&object.id)
            .ok_or(StateError::NotFound(object.id))?;
        let current = self.slots[slot]
            .as_mut()
            .ok_or(StateError::NotFound(object.id))?;

        if current.type_tag != object.type_tag {
            return Err(StateError::TypeMismatch {
                id: object.id,
                expected: current.type_tag,
                found: object.type_tag,
            });
        }

        debug!("Replaced object {}", object.id);
        Ok(std::mem::replace(current, object))
    }

    pub fn get(&self, id: ObjectId) -> Option<&GameObject> {
        self.by_id
            .get(&id)
            .and_then(|slot| self.slots[*slot].as_ref())
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Objects of one kind in id order. Empty for kinds with no live objects.
    pub fn iter_type(&self, type_tag: TypeTag) -> impl Iterator<Item = &GameObject> + '_ {
        self.by_type
            .get(&type_tag)
            .into_iter()
            .flatten()
            .filter_map(move |id| self.get(*id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &GameObject> + '_ {
        self.slots.iter().flatten()
    }

    pub fn owned_by(&self, connection: ConnectionId) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self
            .iter()
            .filter(|object| object.owner == Some(connection))
            .map(|object| object.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Hands out an id no live object uses.
    pub fn allocate_id(&mut self) -> ObjectId {
        while self.by_id.contains_key(&self.next_id) || self.next_id == 0 {
            self.next_id = self.next_id.wrapping_add(1);
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut objects: Vec<GameObject> = self.iter().cloned().collect();
        objects.sort_by_key(|object| object.id);
        Snapshot {
            tick: self.tick,
            objects,
        }
    }

    /// True when the id index and the type index describe exactly the same
    /// set of live objects.
    pub fn indices_consistent(&self) -> bool {
        let typed: usize = self.by_type.values().map(BTreeSet::len).sum();
        if typed != self.by_id.len() {
            return false;
        }

        let id_side = self.by_id.iter().all(|(id, slot)| {
            matches!(&self.slots[*slot], Some(object)
                if object.id == *id
                    && self.by_type.get(&object.type_tag).is_some_and(|ids| ids.contains(id)))
        });
        let type_side = self.by_type.iter().all(|(tag, ids)| {
            ids.iter()
                .all(|id| self.get(*id).is_some_and(|object| object.type_tag == *tag))
        });
        let live_slots = self.slots.iter().flatten().count();

        id_side && type_side && live_slots == self.by_id.len()
    }

    fn insert(&mut self, object: GameObject) -> Result<usize, StateError> {
        if self.by_id.contains_key(&object.id) {
            return Err(StateError::DuplicateId(object.id));
        }

        let id = object.id;
        let type_tag = object.type_tag;
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(object);
                slot
            }
            None => {
                self.slots.push(Some(object));
                self.slots.len() - 1
            }
        };

        self.by_id.insert(id, slot);
        self.by_type.entry(type_tag).or_default().insert(id);
        if id >= self.next_id {
            self.next_id = id.wrapping_add(1);
        }
        Ok(slot)
    }
}
