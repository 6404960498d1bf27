//! Type tag to constructor mapping, fixed once the server starts.

use shared::{ObjectId, TypeTag};
use std::collections::HashMap;

use crate::game::{GameObject, Spawn};

/// Builds the object for a tag. The game state stamps the id and tag on
/// whatever the factory returns.
pub type ObjectFactory = fn(ObjectId, Spawn) -> GameObject;

#[derive(Debug, Clone)]
pub struct ObjectFactoryRegistry {
    factories: HashMap<TypeTag, ObjectFactory>,
}

impl ObjectFactoryRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            factories: HashMap::new(),
        }
    }

    /// Registry with a factory for every tag.
    pub fn standard() -> Self {
        Self::builder()
            .register(TypeTag::Player, spawn_player)
            .register(TypeTag::Npc, spawn_npc)
            .register(TypeTag::Item, spawn_item)
            .register(TypeTag::Marker, spawn_marker)
            .build()
    }

    pub fn get(&self, tag: TypeTag) -> Option<ObjectFactory> {
        self.factories.get(&tag).copied()
    }

    pub fn contains(&self, tag: TypeTag) -> bool {
        self.factories.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

pub struct RegistryBuilder {
    factories: HashMap<TypeTag, ObjectFactory>,
}

impl RegistryBuilder {
    /// Registers `factory` for `tag`, replacing any earlier registration.
    pub fn register(mut self, tag: TypeTag, factory: ObjectFactory) -> Self {
        self.factories.insert(tag, factory);
        self
    }

    pub fn build(self) -> ObjectFactoryRegistry {
        ObjectFactoryRegistry {
            factories: self.factories,
        }
    }
}

fn spawn_player(id: ObjectId, spawn: Spawn) -> GameObject {
    GameObject::new(id, TypeTag::Player, spawn)
}

// NPCs are server-driven and never owned by a connection.
fn spawn_npc(id: ObjectId, spawn: Spawn) -> GameObject {
    GameObject::new(
        id,
        TypeTag::Npc,
        Spawn {
            owner: None,
            ..spawn
        },
    )
}

fn spawn_item(id: ObjectId, spawn: Spawn) -> GameObject {
    GameObject::new(id, TypeTag::Item, spawn)
}

fn spawn_marker(id: ObjectId, spawn: Spawn) -> GameObject {
    GameObject::new(id, TypeTag::Marker, spawn)
}
