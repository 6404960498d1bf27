//! Client-side copy of the authoritative world, rebuilt from broadcasts.

use shared::{Direction, NetworkMessage, ObjectId, Position, TypeTag};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirroredObject {
    pub id: ObjectId,
    pub type_tag: TypeTag,
    pub position: Position,
    pub facing: Direction,
}

/// Objects the server has told us about, keyed by id.
#[derive(Debug, Default)]
pub struct WorldMirror {
    objects: BTreeMap<ObjectId, MirroredObject>,
    player: Option<ObjectId>,
}

impl WorldMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one server message into the mirror. Returns true if anything
    /// changed.
    ///
    /// Creates are upserts since a join can overlap with a broadcast of the
    /// same object. Updates for objects we have not seen are ignored; the
    /// create is on its way over the reliable channel.
    pub fn apply(&mut self, message: &NetworkMessage) -> bool {
        match *message {
            NetworkMessage::ObjectCreate {
                object,
                type_tag,
                position,
                facing,
            } => {
                let mirrored = MirroredObject {
                    id: object,
                    type_tag,
                    position,
                    facing,
                };
                self.objects.insert(object, mirrored) != Some(mirrored)
            }
            NetworkMessage::ObjectUpdate {
                object,
                position,
                facing,
            } => match self.objects.get_mut(&object) {
                Some(mirrored) if mirrored.position != position || mirrored.facing != facing => {
                    mirrored.position = position;
                    mirrored.facing = facing;
                    true
                }
                _ => false,
            },
            NetworkMessage::ObjectDestroy { object } => {
                if self.player == Some(object) {
                    self.player = None;
                }
                self.objects.remove(&object).is_some()
            }
            NetworkMessage::SyncComplete { player } => {
                self.player = Some(player);
                false
            }
            _ => false,
        }
    }

    pub fn get(&self, id: ObjectId) -> Option<&MirroredObject> {
        self.objects.get(&id)
    }

    /// Our own player object, once the server has assigned it.
    pub fn player(&self) -> Option<&MirroredObject> {
        self.player.and_then(|id| self.objects.get(&id))
    }

    pub fn player_id(&self) -> Option<ObjectId> {
        self.player
    }

    pub fn iter(&self) -> impl Iterator<Item = &MirroredObject> + '_ {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
