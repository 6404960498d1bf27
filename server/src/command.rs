//! Commands: the only way anything changes the game state.
//!
//! Every command validates against the current state before touching it, so
//! a rejected command leaves the world exactly as it found it.

use log::debug;
use shared::{ConnectionId, Direction, ObjectId, Position, TypeTag};
use thiserror::Error;

use crate::game::{GameObject, GameState, Spawn, StateError};

/// Movement rules, owned by the geometry side of the game.
pub trait Movement: Send + Sync {
    /// New position and facing after one step from `position` in `direction`.
    fn compute_move(&self, position: Position, direction: Direction) -> (Position, Direction);
}

/// One cell per step on a square grid, turning to face the direction moved.
#[derive(Debug, Clone, Copy, Default)]
pub struct GridMovement;

impl Movement for GridMovement {
    fn compute_move(&self, position: Position, direction: Direction) -> (Position, Direction) {
        (position.step(direction), direction)
    }
}

/// What happens to a connection's objects when it goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DisconnectPolicy {
    #[default]
    DestroyOwned,
    /// Objects stay in the world without an owner.
    Disown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("connection {issuer} does not control object {object}")]
    NotOwner {
        issuer: ConnectionId,
        object: ObjectId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameCommand {
    /// Create an object. `id: None` lets the authority pick a free id.
    CreateObject {
        id: Option<ObjectId>,
        type_tag: TypeTag,
        spawn: Spawn,
        /// Client request number to acknowledge, for network-originated creates
        request: Option<u32>,
    },
    /// Destroy an object. With an issuer, only that connection's objects.
    DestroyObject {
        id: ObjectId,
        issuer: Option<ConnectionId>,
    },
    /// Place an object directly, bypassing movement rules.
    MoveObject {
        id: ObjectId,
        position: Position,
        facing: Direction,
    },
    /// One step of player input from a synchronized connection.
    ApplyInput {
        issuer: ConnectionId,
        player: ObjectId,
        direction: Direction,
    },
    /// Give a newly synchronized connection its player object.
    SpawnPlayer {
        connection: ConnectionId,
        position: Position,
    },
    /// Apply the disconnect policy to everything a connection owns.
    ReleaseConnection {
        connection: ConnectionId,
        policy: DisconnectPolicy,
    },
}

/// Effect of a successfully applied command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created {
        object: GameObject,
        request: Option<u32>,
    },
    Destroyed {
        id: ObjectId,
    },
    Updated {
        object: GameObject,
    },
    Joined {
        connection: ConnectionId,
        player: GameObject,
    },
    Released {
        connection: ConnectionId,
        destroyed: Vec<ObjectId>,
        disowned: Vec<ObjectId>,
    },
}

impl GameCommand {
    pub fn validate(&self, state: &GameState) -> Result<(), ValidationError> {
        match self {
            GameCommand::CreateObject { id, type_tag, .. } => {
                if !state.registry().contains(*type_tag) {
                    return Err(StateError::UnknownType(*type_tag).into());
                }
                match id {
                    Some(id) if state.contains(*id) => Err(StateError::DuplicateId(*id).into()),
                    _ => Ok(()),
                }
            }
            GameCommand::DestroyObject { id, issuer } => {
                let object = state.get(*id).ok_or(StateError::NotFound(*id))?;
                match issuer {
                    Some(issuer) => check_owner(object, *issuer),
                    None => Ok(()),
                }
            }
            GameCommand::MoveObject { id, .. } => {
                state.get(*id).ok_or(StateError::NotFound(*id))?;
                Ok(())
            }
            GameCommand::ApplyInput { issuer, player, .. } => {
                let object = state.get(*player).ok_or(StateError::NotFound(*player))?;
                check_owner(object, *issuer)
            }
            GameCommand::SpawnPlayer { .. } => {
                if state.registry().contains(TypeTag::Player) {
                    Ok(())
                } else {
                    Err(StateError::UnknownType(TypeTag::Player).into())
                }
            }
            GameCommand::ReleaseConnection { .. } => Ok(()),
        }
    }

    /// Validates, then applies. On error nothing has been mutated.
    pub fn apply(
        self,
        state: &mut GameState,
        movement: &dyn Movement,
    ) -> Result<Outcome, ValidationError> {
        self.validate(state)?;

        let outcome = match self {
            GameCommand::CreateObject {
                id,
                type_tag,
                spawn,
                request,
            } => {
                let id = id.unwrap_or_else(|| state.allocate_id());
                let object = state.spawn_object(id, type_tag, spawn)?.clone();
                Outcome::Created { object, request }
            }
            GameCommand::DestroyObject { id, .. } => {
                state.destroy_object(id)?;
                Outcome::Destroyed { id }
            }
            GameCommand::MoveObject {
                id,
                position,
                facing,
            } => {
                let object = relocate(state, id, position, facing)?;
                Outcome::Updated { object }
            }
            GameCommand::ApplyInput {
                player, direction, ..
            } => {
                let current = state.get(player).ok_or(StateError::NotFound(player))?;
                let (position, facing) = movement.compute_move(current.position, direction);
                let object = relocate(state, player, position, facing)?;
                Outcome::Updated { object }
            }
            GameCommand::SpawnPlayer {
                connection,
                position,
            } => {
                let id = state.allocate_id();
                let spawn = Spawn {
                    position,
                    facing: Direction::default(),
                    owner: Some(connection),
                };
                let player = state.spawn_object(id, TypeTag::Player, spawn)?.clone();
                Outcome::Joined { connection, player }
            }
            GameCommand::ReleaseConnection { connection, policy } => {
                release(state, connection, policy)?
            }
        };

        Ok(outcome)
    }
}

fn check_owner(object: &GameObject, issuer: ConnectionId) -> Result<(), ValidationError> {
    if object.owner == Some(issuer) {
        Ok(())
    } else {
        Err(ValidationError::NotOwner {
            issuer,
            object: object.id,
        })
    }
}

fn relocate(
    state: &mut GameState,
    id: ObjectId,
    position: Position,
    facing: Direction,
) -> Result<GameObject, StateError> {
    let mut object = state.get(id).cloned().ok_or(StateError::NotFound(id))?;
    object.position = position;
    object.facing = facing;
    state.replace_object(object.clone())?;
    Ok(object)
}

// Ids come from the state itself, so none of the calls below can miss.
fn release(
    state: &mut GameState,
    connection: ConnectionId,
    policy: DisconnectPolicy,
) -> Result<Outcome, ValidationError> {
    let owned = state.owned_by(connection);
    let mut destroyed = Vec::new();
    let mut disowned = Vec::new();

    for id in owned {
        match policy {
            DisconnectPolicy::DestroyOwned => {
                state.destroy_object(id)?;
                destroyed.push(id);
            }
            DisconnectPolicy::Disown => {
                let mut object = state.get(id).cloned().ok_or(StateError::NotFound(id))?;
                object.owner = None;
                state.replace_object(object)?;
                disowned.push(id);
            }
        }
    }

    debug!(
        "Released connection {}: {} destroyed, {} disowned",
        connection,
        destroyed.len(),
        disowned.len()
    );
    Ok(Outcome::Released {
        connection,
        destroyed,
        disowned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ObjectFactoryRegistry;
    use std::sync::Arc;

    fn state() -> GameState {
        GameState::new(Arc::new(ObjectFactoryRegistry::standard()))
    }

    fn owned(owner: ConnectionId) -> Spawn {
        Spawn {
            owner: Some(owner),
            ..Default::default()
        }
    }

    #[test]
    fn test_grid_movement() {
        let (position, facing) = GridMovement.compute_move(Position::new(2, 2), Direction::Left);
        assert_eq!(position, Position::new(1, 2));
        assert_eq!(facing, Direction::Left);
    }

    #[test]
    fn test_create_with_explicit_id() {
        let mut state = state();
        let outcome = GameCommand::CreateObject {
            id: Some(5),
            type_tag: TypeTag::Item,
            spawn: Spawn::default(),
            request: None,
        }
        .apply(&mut state, &GridMovement)
        .unwrap();

        assert!(matches!(outcome, Outcome::Created { ref object, .. } if object.id == 5));
        assert!(state.contains(5));
    }

    #[test]
    fn test_create_duplicate_fails_without_change() {
        let mut state = state();
        state.create_object(5, TypeTag::Item).unwrap();
        let before = state.snapshot();

        let result = GameCommand::CreateObject {
            id: Some(5),
            type_tag: TypeTag::Npc,
            spawn: Spawn::default(),
            request: None,
        }
        .apply(&mut state, &GridMovement);

        assert_eq!(
            result,
            Err(ValidationError::State(StateError::DuplicateId(5)))
        );
        assert_eq!(state.snapshot(), before);
    }

    #[test]
    fn test_create_allocates_id() {
        let mut state = state();
        state.create_object(1, TypeTag::Npc).unwrap();

        let outcome = GameCommand::CreateObject {
            id: None,
            type_tag: TypeTag::Marker,
            spawn: owned(3),
            request: Some(11),
        }
        .apply(&mut state, &GridMovement)
        .unwrap();

        match outcome {
            Outcome::Created { object, request } => {
                assert_eq!(object.id, 2);
                assert_eq!(object.owner, Some(3));
                assert_eq!(request, Some(11));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_create_unregistered_type() {
        let registry = ObjectFactoryRegistry::builder()
            .register(TypeTag::Npc, |id, spawn| GameObject::new(id, TypeTag::Npc, spawn))
            .build();
        let mut state = GameState::new(Arc::new(registry));

        let result = GameCommand::CreateObject {
            id: None,
            type_tag: TypeTag::Item,
            spawn: Spawn::default(),
            request: None,
        }
        .apply(&mut state, &GridMovement);

        assert_eq!(
            result,
            Err(ValidationError::State(StateError::UnknownType(TypeTag::Item)))
        );
        assert!(state.is_empty());
    }

    #[test]
    fn test_destroy_requires_ownership() {
        let mut state = state();
        state.spawn_object(4, TypeTag::Item, owned(1)).unwrap();

        let stolen = GameCommand::DestroyObject {
            id: 4,
            issuer: Some(2),
        }
        .apply(&mut state, &GridMovement);
        assert_eq!(
            stolen,
            Err(ValidationError::NotOwner {
                issuer: 2,
                object: 4
            })
        );
        assert!(state.contains(4));

        let own = GameCommand::DestroyObject {
            id: 4,
            issuer: Some(1),
        }
        .apply(&mut state, &GridMovement);
        assert_eq!(own, Ok(Outcome::Destroyed { id: 4 }));
        assert!(!state.contains(4));
    }

    #[test]
    fn test_destroy_missing() {
        let mut state = state();
        let result = GameCommand::DestroyObject { id: 8, issuer: None }.apply(&mut state, &GridMovement);
        assert_eq!(result, Err(ValidationError::State(StateError::NotFound(8))));
    }

    #[test]
    fn test_move_missing_object() {
        let mut state = state();
        let result = GameCommand::MoveObject {
            id: 1,
            position: Position::new(1, 1),
            facing: Direction::Up,
        }
        .apply(&mut state, &GridMovement);

        assert_eq!(result, Err(ValidationError::State(StateError::NotFound(1))));
        assert!(state.is_empty());
    }

    #[test]
    fn test_apply_input_moves_player() {
        let mut state = state();
        state.spawn_object(7, TypeTag::Player, owned(1)).unwrap();

        let outcome = GameCommand::ApplyInput {
            issuer: 1,
            player: 7,
            direction: Direction::Right,
        }
        .apply(&mut state, &GridMovement)
        .unwrap();

        let player = state.get(7).unwrap();
        assert_eq!(player.position, Position::new(1, 0));
        assert_eq!(player.facing, Direction::Right);
        assert_eq!(
            outcome,
            Outcome::Updated {
                object: player.clone()
            }
        );
    }

    #[test]
    fn test_apply_input_for_someone_elses_player() {
        let mut state = state();
        state.spawn_object(7, TypeTag::Player, owned(1)).unwrap();

        let result = GameCommand::ApplyInput {
            issuer: 2,
            player: 7,
            direction: Direction::Up,
        }
        .apply(&mut state, &GridMovement);

        assert!(matches!(result, Err(ValidationError::NotOwner { .. })));
        assert_eq!(state.get(7).unwrap().position, Position::new(0, 0));
    }

    #[test]
    fn test_apply_input_uses_movement_collaborator() {
        struct Teleport;
        impl Movement for Teleport {
            fn compute_move(&self, _: Position, direction: Direction) -> (Position, Direction) {
                (Position::new(100, 100), direction)
            }
        }

        let mut state = state();
        state.spawn_object(7, TypeTag::Player, owned(1)).unwrap();

        GameCommand::ApplyInput {
            issuer: 1,
            player: 7,
            direction: Direction::Down,
        }
        .apply(&mut state, &Teleport)
        .unwrap();

        assert_eq!(state.get(7).unwrap().position, Position::new(100, 100));
    }

    #[test]
    fn test_spawn_player() {
        let mut state = state();
        let outcome = GameCommand::SpawnPlayer {
            connection: 3,
            position: Position::new(5, 5),
        }
        .apply(&mut state, &GridMovement)
        .unwrap();

        match outcome {
            Outcome::Joined { connection, player } => {
                assert_eq!(connection, 3);
                assert_eq!(player.type_tag, TypeTag::Player);
                assert_eq!(player.owner, Some(3));
                assert_eq!(player.position, Position::new(5, 5));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_release_destroys_owned_objects() {
        let mut state = state();
        state.spawn_object(1, TypeTag::Player, owned(9)).unwrap();
        state.spawn_object(2, TypeTag::Item, owned(9)).unwrap();
        state.spawn_object(3, TypeTag::Item, owned(4)).unwrap();

        let outcome = GameCommand::ReleaseConnection {
            connection: 9,
            policy: DisconnectPolicy::DestroyOwned,
        }
        .apply(&mut state, &GridMovement)
        .unwrap();

        assert_eq!(
            outcome,
            Outcome::Released {
                connection: 9,
                destroyed: vec![1, 2],
                disowned: vec![],
            }
        );
        assert_eq!(state.len(), 1);
        assert!(state.contains(3));
        assert!(state.indices_consistent());
    }

    #[test]
    fn test_release_disowns_objects() {
        let mut state = state();
        state.spawn_object(1, TypeTag::Item, owned(9)).unwrap();

        GameCommand::ReleaseConnection {
            connection: 9,
            policy: DisconnectPolicy::Disown,
        }
        .apply(&mut state, &GridMovement)
        .unwrap();

        assert_eq!(state.get(1).unwrap().owner, None);
        assert!(state.owned_by(9).is_empty());
    }
}
