//! The single owner of the game state.
//!
//! Every producer (reliable readers, the real-time receiver, the connection
//! lifecycle) submits [`Envelope`]s to one bounded queue. The authority task
//! drains it, applies commands one at a time and turns their outcomes into
//! [`Outbound`] messages. Nothing else ever holds the state, so nothing else
//! needs a lock on it.

use log::{debug, error, info};
use shared::{ConnectionId, NetworkMessage, ObjectId};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::time::{interval, MissedTickBehavior};

use crate::command::{GameCommand, Movement, Outcome, ValidationError};
use crate::game::{GameObject, GameState};
use crate::processor::Channel;

/// Cleared when a connection goes away. Commands carrying a cleared flag are
/// dropped instead of applied.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn revoke(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// A command plus what the authority needs to know about where it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub origin: Option<ConnectionId>,
    pub channel: Channel,
    pub sequence: Option<u32>,
    pub liveness: Option<Liveness>,
    pub command: GameCommand,
}

impl Envelope {
    /// Server-internal command. Never cancelled.
    pub fn system(command: GameCommand) -> Self {
        Self {
            origin: None,
            channel: Channel::Reliable,
            sequence: None,
            liveness: None,
            command,
        }
    }

    pub fn reliable(connection: ConnectionId, liveness: Liveness, command: GameCommand) -> Self {
        Self {
            origin: Some(connection),
            channel: Channel::Reliable,
            sequence: None,
            liveness: Some(liveness),
            command,
        }
    }

    pub fn realtime(
        connection: ConnectionId,
        liveness: Liveness,
        sequence: u32,
        command: GameCommand,
    ) -> Self {
        Self {
            origin: Some(connection),
            channel: Channel::Realtime,
            sequence: Some(sequence),
            liveness: Some(liveness),
            command,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("authority queue full")]
    Full,
    #[error("authority has shut down")]
    Closed,
}

/// Producer side of the authority queue.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    tx: mpsc::Sender<Envelope>,
}

impl CommandQueue {
    pub fn bounded(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Waits for room. Reliable commands are never dropped.
    pub async fn submit_reliable(&self, envelope: Envelope) -> Result<(), SubmitError> {
        self.tx.send(envelope).await.map_err(|_| SubmitError::Closed)
    }

    /// Drops the command if the queue is full.
    pub fn submit_realtime(&self, envelope: Envelope) -> Result<(), SubmitError> {
        self.tx.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => SubmitError::Full,
            TrySendError::Closed(_) => SubmitError::Closed,
        })
    }

    /// Never drops and never makes the caller wait. When the queue is full the
    /// command is handed to a task that waits for room, so it may land after
    /// commands submitted later.
    pub fn submit_detached(&self, envelope: Envelope) {
        match self.tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if tx.send(envelope).await.is_err() {
                        debug!("Authority gone before a deferred command was queued");
                    }
                });
            }
            Err(TrySendError::Closed(envelope)) => {
                debug!("Authority gone, dropped {:?}", envelope.command);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipients {
    One(ConnectionId),
    /// Every synchronized connection
    All,
    AllExcept(ConnectionId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Reliable {
        to: Recipients,
        message: NetworkMessage,
    },
    Realtime {
        to: Recipients,
        message: NetworkMessage,
    },
}

#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    Rejected(ValidationError),
    /// Real-time command not newer than one already applied
    Stale,
    /// Origin disconnected while the command was queued
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthorityStats {
    pub applied: u64,
    pub rejected: u64,
    pub stale: u64,
    pub cancelled: u64,
}

pub struct Authority {
    state: GameState,
    movement: Box<dyn Movement>,
    last_applied: HashMap<ConnectionId, u32>,
    dirty: BTreeSet<ObjectId>,
    outbound: mpsc::UnboundedSender<Outbound>,
    stats: AuthorityStats,
}

impl Authority {
    pub fn new(
        state: GameState,
        movement: Box<dyn Movement>,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            state,
            movement,
            last_applied: HashMap::new(),
            dirty: BTreeSet::new(),
            outbound,
            stats: AuthorityStats::default(),
        }
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    pub fn stats(&self) -> AuthorityStats {
        self.stats
    }

    /// Applies one queued command.
    pub fn handle(&mut self, envelope: Envelope) -> Disposition {
        if envelope.liveness.as_ref().is_some_and(|l| !l.is_alive()) {
            debug!("Dropped command from closed connection {:?}", envelope.origin);
            self.stats.cancelled += 1;
            return Disposition::Cancelled;
        }

        if let (Some(connection), Some(sequence)) = (envelope.origin, envelope.sequence) {
            if self
                .last_applied
                .get(&connection)
                .is_some_and(|last| sequence <= *last)
            {
                self.stats.stale += 1;
                return Disposition::Stale;
            }
            // Recorded even if the command is then rejected.
            self.last_applied.insert(connection, sequence);
        }

        match envelope.command.apply(&mut self.state, self.movement.as_ref()) {
            Ok(outcome) => {
                self.stats.applied += 1;
                self.publish(envelope.origin, outcome);
                Disposition::Applied
            }
            Err(e) => {
                debug!("Rejected command from {:?}: {}", envelope.origin, e);
                self.stats.rejected += 1;
                Disposition::Rejected(e)
            }
        }
    }

    fn send(&self, outbound: Outbound) {
        if self.outbound.send(outbound).is_err() {
            error!("Outbound dispatcher is gone");
        }
    }

    fn publish(&mut self, origin: Option<ConnectionId>, outcome: Outcome) {
        match outcome {
            Outcome::Created { object, request } => {
                if let (Some(connection), Some(request)) = (origin, request) {
                    self.send(Outbound::Reliable {
                        to: Recipients::One(connection),
                        message: NetworkMessage::ObjectCreateAck {
                            request,
                            object: object.id,
                        },
                    });
                }
                self.send(Outbound::Reliable {
                    to: Recipients::All,
                    message: create_message(&object),
                });
            }
            Outcome::Destroyed { id } => {
                self.dirty.remove(&id);
                self.send(Outbound::Reliable {
                    to: Recipients::All,
                    message: NetworkMessage::ObjectDestroy { object: id },
                });
            }
            Outcome::Updated { object } => {
                self.dirty.insert(object.id);
            }
            Outcome::Joined { connection, player } => {
                self.send(Outbound::Reliable {
                    to: Recipients::One(connection),
                    message: NetworkMessage::SyncComplete { player: player.id },
                });
                for object in self.state.iter() {
                    self.send(Outbound::Reliable {
                        to: Recipients::One(connection),
                        message: create_message(object),
                    });
                }
                self.send(Outbound::Reliable {
                    to: Recipients::AllExcept(connection),
                    message: create_message(&player),
                });
            }
            Outcome::Released {
                connection,
                destroyed,
                ..
            } => {
                self.last_applied.remove(&connection);
                for id in destroyed {
                    self.dirty.remove(&id);
                    self.send(Outbound::Reliable {
                        to: Recipients::All,
                        message: NetworkMessage::ObjectDestroy { object: id },
                    });
                }
            }
        }
    }

    /// Broadcasts every object changed since the last flush.
    pub fn flush_updates(&mut self) {
        for id in std::mem::take(&mut self.dirty) {
            if let Some(object) = self.state.get(id) {
                self.send(Outbound::Realtime {
                    to: Recipients::All,
                    message: NetworkMessage::ObjectUpdate {
                        object: object.id,
                        position: object.position,
                        facing: object.facing,
                    },
                });
            }
        }
    }

    /// Applies commands as they arrive and flushes updates once per tick.
    ///
    /// Stops when `stop` fires or every producer is gone. On stop the queue is
    /// closed and whatever was already buffered is still applied. Returns the
    /// final state.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<Envelope>,
        tick: Duration,
        mut stop: oneshot::Receiver<()>,
    ) -> GameState {
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Authority running with {} objects", self.state.len());

        loop {
            tokio::select! {
                envelope = commands.recv() => match envelope {
                    Some(envelope) => {
                        self.handle(envelope);
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    self.state.tick = self.state.tick.wrapping_add(1);
                    self.flush_updates();
                }
                _ = &mut stop => {
                    commands.close();
                    while let Ok(envelope) = commands.try_recv() {
                        self.handle(envelope);
                    }
                    break;
                }
            }
        }

        self.flush_updates();
        info!(
            "Authority stopped at tick {}: {} applied, {} rejected, {} stale, {} cancelled",
            self.state.tick,
            self.stats.applied,
            self.stats.rejected,
            self.stats.stale,
            self.stats.cancelled
        );
        self.state
    }
}

fn create_message(object: &GameObject) -> NetworkMessage {
    NetworkMessage::ObjectCreate {
        object: object.id,
        type_tag: object.type_tag,
        position: object.position,
        facing: object.facing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::GridMovement;
    use crate::game::{Spawn, StateError};
    use crate::registry::ObjectFactoryRegistry;
    use shared::{Direction, Position, TypeTag};

    fn authority() -> (Authority, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = GameState::new(Arc::new(ObjectFactoryRegistry::standard()));
        (Authority::new(state, Box::new(GridMovement), tx), rx)
    }

    fn with_player(authority: &mut Authority, connection: ConnectionId) -> ObjectId {
        let spawn = Envelope::system(GameCommand::SpawnPlayer {
            connection,
            position: Position::new(0, 0),
        });
        assert_eq!(authority.handle(spawn), Disposition::Applied);
        authority.state().owned_by(connection)[0]
    }

    fn input(connection: ConnectionId, liveness: &Liveness, sequence: u32, player: ObjectId) -> Envelope {
        Envelope::realtime(
            connection,
            liveness.clone(),
            sequence,
            GameCommand::ApplyInput {
                issuer: connection,
                player,
                direction: Direction::Up,
            },
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    #[test]
    fn test_out_of_order_realtime_command_is_stale() {
        let (mut authority, _rx) = authority();
        let liveness = Liveness::new();
        let player = with_player(&mut authority, 1);

        assert_eq!(authority.handle(input(1, &liveness, 3, player)), Disposition::Applied);
        assert_eq!(authority.handle(input(1, &liveness, 2, player)), Disposition::Stale);
        assert_eq!(authority.handle(input(1, &liveness, 3, player)), Disposition::Stale);

        assert_eq!(authority.state().get(player).unwrap().position, Position::new(0, 1));
        assert_eq!(authority.stats().stale, 2);
    }

    #[test]
    fn test_sequences_are_per_connection() {
        let (mut authority, _rx) = authority();
        let liveness = Liveness::new();
        let first = with_player(&mut authority, 1);
        let second = with_player(&mut authority, 2);

        assert_eq!(authority.handle(input(1, &liveness, 5, first)), Disposition::Applied);
        assert_eq!(authority.handle(input(2, &liveness, 1, second)), Disposition::Applied);
    }

    #[test]
    fn test_cancelled_after_disconnect() {
        let (mut authority, _rx) = authority();
        let liveness = Liveness::new();
        let player = with_player(&mut authority, 1);

        let queued = input(1, &liveness, 1, player);
        liveness.revoke();

        assert_eq!(authority.handle(queued), Disposition::Cancelled);
        assert_eq!(authority.state().get(player).unwrap().position, Position::new(0, 0));
    }

    #[test]
    fn test_rejected_command_leaves_state_untouched() {
        let (mut authority, _rx) = authority();
        let before = authority.state().snapshot();

        let disposition = authority.handle(Envelope::system(GameCommand::DestroyObject {
            id: 42,
            issuer: None,
        }));

        assert_eq!(
            disposition,
            Disposition::Rejected(ValidationError::State(StateError::NotFound(42)))
        );
        assert_eq!(authority.state().snapshot(), before);
    }

    #[test]
    fn test_join_sends_sync_then_world() {
        let (mut authority, mut rx) = authority();
        authority
            .handle(Envelope::system(GameCommand::CreateObject {
                id: Some(1),
                type_tag: TypeTag::Npc,
                spawn: Spawn::default(),
                request: None,
            }));
        drain(&mut rx);

        let player = with_player(&mut authority, 4);
        let sent = drain(&mut rx);

        assert_eq!(
            sent[0],
            Outbound::Reliable {
                to: Recipients::One(4),
                message: NetworkMessage::SyncComplete { player },
            }
        );
        let world: Vec<&Outbound> = sent[1..]
            .iter()
            .filter(|o| matches!(o, Outbound::Reliable { to: Recipients::One(4), .. }))
            .collect();
        assert_eq!(world.len(), 2);
        assert!(sent.iter().any(|o| matches!(
            o,
            Outbound::Reliable {
                to: Recipients::AllExcept(4),
                message: NetworkMessage::ObjectCreate { object, .. },
            } if *object == player
        )));
    }

    #[test]
    fn test_spawn_request_is_acknowledged() {
        let (mut authority, mut rx) = authority();
        let envelope = Envelope::reliable(
            2,
            Liveness::new(),
            GameCommand::CreateObject {
                id: None,
                type_tag: TypeTag::Item,
                spawn: Spawn {
                    owner: Some(2),
                    ..Default::default()
                },
                request: Some(77),
            },
        );
        assert_eq!(authority.handle(envelope), Disposition::Applied);

        let sent = drain(&mut rx);
        assert_eq!(
            sent[0],
            Outbound::Reliable {
                to: Recipients::One(2),
                message: NetworkMessage::ObjectCreateAck {
                    request: 77,
                    object: 1
                },
            }
        );
        assert!(matches!(
            sent[1],
            Outbound::Reliable {
                to: Recipients::All,
                message: NetworkMessage::ObjectCreate { object: 1, .. },
            }
        ));
    }

    #[test]
    fn test_updates_are_coalesced_per_flush() {
        let (mut authority, mut rx) = authority();
        let liveness = Liveness::new();
        let player = with_player(&mut authority, 1);
        drain(&mut rx);

        authority.handle(input(1, &liveness, 1, player));
        authority.handle(input(1, &liveness, 2, player));
        assert!(drain(&mut rx).is_empty());

        authority.flush_updates();
        assert_eq!(
            drain(&mut rx),
            vec![Outbound::Realtime {
                to: Recipients::All,
                message: NetworkMessage::ObjectUpdate {
                    object: player,
                    position: Position::new(0, 2),
                    facing: Direction::Up,
                },
            }]
        );

        authority.flush_updates();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_release_broadcasts_destroys() {
        let (mut authority, mut rx) = authority();
        let player = with_player(&mut authority, 1);
        drain(&mut rx);

        authority.handle(Envelope::system(GameCommand::ReleaseConnection {
            connection: 1,
            policy: Default::default(),
        }));

        assert_eq!(
            drain(&mut rx),
            vec![Outbound::Reliable {
                to: Recipients::All,
                message: NetworkMessage::ObjectDestroy { object: player },
            }]
        );
        assert!(authority.state().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_drops_realtime_commands() {
        let (queue, _rx) = CommandQueue::bounded(1);
        let liveness = Liveness::new();

        assert_eq!(queue.submit_realtime(input(1, &liveness, 1, 1)), Ok(()));
        assert_eq!(
            queue.submit_realtime(input(1, &liveness, 2, 1)),
            Err(SubmitError::Full)
        );
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure_to_reliable_commands() {
        let (queue, mut rx) = CommandQueue::bounded(1);
        let liveness = Liveness::new();
        queue
            .submit_reliable(Envelope::reliable(1, liveness.clone(), GameCommand::DestroyObject { id: 1, issuer: None }))
            .await
            .unwrap();

        let blocked = queue.submit_reliable(Envelope::reliable(
            1,
            liveness,
            GameCommand::DestroyObject { id: 2, issuer: None },
        ));
        tokio::pin!(blocked);

        let waited = tokio::time::timeout(Duration::from_millis(50), &mut blocked).await;
        assert!(waited.is_err(), "second reliable submit should wait for room");

        rx.recv().await.unwrap();
        assert_eq!(blocked.await, Ok(()));
        assert!(matches!(
            rx.recv().await.unwrap().command,
            GameCommand::DestroyObject { id: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_detached_submit_does_not_wait_on_full_queue() {
        let (queue, mut rx) = CommandQueue::bounded(1);
        queue.submit_detached(Envelope::system(GameCommand::DestroyObject { id: 1, issuer: None }));

        // Queue is full; returns at once and delivers once there is room.
        queue.submit_detached(Envelope::system(GameCommand::ReleaseConnection {
            connection: 9,
            policy: Default::default(),
        }));

        assert!(matches!(
            rx.recv().await.unwrap().command,
            GameCommand::DestroyObject { id: 1, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap().command,
            GameCommand::ReleaseConnection { connection: 9, .. }
        ));
    }

    #[tokio::test]
    async fn test_run_applies_in_order_and_returns_state() {
        let (tx, mut outbound) = mpsc::unbounded_channel();
        let state = GameState::new(Arc::new(ObjectFactoryRegistry::standard()));
        let authority = Authority::new(state, Box::new(GridMovement), tx);
        let (queue, commands) = CommandQueue::bounded(8);

        let (_stop_tx, stop) = oneshot::channel();
        let handle = tokio::spawn(authority.run(commands, Duration::from_millis(5), stop));
        for id in 1..=3 {
            queue
                .submit_reliable(Envelope::system(GameCommand::CreateObject {
                    id: Some(id),
                    type_tag: TypeTag::Marker,
                    spawn: Spawn::default(),
                    request: None,
                }))
                .await
                .unwrap();
        }
        drop(queue);

        let state = handle.await.unwrap();
        assert_eq!(state.len(), 3);

        let mut created = Vec::new();
        while let Ok(Outbound::Reliable {
            message: NetworkMessage::ObjectCreate { object, .. },
            ..
        }) = outbound.try_recv()
        {
            created.push(object);
        }
        assert_eq!(created, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stop_applies_buffered_commands() {
        let (tx, _outbound) = mpsc::unbounded_channel();
        let state = GameState::new(Arc::new(ObjectFactoryRegistry::standard()));
        let authority = Authority::new(state, Box::new(GridMovement), tx);
        let (queue, commands) = CommandQueue::bounded(8);
        let (stop_tx, stop) = oneshot::channel();

        queue
            .submit_reliable(Envelope::system(GameCommand::CreateObject {
                id: Some(9),
                type_tag: TypeTag::Item,
                spawn: Spawn::default(),
                request: None,
            }))
            .await
            .unwrap();
        stop_tx.send(()).unwrap();

        let state = authority.run(commands, Duration::from_secs(60), stop).await;
        assert!(state.contains(9));
        assert_eq!(
            queue.submit_realtime(Envelope::system(GameCommand::DestroyObject { id: 9, issuer: None })),
            Err(SubmitError::Closed)
        );
    }
}
