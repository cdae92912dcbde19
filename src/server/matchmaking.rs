//! Lifecycle command handlers: matchmaking, private/local/AI rooms,
//! leave/forfeit/reconnect, spectating, and the end-of-game sequence. All of
//! it runs on the coordinator actor, so the room table and the user→room
//! index only ever change one command at a time.

use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{error, info, warn};
use rand::Rng;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::data::{
    Difficulty, Direction, GameId, GameMode, GameRow, Presence, RoomStatus, Side, TournamentLink,
    UserId,
    AI_USER_ID, AI_USER_NAME,
};
use crate::protocol::{GameEvent, GameStarting, ServerEvent};

use super::room::{
    self, GameOutcome, PlayerSlot, RejoinError, RoomConfig, RoomMsg, RECONNECT_WINDOW,
};
use super::tournament::TournamentMsg;
use super::{ai, ranking, GameServer, Message, RoomSlot};

/// Countdown between pairing up and the first tick.
pub const GAME_START_DELAY: Duration = Duration::from_secs(3);
/// How long a terminal room stays addressable before it is dropped.
pub const ROOM_LINGER: Duration = Duration::from_secs(30);

const ROOM_ID_SPACE: i64 = 1_000_000;

#[derive(Error, Debug)]
pub(super) enum LifecycleError {
    #[error("user is already in a game")]
    AlreadyInGame,
    #[error("user is not in a game")]
    NotInGame,
    #[error("room does not exist")]
    GameNotFound,
    #[error("room is not private")]
    NotPrivate,
    #[error("room is full")]
    Full,
    #[error("cannot join your own room")]
    OwnGame,
    #[error("room cannot be joined right now")]
    Unavailable,
    #[error("user is not a participant of that room")]
    NotAPlayer,
}

impl LifecycleError {
    pub(super) fn code(&self) -> &'static str {
        match self {
            LifecycleError::AlreadyInGame => "ALREADY_IN_GAME",
            LifecycleError::NotInGame => "NOT_IN_GAME",
            LifecycleError::GameNotFound => "GAME_NOT_FOUND",
            LifecycleError::NotPrivate => "NOT_PRIVATE",
            LifecycleError::Full => "FULL",
            LifecycleError::OwnGame => "OWN_GAME",
            LifecycleError::Unavailable => "UNAVAILABLE",
            LifecycleError::NotAPlayer => "NOT_A_PLAYER",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum LeaveKind {
    Command,
    Disconnect,
}

/// A room that has not started ticking yet. It lives inside the coordinator;
/// only at start does it become an actor of its own.
pub(crate) struct PendingRoom {
    pub mode: GameMode,
    pub status: RoomStatus,
    pub p1: PlayerSlot,
    pub p2: Option<PlayerSlot>,
    pub tournament: Option<TournamentLink>,
    pub difficulty: Option<Difficulty>,
}

impl GameServer {
    pub(super) async fn handle_command(
        &mut self,
        user: UserId,
        event: GameEvent,
    ) -> Result<(), LifecycleError> {
        match event {
            GameEvent::JoinMatchmaking => self.join_matchmaking(user).await,
            GameEvent::CreatePrivate => self.create_private(user).await,
            GameEvent::JoinPrivate { game_id } => self.join_private(user, game_id).await,
            GameEvent::CreateLocal {
                player1_name,
                player2_name,
            } => self.create_local(user, player1_name, player2_name).await,
            GameEvent::CreateAi { difficulty } => self.create_ai(user, difficulty).await,
            GameEvent::Move {
                game_id,
                direction,
                player_number,
            } => self.route_input(user, game_id, direction, player_number).await,
            GameEvent::Leave => self.leave_game(user, LeaveKind::Command).await,
            GameEvent::Forfeit => self.forfeit(user).await,
            GameEvent::Rejoin { game_id } => self.rejoin(user, game_id).await,
            GameEvent::Spectate { game_id } => self.spectate(user, game_id).await,
        }
    }

    fn display_name(&self, user: UserId) -> String {
        self.players
            .get(&user)
            .cloned()
            .unwrap_or_else(|| format!("user-{user}"))
    }

    fn alloc_room_id(&mut self) -> GameId {
        loop {
            let id = self.rng.gen_range(1..ROOM_ID_SPACE);
            if !self.rooms.contains_key(&id) {
                return id;
            }
        }
    }

    /// A user entering any kind of game first leaves whatever they are in.
    async fn ensure_unbound(&mut self, user: UserId) {
        if self.user_to_room.contains_key(&user) {
            let _ = self.leave_game(user, LeaveKind::Command).await;
        }
    }

    async fn join_matchmaking(&mut self, user: UserId) -> Result<(), LifecycleError> {
        self.ensure_unbound(user).await;

        // first open public seat wins
        let open = self.rooms.iter().find_map(|(id, slot)| match slot {
            RoomSlot::Pending(p)
                if p.mode == GameMode::Public
                    && p.status == RoomStatus::Waiting
                    && p.p2.is_none() =>
            {
                Some(*id)
            }
            _ => None,
        });

        match open {
            Some(room_id) => self.fill_and_start(room_id, user).await,
            None => {
                self.create_pending(user, GameMode::Public);
                Ok(())
            }
        }
    }

    async fn create_private(&mut self, user: UserId) -> Result<(), LifecycleError> {
        self.ensure_unbound(user).await;
        self.create_pending(user, GameMode::Private);
        Ok(())
    }

    async fn join_private(&mut self, user: UserId, room_id: GameId) -> Result<(), LifecycleError> {
        match self.rooms.get(&room_id) {
            None | Some(RoomSlot::Done) => return Err(LifecycleError::GameNotFound),
            Some(RoomSlot::Running(_)) => return Err(LifecycleError::Unavailable),
            Some(RoomSlot::Pending(p)) => {
                if p.mode != GameMode::Private {
                    return Err(LifecycleError::NotPrivate);
                }
                if p.p1.user_id == user {
                    return Err(LifecycleError::OwnGame);
                }
                if p.p2.is_some() {
                    return Err(LifecycleError::Full);
                }
                if p.status != RoomStatus::Waiting {
                    return Err(LifecycleError::Unavailable);
                }
            }
        }

        self.ensure_unbound(user).await;
        self.fill_and_start(room_id, user).await
    }

    async fn create_local(
        &mut self,
        user: UserId,
        player1_name: String,
        player2_name: String,
    ) -> Result<(), LifecycleError> {
        self.ensure_unbound(user).await;

        let id = self.alloc_room_id();
        let p1 = PlayerSlot {
            user_id: user,
            name: player1_name,
        };
        let p2 = PlayerSlot {
            user_id: user,
            name: player2_name,
        };
        self.insert_starting_room(id, GameMode::Local, p1, p2, None, None);
        Ok(())
    }

    async fn create_ai(
        &mut self,
        user: UserId,
        difficulty: Difficulty,
    ) -> Result<(), LifecycleError> {
        self.ensure_unbound(user).await;

        let id = self.alloc_room_id();
        let human = PlayerSlot {
            user_id: user,
            name: self.display_name(user),
        };
        let machine = PlayerSlot {
            user_id: AI_USER_ID,
            name: AI_USER_NAME.to_string(),
        };
        let (p1, p2) = if self.rng.gen_bool(0.5) {
            (machine, human)
        } else {
            (human, machine)
        };
        self.insert_starting_room(id, GameMode::Ai, p1, p2, None, Some(difficulty));
        Ok(())
    }

    /// Tournament matches skip the queue entirely: both seats are known and a
    /// game row is written up front so the orchestrator can find the linkage.
    pub(super) async fn create_tournament_game(
        &mut self,
        p1: UserId,
        p2: UserId,
        link: TournamentLink,
    ) -> Result<GameId> {
        self.ensure_unbound(p1).await;
        self.ensure_unbound(p2).await;

        let id = self.alloc_room_id();
        self.store
            .create_game(GameRow {
                id,
                mode: GameMode::Tournament,
                p1_id: p1,
                p2_id: Some(p2),
                p1_score: 0,
                p2_score: 0,
                winner_id: None,
                duration_secs: 0,
                tournament: Some(link.clone()),
            })
            .await
            .map_err(|e| anyhow!("failed to pre-create tournament game: {e:?}"))?;

        let s1 = PlayerSlot {
            user_id: p1,
            name: self.display_name(p1),
        };
        let s2 = PlayerSlot {
            user_id: p2,
            name: self.display_name(p2),
        };
        self.insert_starting_room(id, GameMode::Tournament, s1, s2, Some(link), None);
        Ok(id)
    }

    /// Fresh WAITING room with a single occupant.
    fn create_pending(&mut self, user: UserId, mode: GameMode) -> GameId {
        let id = self.alloc_room_id();
        let p1 = PlayerSlot {
            user_id: user,
            name: self.display_name(user),
        };
        self.rooms.insert(
            id,
            RoomSlot::Pending(PendingRoom {
                mode,
                status: RoomStatus::Waiting,
                p1,
                p2: None,
                tournament: None,
                difficulty: None,
            }),
        );
        self.user_to_room.insert(user, id);
        self.hub
            .emit_to_user(user, ServerEvent::GameCreated { game_id: id, mode });
        info!("room {id} created ({mode:?}) by {user}");
        id
    }

    /// Seat the second player and begin the countdown.
    async fn fill_and_start(&mut self, room_id: GameId, user: UserId) -> Result<(), LifecycleError> {
        let name = self.display_name(user);
        let starting = match self.rooms.get_mut(&room_id) {
            Some(RoomSlot::Pending(p)) if p.p2.is_none() => {
                p.p2 = Some(PlayerSlot {
                    user_id: user,
                    name,
                });
                p.status = RoomStatus::Starting;
                let p2 = p.p2.as_ref().unwrap();
                GameStarting {
                    game_id: room_id,
                    mode: p.mode,
                    p1_id: p.p1.user_id,
                    p2_id: p2.user_id,
                    p1_name: p.p1.name.clone(),
                    p2_name: p2.name.clone(),
                    starts_in_ms: GAME_START_DELAY.as_millis() as u64,
                }
            }
            _ => return Err(LifecycleError::GameNotFound),
        };

        self.user_to_room.insert(user, room_id);
        self.hub
            .emit_to_user(starting.p1_id, ServerEvent::GameStarting(starting.clone()));
        self.hub
            .emit_to_user(user, ServerEvent::GameStarting(starting));
        self.schedule_start(room_id);
        Ok(())
    }

    /// Pre-seated room (local, AI, tournament) that goes straight to the
    /// countdown without ever sitting in the queue.
    fn insert_starting_room(
        &mut self,
        id: GameId,
        mode: GameMode,
        p1: PlayerSlot,
        p2: PlayerSlot,
        tournament: Option<TournamentLink>,
        difficulty: Option<Difficulty>,
    ) {
        let starting = GameStarting {
            game_id: id,
            mode,
            p1_id: p1.user_id,
            p2_id: p2.user_id,
            p1_name: p1.name.clone(),
            p2_name: p2.name.clone(),
            starts_in_ms: GAME_START_DELAY.as_millis() as u64,
        };

        for slot in [&p1, &p2] {
            if slot.user_id != AI_USER_ID {
                self.user_to_room.insert(slot.user_id, id);
            }
        }
        self.rooms.insert(
            id,
            RoomSlot::Pending(PendingRoom {
                mode,
                status: RoomStatus::Starting,
                p1,
                p2: Some(p2),
                tournament,
                difficulty,
            }),
        );

        let mut seats = vec![starting.p1_id];
        if starting.p2_id != starting.p1_id {
            seats.push(starting.p2_id);
        }
        for user in seats {
            self.hub
                .emit_to_user(user, ServerEvent::GameCreated { game_id: id, mode });
            self.hub
                .emit_to_user(user, ServerEvent::GameStarting(starting.clone()));
        }
        self.schedule_start(id);
        info!("room {id} created ({mode:?})");
    }

    fn schedule_start(&self, room_id: GameId) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(GAME_START_DELAY).await;
            let _ = tx.send(Message::StartRoom { room: room_id }).await;
        });
    }

    fn schedule_cleanup(&self, room_id: GameId) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ROOM_LINGER).await;
            let _ = tx.send(Message::CleanupRoom { room: room_id }).await;
        });
    }

    /// Warmup timer fired: promote the pending room to a live actor. A room
    /// cancelled during the countdown simply is not Starting any more and the
    /// timer becomes a no-op.
    pub(super) async fn start_room(&mut self, room_id: GameId) {
        let (p1, p2, mode, tournament, difficulty) = match self.rooms.get(&room_id) {
            Some(RoomSlot::Pending(p)) if p.status == RoomStatus::Starting => (
                p.p1.clone(),
                p.p2.clone(),
                p.mode,
                p.tournament.clone(),
                p.difficulty,
            ),
            _ => return,
        };
        let Some(p2) = p2 else {
            error!("room {room_id} reached start with an empty seat; cancelling");
            let _ = self.cancel_pending(room_id, None).await;
            return;
        };
        let cfg = RoomConfig {
            id: room_id,
            mode,
            p1,
            p2,
            tournament,
            seed: None,
        };

        let handle = room::spawn(cfg.clone(), self.hub.clone(), self.self_tx.clone());

        // participants who are not connected right now immediately enter the
        // reconnection window; everyone else is marked in-game
        let mut participants = vec![cfg.p1.user_id];
        if cfg.p2.user_id != cfg.p1.user_id {
            participants.push(cfg.p2.user_id);
        }
        for user in participants {
            if user == AI_USER_ID {
                continue;
            }
            if self.hub.is_connected(user) {
                self.hub.set_status(user, Presence::InGame);
            } else {
                if self.user_to_room.get(&user) == Some(&room_id) {
                    self.user_to_room.remove(&user);
                }
                handle.send(RoomMsg::PlayerLeft { user }).await;
            }
        }

        if cfg.mode == GameMode::Ai {
            let side = if cfg.p1.user_id == AI_USER_ID {
                Side::Left
            } else {
                Side::Right
            };
            ai::spawn(
                handle.clone(),
                AI_USER_ID,
                side,
                difficulty.unwrap_or(Difficulty::Medium),
            );
        }

        self.rooms.insert(room_id, RoomSlot::Running(handle));
    }

    async fn route_input(
        &mut self,
        user: UserId,
        game_id: GameId,
        direction: Direction,
        player_number: Option<u8>,
    ) -> Result<(), LifecycleError> {
        match self.rooms.get(&game_id) {
            Some(RoomSlot::Running(handle)) => {
                handle
                    .send(RoomMsg::Input {
                        user,
                        direction,
                        player_number,
                    })
                    .await;
                Ok(())
            }
            // inputs during the countdown are simply dropped
            Some(RoomSlot::Pending(_)) => Ok(()),
            _ => Err(LifecycleError::GameNotFound),
        }
    }

    pub(super) async fn leave_game(
        &mut self,
        user: UserId,
        kind: LeaveKind,
    ) -> Result<(), LifecycleError> {
        let Some(&room_id) = self.user_to_room.get(&user) else {
            return Err(LifecycleError::NotInGame);
        };

        match self.rooms.get(&room_id) {
            Some(RoomSlot::Pending(_)) => self.cancel_pending(room_id, Some(user)).await,
            Some(RoomSlot::Running(handle)) => {
                let handle = handle.clone();
                self.user_to_room.remove(&user);
                self.hub.set_status(user, Presence::Online);
                if kind == LeaveKind::Command {
                    self.hub.emit_to_user(
                        user,
                        ServerEvent::GameLeft {
                            game_id: room_id,
                            reconnect_deadline_ms: RECONNECT_WINDOW.as_millis() as u64,
                        },
                    );
                }
                handle.send(RoomMsg::PlayerLeft { user }).await;
                Ok(())
            }
            _ => {
                // stale binding to a room that already wound down
                self.user_to_room.remove(&user);
                Ok(())
            }
        }
    }

    /// Tear down a room that never started. Both seats are released and told;
    /// a tournament-linked warmup is scored as a walkover for the seat that
    /// stayed.
    async fn cancel_pending(
        &mut self,
        room_id: GameId,
        leaver: Option<UserId>,
    ) -> Result<(), LifecycleError> {
        if !matches!(self.rooms.get(&room_id), Some(RoomSlot::Pending(_))) {
            return Err(LifecycleError::GameNotFound);
        }
        let Some(RoomSlot::Pending(p)) = self.rooms.insert(room_id, RoomSlot::Done) else {
            return Err(LifecycleError::GameNotFound);
        };

        if let Some(link) = &p.tournament {
            let winner = leaver.and_then(|l| {
                if p.p1.user_id == l {
                    p.p2.as_ref().map(|s| s.user_id)
                } else {
                    Some(p.p1.user_id)
                }
            });
            if let Err(e) = self.store.finish_game(room_id, 0, 0, winner, 0).await {
                warn!("failed to record walkover for game {room_id}: {e:?}");
            }
            let _ = self
                .tournaments
                .send(TournamentMsg::GameEnded {
                    tournament_id: link.tournament_id,
                    game_id: room_id,
                    winner_id: winner,
                })
                .await;
        }

        let mut members = vec![p.p1.user_id];
        if let Some(p2) = &p.p2 {
            if p2.user_id != p.p1.user_id {
                members.push(p2.user_id);
            }
        }
        for member in members {
            if member == AI_USER_ID {
                continue;
            }
            if self.user_to_room.get(&member) == Some(&room_id) {
                self.user_to_room.remove(&member);
                self.hub.set_status(member, Presence::Online);
            }
            self.hub
                .emit_to_user(member, ServerEvent::GameCancelled { game_id: room_id });
        }

        self.schedule_cleanup(room_id);
        info!("room {room_id} cancelled during warmup");
        Ok(())
    }

    async fn forfeit(&mut self, user: UserId) -> Result<(), LifecycleError> {
        let Some(&room_id) = self.user_to_room.get(&user) else {
            return Err(LifecycleError::NotInGame);
        };
        match self.rooms.get(&room_id) {
            Some(RoomSlot::Running(handle)) => {
                handle.send(RoomMsg::Forfeit { user }).await;
                Ok(())
            }
            // forfeiting a room that never started is just leaving it
            Some(RoomSlot::Pending(_)) => self.leave_game(user, LeaveKind::Command).await,
            _ => {
                self.user_to_room.remove(&user);
                Err(LifecycleError::NotInGame)
            }
        }
    }

    async fn rejoin(&mut self, user: UserId, game_id: GameId) -> Result<(), LifecycleError> {
        if self.user_to_room.contains_key(&user) {
            return Err(LifecycleError::AlreadyInGame);
        }
        let Some(RoomSlot::Running(handle)) = self.rooms.get(&game_id) else {
            return Err(LifecycleError::GameNotFound);
        };

        let (resp, rx) = oneshot::channel();
        if !handle.send(RoomMsg::Rejoin { user, resp }).await {
            return Err(LifecycleError::GameNotFound);
        }
        match rx.await {
            Ok(Ok(())) => {
                self.user_to_room.insert(user, game_id);
                self.hub.set_status(user, Presence::InGame);
                info!("user {user} rejoined room {game_id}");
                Ok(())
            }
            Ok(Err(RejoinError::NotAPlayer)) => Err(LifecycleError::NotAPlayer),
            Ok(Err(RejoinError::NotDisconnected)) => Err(LifecycleError::Unavailable),
            Err(_) => Err(LifecycleError::GameNotFound),
        }
    }

    async fn spectate(&mut self, user: UserId, game_id: GameId) -> Result<(), LifecycleError> {
        let Some(RoomSlot::Running(handle)) = self.rooms.get(&game_id) else {
            return Err(LifecycleError::GameNotFound);
        };
        let (resp, rx) = oneshot::channel();
        if !handle.send(RoomMsg::Spectate { user, resp }).await {
            return Err(LifecycleError::GameNotFound);
        }
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(LifecycleError::Unavailable),
            Err(_) => Err(LifecycleError::GameNotFound),
        }
    }

    /// The coordinator half of the end-of-game sequence: persist, rank,
    /// notify the orchestrator, release the seats, and let the room linger
    /// briefly for late lookups. The room already told its channel.
    pub(super) async fn on_game_ended(&mut self, outcome: GameOutcome) {
        info!(
            "room {} ended: {:?} {}-{} winner={:?} forfeit={}",
            outcome.id,
            outcome.mode,
            outcome.p1_score,
            outcome.p2_score,
            outcome.winner,
            outcome.forfeit
        );

        // persistence first; a store failure is logged and the game still
        // terminates for everyone
        let persisted = if outcome.tournament.is_some() {
            self.store
                .finish_game(
                    outcome.id,
                    outcome.p1_score as i64,
                    outcome.p2_score as i64,
                    outcome.winner,
                    outcome.duration_secs as i64,
                )
                .await
        } else {
            self.store
                .create_game(GameRow {
                    id: outcome.id,
                    mode: outcome.mode,
                    p1_id: outcome.p1,
                    p2_id: Some(outcome.p2),
                    p1_score: outcome.p1_score as i64,
                    p2_score: outcome.p2_score as i64,
                    winner_id: outcome.winner,
                    duration_secs: outcome.duration_secs as i64,
                    tournament: None,
                })
                .await
        };
        if let Err(e) = persisted {
            error!("failed to persist game {}: {e:?}", outcome.id);
        }

        // ladder movement: public and tournament games between two humans
        if outcome.mode.is_ranked() && ranking::moves_ladder(outcome.p1, outcome.p2) {
            if let Some(winner) = outcome.winner {
                let loser = if winner == outcome.p1 {
                    outcome.p2
                } else {
                    outcome.p1
                };
                let multiplier = outcome
                    .tournament
                    .as_ref()
                    .map(|t| ranking::round_multiplier(t.round, t.total_rounds))
                    .unwrap_or(1.0);
                self.apply_ranking(winner, loser, outcome.id, outcome.duration_secs as i64, multiplier)
                    .await;
            }
        }

        // tournament fan-in happens only after persistence so the next match
        // never observes a half-written result
        if let Some(link) = &outcome.tournament {
            let _ = self
                .tournaments
                .send(TournamentMsg::GameEnded {
                    tournament_id: link.tournament_id,
                    game_id: outcome.id,
                    winner_id: outcome.winner,
                })
                .await;
        }

        // release the seats, but only bindings that still point at this room:
        // a player who left and queued elsewhere must not be yanked out
        for user in [outcome.p1, outcome.p2] {
            if user == AI_USER_ID {
                continue;
            }
            if self.user_to_room.get(&user) == Some(&outcome.id) {
                self.user_to_room.remove(&user);
                self.hub.set_status(user, Presence::Online);
            }
        }

        self.rooms.insert(outcome.id, RoomSlot::Done);
        self.schedule_cleanup(outcome.id);
    }

    async fn apply_ranking(
        &mut self,
        winner: UserId,
        loser: UserId,
        game_id: GameId,
        duration_secs: i64,
        multiplier: f64,
    ) {
        let w = self.store.get_user(winner).await;
        let l = self.store.get_user(loser).await;
        let (Ok(Some(mut w)), Ok(Some(mut l))) = (w, l) else {
            warn!("ranking skipped for game {game_id}: missing user row");
            return;
        };

        ranking::apply_result(&mut w, &mut l, game_id, duration_secs, multiplier);

        for user in [w, l] {
            let id = user.id;
            if let Err(e) = self.store.write_user_stats(user).await {
                warn!("stats write for {id} failed after game {game_id}: {e:?}");
            }
        }
        if let Err(e) = self.store.update_ranks().await {
            warn!("rank recomputation failed after game {game_id}: {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::INITIAL_SCORE;
    use crate::store;
    use std::collections::HashMap;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tokio::sync::mpsc;

    struct Rig {
        gs: GameServer,
        _self_rx: mpsc::Receiver<Message>,
        tournament_rx: mpsc::Receiver<TournamentMsg>,
    }

    async fn rig() -> Rig {
        let store = store::run(":memory:").unwrap();
        for id in 5..=9 {
            store
                .insert_user(id, &format!("u{id}"), &format!("u{id}@example.com"))
                .await
                .unwrap();
        }
        let (self_tx, _self_rx) = mpsc::channel(256);
        let (ttx, tournament_rx) = mpsc::channel(256);
        let gs = GameServer {
            hub: super::super::hub::Hub::new(),
            store,
            tournaments: ttx,
            self_tx,
            players: HashMap::new(),
            rooms: HashMap::new(),
            user_to_room: HashMap::new(),
            rng: StdRng::seed_from_u64(11),
        };
        Rig {
            gs,
            _self_rx,
            tournament_rx,
        }
    }

    fn connect(gs: &mut GameServer, user: UserId) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (_id, rx) = gs.hub.add_connection(user);
        gs.players.insert(user, format!("u{user}"));
        rx
    }

    fn bound_room(gs: &GameServer, user: UserId) -> GameId {
        *gs.user_to_room.get(&user).expect("user should be in a room")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn two_users_pair_into_one_room() {
        let mut rig = rig().await;
        let mut rx5 = connect(&mut rig.gs, 5);
        let mut rx6 = connect(&mut rig.gs, 6);

        rig.gs.join_matchmaking(5).await.unwrap();
        rig.gs.join_matchmaking(6).await.unwrap();

        let room = bound_room(&rig.gs, 5);
        assert_eq!(room, bound_room(&rig.gs, 6));
        match rig.gs.rooms.get(&room) {
            Some(RoomSlot::Pending(p)) => {
                assert_eq!(p.status, RoomStatus::Starting);
                assert_eq!(p.mode, GameMode::Public);
            }
            _ => panic!("expected a pending room"),
        }

        for rx in [&mut rx5, &mut rx6] {
            assert!(
                drain(rx)
                    .iter()
                    .any(|e| matches!(e, ServerEvent::GameStarting(_))),
                "both players should hear game-starting"
            );
        }
    }

    #[tokio::test]
    async fn rejoining_the_queue_replaces_the_old_room() {
        let mut rig = rig().await;
        connect(&mut rig.gs, 5);

        rig.gs.join_matchmaking(5).await.unwrap();
        let first = bound_room(&rig.gs, 5);
        rig.gs.join_matchmaking(5).await.unwrap();
        let second = bound_room(&rig.gs, 5);

        assert_ne!(first, second);
        assert!(matches!(rig.gs.rooms.get(&first), Some(RoomSlot::Done)));
        // at most one binding per user, ever
        assert_eq!(
            rig.gs
                .user_to_room
                .iter()
                .filter(|(u, _)| **u == 5)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn private_room_join_errors() {
        let mut rig = rig().await;
        connect(&mut rig.gs, 5);
        connect(&mut rig.gs, 6);
        connect(&mut rig.gs, 7);
        connect(&mut rig.gs, 8);

        rig.gs.create_private(5).await.unwrap();
        let private = bound_room(&rig.gs, 5);

        assert!(matches!(
            rig.gs.join_private(6, 999_999_999).await,
            Err(LifecycleError::GameNotFound)
        ));
        assert!(matches!(
            rig.gs.join_private(5, private).await,
            Err(LifecycleError::OwnGame)
        ));

        // a public waiting room is not joinable by id
        rig.gs.join_matchmaking(8).await.unwrap();
        let public = bound_room(&rig.gs, 8);
        assert!(matches!(
            rig.gs.join_private(6, public).await,
            Err(LifecycleError::NotPrivate)
        ));

        rig.gs.join_private(6, private).await.unwrap();
        assert!(matches!(
            rig.gs.join_private(7, private).await,
            Err(LifecycleError::Full)
        ));
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let mut rig = rig().await;
        let mut rx5 = connect(&mut rig.gs, 5);

        rig.gs.join_matchmaking(5).await.unwrap();
        rig.gs.leave_game(5, LeaveKind::Command).await.unwrap();
        assert!(matches!(
            rig.gs.leave_game(5, LeaveKind::Command).await,
            Err(LifecycleError::NotInGame)
        ));
        assert!(drain(&mut rx5)
            .iter()
            .any(|e| matches!(e, ServerEvent::GameCancelled { .. })));
    }

    #[tokio::test]
    async fn leaving_a_warmup_cancels_for_the_opponent_too() {
        let mut rig = rig().await;
        connect(&mut rig.gs, 5);
        let mut rx6 = connect(&mut rig.gs, 6);

        rig.gs.join_matchmaking(5).await.unwrap();
        rig.gs.join_matchmaking(6).await.unwrap();
        let room = bound_room(&rig.gs, 5);

        rig.gs.leave_game(5, LeaveKind::Command).await.unwrap();

        assert!(rig.gs.user_to_room.get(&6).is_none());
        assert!(matches!(rig.gs.rooms.get(&room), Some(RoomSlot::Done)));
        assert!(drain(&mut rx6)
            .iter()
            .any(|e| matches!(e, ServerEvent::GameCancelled { .. })));
        // the countdown timer finds a Done slot and starts nothing
        rig.gs.start_room(room).await;
        assert!(matches!(rig.gs.rooms.get(&room), Some(RoomSlot::Done)));
    }

    #[tokio::test]
    async fn leaving_a_live_game_enters_the_reconnect_window() {
        let mut rig = rig().await;
        let mut rx5 = connect(&mut rig.gs, 5);
        connect(&mut rig.gs, 6);

        rig.gs.join_matchmaking(5).await.unwrap();
        rig.gs.join_matchmaking(6).await.unwrap();
        let room = bound_room(&rig.gs, 5);
        rig.gs.start_room(room).await;
        assert!(matches!(rig.gs.rooms.get(&room), Some(RoomSlot::Running(_))));

        rig.gs.leave_game(5, LeaveKind::Command).await.unwrap();

        assert!(rig.gs.user_to_room.get(&5).is_none());
        assert!(rig.gs.user_to_room.get(&6).is_some(), "opponent stays bound");
        let events = drain(&mut rx5);
        assert!(events.iter().any(|e| matches!(
            e,
            ServerEvent::GameLeft {
                reconnect_deadline_ms: 30_000,
                ..
            }
        )));

        // the leaver is free to queue again right away
        rig.gs.join_matchmaking(5).await.unwrap();
        assert_ne!(bound_room(&rig.gs, 5), room);
    }

    #[tokio::test]
    async fn ai_rooms_seat_the_ai_on_one_side() {
        let mut rig = rig().await;
        connect(&mut rig.gs, 5);

        rig.gs.create_ai(5, Difficulty::Hard).await.unwrap();
        let room = bound_room(&rig.gs, 5);
        match rig.gs.rooms.get(&room) {
            Some(RoomSlot::Pending(p)) => {
                let seats = [p.p1.user_id, p.p2.as_ref().unwrap().user_id];
                assert!(seats.contains(&AI_USER_ID));
                assert!(seats.contains(&5));
                assert_eq!(p.status, RoomStatus::Starting);
            }
            _ => panic!("expected pending AI room"),
        }
        // the AI never occupies a user→room binding
        assert!(rig.gs.user_to_room.get(&AI_USER_ID).is_none());
    }

    #[tokio::test]
    async fn ranked_outcome_moves_elo_and_notifies_nobody_else() {
        let mut rig = rig().await;

        rig.gs
            .on_game_ended(GameOutcome {
                id: 777,
                mode: GameMode::Public,
                p1: 5,
                p2: 6,
                p1_score: 11,
                p2_score: 4,
                winner: Some(5),
                forfeit: false,
                duration_secs: 120,
                tournament: None,
            })
            .await;

        let w = rig.gs.store.get_user(5).await.unwrap().unwrap();
        let l = rig.gs.store.get_user(6).await.unwrap().unwrap();
        assert_eq!(w.score, INITIAL_SCORE + 16);
        assert_eq!(l.score, INITIAL_SCORE - 16);
        assert_eq!(w.rank, 1);
        assert_eq!(l.rank, 2);
        assert_eq!(w.game_history, vec![777]);
        assert!(rig.tournament_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ai_outcome_never_touches_the_ladder() {
        let mut rig = rig().await;

        rig.gs
            .on_game_ended(GameOutcome {
                id: 778,
                mode: GameMode::Ai,
                p1: 5,
                p2: AI_USER_ID,
                p1_score: 2,
                p2_score: 11,
                winner: Some(AI_USER_ID),
                forfeit: false,
                duration_secs: 60,
                tournament: None,
            })
            .await;

        let u = rig.gs.store.get_user(5).await.unwrap().unwrap();
        assert_eq!(u.score, INITIAL_SCORE);
        assert_eq!(u.games_played, 0);
    }

    #[tokio::test]
    async fn tournament_outcome_fans_in_after_persistence() {
        let mut rig = rig().await;
        let link = TournamentLink {
            tournament_id: 1,
            round: 2,
            total_rounds: 2,
            match_id: "T1-R2-M0".into(),
        };
        let game_id = rig
            .gs
            .create_tournament_game(5, 6, link.clone())
            .await
            .unwrap();

        rig.gs
            .on_game_ended(GameOutcome {
                id: game_id,
                mode: GameMode::Tournament,
                p1: 5,
                p2: 6,
                p1_score: 11,
                p2_score: 9,
                winner: Some(5),
                forfeit: false,
                duration_secs: 300,
                tournament: Some(link),
            })
            .await;

        match rig.tournament_rx.try_recv() {
            Ok(TournamentMsg::GameEnded {
                tournament_id,
                game_id: gid,
                winner_id,
            }) => {
                assert_eq!(tournament_id, 1);
                assert_eq!(gid, game_id);
                assert_eq!(winner_id, Some(5));
            }
            other => panic!("expected tournament fan-in, got {other:?}"),
        }

        // finals multiplier: 1 + (2/2)*0.5 = 1.5 => 24 points on an even match
        let w = rig.gs.store.get_user(5).await.unwrap().unwrap();
        assert_eq!(w.score, INITIAL_SCORE + 24);
    }

    #[tokio::test]
    async fn release_is_gated_on_the_current_binding() {
        let mut rig = rig().await;
        // user 5 already moved on to another room
        rig.gs.user_to_room.insert(5, 123_456);

        rig.gs
            .on_game_ended(GameOutcome {
                id: 777,
                mode: GameMode::Public,
                p1: 5,
                p2: 6,
                p1_score: 3,
                p2_score: 11,
                winner: Some(6),
                forfeit: true,
                duration_secs: 45,
                tournament: None,
            })
            .await;

        assert_eq!(rig.gs.user_to_room.get(&5), Some(&123_456));
    }
}
