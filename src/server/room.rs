use std::time::Duration;

use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::data::{Direction, GameId, GameMode, RoomStatus, Side, TournamentLink, UserId};
use crate::protocol::{GameEnded, GameSnapshot, ServerEvent};

use super::hub::Hub;
use super::physics::{Physics, WIN_SCORE};
use super::Message;

pub const TICK: Duration = Duration::from_millis(10);
pub const RECONNECT_WINDOW: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct PlayerSlot {
    pub user_id: UserId,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct RoomConfig {
    pub id: GameId,
    pub mode: GameMode,
    pub p1: PlayerSlot,
    pub p2: PlayerSlot,
    pub tournament: Option<TournamentLink>,
    /// Fixed RNG seed for deterministic games; production rooms leave this
    /// unset and seed from entropy.
    pub seed: Option<u64>,
}

/// What the room reports back to the lifecycle coordinator once it is over.
#[derive(Clone, Debug)]
pub struct GameOutcome {
    pub id: GameId,
    pub mode: GameMode,
    pub p1: UserId,
    pub p2: UserId,
    pub p1_score: u8,
    pub p2_score: u8,
    pub winner: Option<UserId>,
    pub forfeit: bool,
    pub duration_secs: u64,
    pub tournament: Option<TournamentLink>,
}

#[derive(Debug)]
pub enum RoomMsg {
    Input {
        user: UserId,
        direction: Direction,
        player_number: Option<u8>,
    },
    PlayerLeft {
        user: UserId,
    },
    Rejoin {
        user: UserId,
        resp: oneshot::Sender<Result<(), RejoinError>>,
    },
    Forfeit {
        user: UserId,
    },
    Spectate {
        user: UserId,
        resp: oneshot::Sender<Result<(), SpectateError>>,
    },
    AiView {
        resp: oneshot::Sender<AiView>,
    },
    Abort,
}

#[derive(Error, Debug)]
pub enum RejoinError {
    #[error("user is not a participant of this room")]
    NotAPlayer,
    #[error("participant is not in the reconnection window")]
    NotDisconnected,
}

impl RejoinError {
    pub fn code(&self) -> &'static str {
        match self {
            RejoinError::NotAPlayer => "NOT_A_PLAYER",
            RejoinError::NotDisconnected => "UNAVAILABLE",
        }
    }
}

#[derive(Error, Debug)]
#[error("room is not in progress")]
pub struct SpectateError;

/// Velocity-bearing snapshot for the AI driver; richer than the wire frame.
#[derive(Clone, Copy, Debug)]
pub struct AiView {
    pub ball_x: f64,
    pub ball_y: f64,
    pub vx: f64,
    pub vy: f64,
    pub paddle_left: f64,
    pub paddle_right: f64,
    pub in_progress: bool,
}

#[derive(Clone)]
pub struct RoomHandle {
    pub id: GameId,
    tx: mpsc::Sender<RoomMsg>,
}

impl RoomHandle {
    pub async fn send(&self, msg: RoomMsg) -> bool {
        self.tx.send(msg).await.is_ok()
    }
}

/// Spawn the authoritative actor for one in-progress game. The actor is the
/// only mutator of its own state; inputs, lifecycle commands and the tick are
/// all serialized through its mailbox.
pub fn spawn(cfg: RoomConfig, hub: Hub, server: mpsc::Sender<Message>) -> RoomHandle {
    let (tx, rx) = mpsc::channel(64);
    let id = cfg.id;

    let room = Room::new(cfg, hub, server, rx);
    tokio::spawn(room.run());

    RoomHandle { id, tx }
}

struct Room {
    cfg: RoomConfig,
    status: RoomStatus,
    physics: Physics,
    p1_score: u8,
    p2_score: u8,
    p1_gone: Option<Instant>,
    p2_gone: Option<Instant>,
    forfeit: bool,
    spectators: Vec<UserId>,
    started_at: Instant,
    hub: Hub,
    server: mpsc::Sender<Message>,
    rx: mpsc::Receiver<RoomMsg>,
}

impl Room {
    fn new(
        cfg: RoomConfig,
        hub: Hub,
        server: mpsc::Sender<Message>,
        rx: mpsc::Receiver<RoomMsg>,
    ) -> Room {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Room {
            cfg,
            status: RoomStatus::InProgress,
            physics: Physics::new(rng),
            p1_score: 0,
            p2_score: 0,
            p1_gone: None,
            p2_gone: None,
            forfeit: false,
            spectators: Vec::new(),
            started_at: Instant::now(),
            hub,
            server,
            rx,
        }
    }

    async fn run(mut self) {
        info!("room {} started ({:?})", self.cfg.id, self.cfg.mode);

        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.tick().await {
                        break;
                    }
                }
                msg = self.rx.recv() => match msg {
                    Some(msg) => {
                        if self.handle(msg).await {
                            break;
                        }
                    }
                    // the coordinator dropped us; nothing left to do
                    None => break,
                }
            }
        }

        info!("room {} done", self.cfg.id);
    }

    fn local(&self) -> bool {
        self.cfg.mode == GameMode::Local
    }

    /// One simulation step. Returns true once the room reached a terminal
    /// state and the actor should wind down.
    async fn tick(&mut self) -> bool {
        if self.status != RoomStatus::InProgress {
            return true;
        }

        // participants who blew the reconnection window forfeit the game
        let now = Instant::now();
        if let Some(at) = self.p1_gone {
            if now.duration_since(at) >= RECONNECT_WINDOW {
                self.p2_score = WIN_SCORE;
                self.forfeit = true;
            }
        }
        if let Some(at) = self.p2_gone {
            if now.duration_since(at) >= RECONNECT_WINDOW {
                self.p1_score = WIN_SCORE;
                self.forfeit = true;
            }
        }

        // nobody left to play for either side: close up with no winner
        if self.p1_gone.is_some() && self.p2_gone.is_some() {
            self.finish(None).await;
            return true;
        }

        if self.p1_score < WIN_SCORE && self.p2_score < WIN_SCORE {
            let goal = self
                .physics
                .step(self.p1_gone.is_none(), self.p2_gone.is_none());
            match goal {
                Some(Side::Left) => self.p2_score += 1,
                Some(Side::Right) => self.p1_score += 1,
                None => {}
            }
        }

        self.push_frame(ServerEvent::GameUpdate(self.snapshot()));

        if self.p1_score >= WIN_SCORE || self.p2_score >= WIN_SCORE {
            let winner = if self.p1_score > self.p2_score {
                self.cfg.p1.user_id
            } else {
                self.cfg.p2.user_id
            };
            // a local room has one owner on both sides; no winner to record
            let winner = if self.local() { None } else { Some(winner) };
            self.finish(winner).await;
            return true;
        }
        false
    }

    async fn handle(&mut self, msg: RoomMsg) -> bool {
        match msg {
            RoomMsg::Input {
                user,
                direction,
                player_number,
            } => {
                match self.side_for_input(user, player_number) {
                    Some(side) => self.physics.set_direction(side, direction),
                    None => self.hub.emit_to_user(
                        user,
                        ServerEvent::GameError {
                            message: "NOT_A_PLAYER".into(),
                        },
                    ),
                }
                false
            }

            RoomMsg::PlayerLeft { user } => {
                self.mark_gone(user);
                false
            }

            RoomMsg::Rejoin { user, resp } => {
                let _ = resp.send(self.rejoin(user));
                false
            }

            RoomMsg::Forfeit { user } => {
                if user == self.cfg.p1.user_id || user == self.cfg.p2.user_id {
                    self.forfeit = true;
                    let winner = if self.local() {
                        None
                    } else if user == self.cfg.p1.user_id {
                        self.p2_score = WIN_SCORE;
                        Some(self.cfg.p2.user_id)
                    } else {
                        self.p1_score = WIN_SCORE;
                        Some(self.cfg.p1.user_id)
                    };
                    self.finish(winner).await;
                    true
                } else {
                    warn!("forfeit from non-participant {user} in room {}", self.cfg.id);
                    false
                }
            }

            RoomMsg::Spectate { user, resp } => {
                if self.status == RoomStatus::InProgress {
                    if !self.spectators.contains(&user) {
                        self.spectators.push(user);
                    }
                    // catch the newcomer up right away
                    self.hub
                        .emit_to_user(user, ServerEvent::GameUpdate(self.snapshot()));
                    let _ = resp.send(Ok(()));
                } else {
                    let _ = resp.send(Err(SpectateError));
                }
                false
            }

            RoomMsg::AiView { resp } => {
                let _ = resp.send(AiView {
                    ball_x: self.physics.ball_x,
                    ball_y: self.physics.ball_y,
                    vx: self.physics.vx,
                    vy: self.physics.vy,
                    paddle_left: self.physics.paddle_left,
                    paddle_right: self.physics.paddle_right,
                    in_progress: self.status == RoomStatus::InProgress,
                });
                false
            }

            RoomMsg::Abort => {
                self.finish(None).await;
                true
            }
        }
    }

    /// Which paddle does this input steer? Local rooms route on the explicit
    /// player number since one user owns both sides.
    fn side_for_input(&self, user: UserId, player_number: Option<u8>) -> Option<Side> {
        if self.local() {
            if user != self.cfg.p1.user_id {
                return None;
            }
            return match player_number {
                Some(2) => Some(Side::Right),
                _ => Some(Side::Left),
            };
        }
        if user == self.cfg.p1.user_id {
            Some(Side::Left)
        } else if user == self.cfg.p2.user_id {
            Some(Side::Right)
        } else {
            None
        }
    }

    fn mark_gone(&mut self, user: UserId) {
        let now = Instant::now();
        let deadline_ms = RECONNECT_WINDOW.as_millis() as u64;
        if self.local() && user == self.cfg.p1.user_id {
            // the sole owner walked away; both sides are unattended
            self.p1_gone = Some(now);
            self.p2_gone = Some(now);
            return;
        }
        if user == self.cfg.p1.user_id && self.p1_gone.is_none() {
            self.p1_gone = Some(now);
            self.hub.emit_to_user(
                self.cfg.p2.user_id,
                ServerEvent::OpponentDisconnected {
                    game_id: self.cfg.id,
                    reconnect_deadline_ms: deadline_ms,
                },
            );
        } else if user == self.cfg.p2.user_id && self.p2_gone.is_none() {
            self.p2_gone = Some(now);
            self.hub.emit_to_user(
                self.cfg.p1.user_id,
                ServerEvent::OpponentDisconnected {
                    game_id: self.cfg.id,
                    reconnect_deadline_ms: deadline_ms,
                },
            );
        }
    }

    fn rejoin(&mut self, user: UserId) -> Result<(), RejoinError> {
        let (gone, other) = if user == self.cfg.p1.user_id {
            (&mut self.p1_gone, self.cfg.p2.user_id)
        } else if user == self.cfg.p2.user_id {
            (&mut self.p2_gone, self.cfg.p1.user_id)
        } else {
            return Err(RejoinError::NotAPlayer);
        };

        match *gone {
            Some(at) if Instant::now().duration_since(at) < RECONNECT_WINDOW => {
                *gone = None;
                if self.local() {
                    self.p1_gone = None;
                    self.p2_gone = None;
                } else {
                    self.hub.emit_to_user(
                        other,
                        ServerEvent::OpponentReconnected {
                            game_id: self.cfg.id,
                        },
                    );
                }
                Ok(())
            }
            _ => Err(RejoinError::NotDisconnected),
        }
    }

    fn snapshot(&self) -> GameSnapshot {
        GameSnapshot {
            game_id: self.cfg.id,
            p1_score: self.p1_score,
            p2_score: self.p2_score,
            paddle_left: self.physics.paddle_left,
            paddle_right: self.physics.paddle_right,
            ball_x: self.physics.ball_x,
            ball_y: self.physics.ball_y,
            status: self.status,
        }
    }

    /// Everyone who should see room frames right now: connected participants
    /// plus spectators. A side in the reconnection window gets nothing until
    /// it rebinds, which also keeps frames away from users who already moved
    /// on to another room.
    fn channel_members(&self) -> Vec<UserId> {
        let mut members = Vec::with_capacity(2 + self.spectators.len());
        if self.p1_gone.is_none() {
            members.push(self.cfg.p1.user_id);
        }
        if self.p2_gone.is_none() && self.cfg.p2.user_id != self.cfg.p1.user_id {
            members.push(self.cfg.p2.user_id);
        }
        members.extend(self.spectators.iter().copied());
        members
    }

    fn push_frame(&self, event: ServerEvent) {
        for user in self.channel_members() {
            self.hub.emit_to_user(user, event.clone());
        }
    }

    /// Terminal sequence, room-side half: stop ticking, mark finished, tell
    /// the room channel, then hand the outcome to the coordinator for
    /// persistence, ranking and release. The channel emission happens before
    /// the handoff so clients always observe terminal state before stats
    /// move.
    async fn finish(&mut self, winner: Option<UserId>) {
        self.status = RoomStatus::Finished;

        self.push_frame(ServerEvent::GameEnded(GameEnded {
            game_id: self.cfg.id,
            winner_id: winner,
            p1_score: self.p1_score,
            p2_score: self.p2_score,
            forfeit: self.forfeit,
            tournament: self.cfg.tournament.clone(),
        }));

        let outcome = GameOutcome {
            id: self.cfg.id,
            mode: self.cfg.mode,
            p1: self.cfg.p1.user_id,
            p2: self.cfg.p2.user_id,
            p1_score: self.p1_score,
            p2_score: self.p2_score,
            winner,
            forfeit: self.forfeit,
            duration_secs: self.started_at.elapsed().as_secs(),
            tournament: self.cfg.tournament.clone(),
        };
        if self
            .server
            .send(Message::GameEnded { outcome })
            .await
            .is_err()
        {
            error!("room {}: coordinator is gone, outcome dropped", self.cfg.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: GameId, mode: GameMode, p1: UserId, p2: UserId) -> RoomConfig {
        RoomConfig {
            id,
            mode,
            p1: PlayerSlot {
                user_id: p1,
                name: format!("user-{p1}"),
            },
            p2: PlayerSlot {
                user_id: p2,
                name: format!("user-{p2}"),
            },
            tournament: None,
            seed: Some(42),
        }
    }

    /// A room driven by hand instead of by the interval, so every test is
    /// deterministic regardless of how the simulation plays out.
    fn room(cfg: RoomConfig) -> (Room, mpsc::Receiver<Message>) {
        let (server_tx, server_rx) = mpsc::channel(64);
        let (_tx, rx) = mpsc::channel(1);
        (Room::new(cfg, Hub::new(), server_tx, rx), server_rx)
    }

    fn outcome(rx: &mut mpsc::Receiver<Message>) -> GameOutcome {
        match rx.try_recv().expect("room should have reported an outcome") {
            Message::GameEnded { outcome } => outcome,
            other => panic!("unexpected coordinator message: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_past_window_forfeits_to_the_opponent() {
        let (mut room, mut server_rx) = room(config(900_001, GameMode::Public, 5, 6));

        room.mark_gone(5);
        tokio::time::advance(RECONNECT_WINDOW + TICK).await;

        assert!(room.tick().await, "tick should terminate the room");
        let outcome = outcome(&mut server_rx);
        assert_eq!(outcome.winner, Some(6));
        assert!(outcome.forfeit);
        assert_eq!(outcome.p2_score, WIN_SCORE);
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_inside_window_keeps_the_game_alive() {
        let hub = Hub::new();
        let (_opp_conn, mut opp_rx) = hub.add_connection(6);
        let (server_tx, mut server_rx) = mpsc::channel(64);
        let (_tx, rx) = mpsc::channel(1);
        let mut room = Room::new(config(900_002, GameMode::Public, 5, 6), hub, server_tx, rx);

        room.mark_gone(5);
        tokio::time::advance(Duration::from_secs(10)).await;
        room.rejoin(5).expect("rejoin inside window succeeds");

        // well past the original deadline: the flag is clear, no forfeit
        tokio::time::advance(Duration::from_secs(25)).await;
        assert!(!room.tick().await);
        assert!(server_rx.try_recv().is_err(), "game should still be running");

        let mut saw_disconnect = false;
        let mut saw_reconnect = false;
        while let Ok(ev) = opp_rx.try_recv() {
            match ev {
                ServerEvent::OpponentDisconnected { .. } => saw_disconnect = true,
                ServerEvent::OpponentReconnected { .. } => saw_reconnect = true,
                _ => {}
            }
        }
        assert!(saw_disconnect && saw_reconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_after_window_is_rejected() {
        let (mut room, _server_rx) = room(config(900_003, GameMode::Public, 5, 6));

        room.mark_gone(5);
        tokio::time::advance(RECONNECT_WINDOW + Duration::from_secs(1)).await;

        assert!(matches!(
            room.rejoin(5),
            Err(RejoinError::NotDisconnected)
        ));
        assert!(matches!(room.rejoin(99), Err(RejoinError::NotAPlayer)));
    }

    #[tokio::test]
    async fn input_from_a_stranger_is_rejected() {
        let hub = Hub::new();
        let (_conn, mut stranger_rx) = hub.add_connection(99);
        let (server_tx, _server_rx) = mpsc::channel(64);
        let (_tx, rx) = mpsc::channel(1);
        let mut room = Room::new(config(900_004, GameMode::Public, 5, 6), hub, server_tx, rx);

        room.handle(RoomMsg::Input {
            user: 99,
            direction: Direction::Up,
            player_number: None,
        })
        .await;

        let mut rejected = false;
        while let Ok(ev) = stranger_rx.try_recv() {
            if let ServerEvent::GameError { message } = ev {
                assert_eq!(message, "NOT_A_PLAYER");
                rejected = true;
            }
        }
        assert!(rejected);
    }

    #[tokio::test]
    async fn local_input_routes_by_player_number() {
        let (mut room, _server_rx) = room(config(900_005, GameMode::Local, 5, 5));

        room.handle(RoomMsg::Input {
            user: 5,
            direction: Direction::Up,
            player_number: Some(1),
        })
        .await;
        room.handle(RoomMsg::Input {
            user: 5,
            direction: Direction::Down,
            player_number: Some(2),
        })
        .await;

        assert_eq!(room.physics.left_dir, Direction::Up);
        assert_eq!(room.physics.right_dir, Direction::Down);
    }

    #[tokio::test]
    async fn repeated_input_is_idempotent() {
        let (mut room, _server_rx) = room(config(900_006, GameMode::Public, 5, 6));

        for _ in 0..2 {
            room.handle(RoomMsg::Input {
                user: 6,
                direction: Direction::Down,
                player_number: None,
            })
            .await;
        }
        assert_eq!(room.physics.right_dir, Direction::Down);
    }

    #[tokio::test]
    async fn forfeit_hands_the_opponent_a_win() {
        let (mut room, mut server_rx) = room(config(900_007, GameMode::Public, 5, 6));

        assert!(room.handle(RoomMsg::Forfeit { user: 6 }).await);
        let outcome = outcome(&mut server_rx);
        assert_eq!(outcome.winner, Some(5));
        assert_eq!(outcome.p1_score, WIN_SCORE);
        assert!(outcome.forfeit);
    }

    #[tokio::test]
    async fn local_owner_leaving_finishes_without_a_winner() {
        let (mut room, mut server_rx) = room(config(900_008, GameMode::Local, 5, 5));

        room.mark_gone(5);
        assert!(room.tick().await);
        let outcome = outcome(&mut server_rx);
        assert_eq!(outcome.winner, None);
    }

    #[tokio::test]
    async fn a_full_game_ends_at_eleven_with_bounded_scores() {
        let (mut room, mut server_rx) = room(config(900_009, GameMode::Public, 5, 6));

        let mut ticks: u64 = 0;
        while !room.tick().await {
            ticks += 1;
            assert!(room.p1_score <= WIN_SCORE && room.p2_score <= WIN_SCORE);
            assert!(ticks < 2_000_000, "game should terminate");
        }

        let outcome = outcome(&mut server_rx);
        assert!(outcome.winner.is_some());
        assert_eq!(outcome.p1_score.max(outcome.p2_score), WIN_SCORE);
        assert!(outcome.p1_score.min(outcome.p2_score) < WIN_SCORE);
        assert!(!outcome.forfeit);
    }

    #[tokio::test]
    async fn spectators_receive_frames_only_while_in_progress() {
        let hub = Hub::new();
        let (_conn, mut spec_rx) = hub.add_connection(42);
        let (server_tx, _server_rx) = mpsc::channel(64);
        let (_tx, rx) = mpsc::channel(1);
        let mut room = Room::new(config(900_010, GameMode::Public, 5, 6), hub, server_tx, rx);

        let (resp, resp_rx) = oneshot::channel();
        room.handle(RoomMsg::Spectate { user: 42, resp }).await;
        resp_rx.await.unwrap().expect("spectate while in progress");
        assert!(matches!(
            spec_rx.try_recv(),
            Ok(ServerEvent::GameUpdate(_))
        ));

        room.status = RoomStatus::Finished;
        let (resp, resp_rx) = oneshot::channel();
        room.handle(RoomMsg::Spectate { user: 43, resp }).await;
        assert!(resp_rx.await.unwrap().is_err());
    }
}
