use std::collections::HashMap;

use anyhow::Result;
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};

use crate::data::{GameId, TournamentLink, UserId};
use crate::protocol::{GameEvent, ServerEvent};
use crate::store::Store;

mod ai;
mod conn_task;
mod hub;
mod matchmaking;
mod physics;
mod ranking;
mod room;
mod tournament;

use hub::{ConnId, Hub};
use matchmaking::PendingRoom;
use room::{GameOutcome, RoomHandle};
use tournament::TournamentMsg;

/// Mailbox of the lifecycle coordinator. Everything that touches the room
/// table or the user→room index goes through here, one message at a time.
#[derive(Debug)]
pub(crate) enum Message {
    Connect {
        user: UserId,
        name: String,
        resp: oneshot::Sender<ConnectAck>,
    },
    Disconnect {
        user: UserId,
        conn_id: ConnId,
    },
    Command {
        user: UserId,
        event: GameEvent,
    },
    /// Warmup timer fired for a room that was pairing up.
    StartRoom {
        room: GameId,
    },
    /// A room actor finished; run the persistence/ranking/release sequence.
    GameEnded {
        outcome: GameOutcome,
    },
    /// The tournament orchestrator needs a game for a ready match.
    CreateTournamentGame {
        p1: UserId,
        p2: UserId,
        link: TournamentLink,
        resp: oneshot::Sender<Result<GameId>>,
    },
    /// Tournament cancellation tears down its in-flight games.
    AbortRoom {
        room: GameId,
    },
    /// Linger timer fired; drop the terminal room.
    CleanupRoom {
        room: GameId,
    },
}

#[derive(Debug)]
pub(crate) struct ConnectAck {
    pub conn_id: ConnId,
    pub outbox: mpsc::UnboundedReceiver<ServerEvent>,
}

pub(crate) enum RoomSlot {
    /// Waiting or counting down; lives inside the coordinator until started.
    Pending(PendingRoom),
    /// In progress, owned by its own actor.
    Running(RoomHandle),
    /// Terminal; kept around until the linger timer collects it.
    Done,
}

pub(crate) struct GameServer {
    hub: Hub,
    store: Store,
    tournaments: mpsc::Sender<TournamentMsg>,
    self_tx: mpsc::Sender<Message>,
    /// Display names of connected users.
    players: HashMap<UserId, String>,
    rooms: HashMap<GameId, RoomSlot>,
    user_to_room: HashMap<UserId, GameId>,
    rng: StdRng,
}

impl GameServer {
    fn start(
        hub: Hub,
        store: Store,
        tournaments: mpsc::Sender<TournamentMsg>,
        self_tx: mpsc::Sender<Message>,
        mut rx: mpsc::Receiver<Message>,
    ) {
        tokio::spawn(async move {
            let mut gs = GameServer {
                hub,
                store,
                tournaments,
                self_tx,
                players: HashMap::new(),
                rooms: HashMap::new(),
                user_to_room: HashMap::new(),
                rng: StdRng::from_entropy(),
            };

            while let Some(msg) = rx.recv().await {
                gs.handle_message(msg).await;
            }
        });
    }

    async fn handle_message(&mut self, msg: Message) {
        match msg {
            Message::Connect { user, name, resp } => {
                let (conn_id, outbox) = self.hub.add_connection(user);
                self.players.insert(user, name);
                info!("user {user} connected");
                let _ = resp.send(ConnectAck { conn_id, outbox });
            }

            Message::Disconnect { user, conn_id } => {
                // a stale id means the user already reconnected elsewhere
                if self.hub.remove(user, conn_id) {
                    self.players.remove(&user);
                    info!("user {user} disconnected");
                    if self.user_to_room.contains_key(&user) {
                        // transport loss counts as leaving the game
                        if let Err(e) = self.leave_game(user, matchmaking::LeaveKind::Disconnect).await
                        {
                            warn!("cleanup after disconnect of {user} failed: {e}");
                        }
                    }
                }
            }

            Message::Command { user, event } => {
                if let Err(e) = self.handle_command(user, event).await {
                    self.hub.emit_to_user(
                        user,
                        ServerEvent::GameError {
                            message: e.code().into(),
                        },
                    );
                }
            }

            Message::StartRoom { room } => self.start_room(room).await,
            Message::GameEnded { outcome } => self.on_game_ended(outcome).await,

            Message::CreateTournamentGame { p1, p2, link, resp } => {
                let result = self.create_tournament_game(p1, p2, link).await;
                let _ = resp.send(result);
            }

            Message::AbortRoom { room } => {
                if let Some(RoomSlot::Running(handle)) = self.rooms.get(&room) {
                    if !handle.send(room::RoomMsg::Abort).await {
                        warn!("abort for room {room} arrived after it ended");
                    }
                }
            }

            Message::CleanupRoom { room } => {
                if matches!(self.rooms.get(&room), Some(RoomSlot::Done)) {
                    self.rooms.remove(&room);
                }
            }
        }
    }
}

/// Bring the whole coordination substrate up and serve WebSocket clients.
pub async fn run<A: ToSocketAddrs>(store: Store, addr: A) -> Result<()> {
    let hub = Hub::new();
    let (server_tx, server_rx) = mpsc::channel(1024);

    let tournaments = tournament::start(hub.clone(), store.clone(), server_tx.clone());
    GameServer::start(
        hub,
        store.clone(),
        tournaments.clone(),
        server_tx.clone(),
        server_rx,
    );

    let listener = TcpListener::bind(addr).await?;
    info!("game server listening");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                conn_task::run_connection(
                    server_tx.clone(),
                    tournaments.clone(),
                    store.clone(),
                    stream,
                    peer,
                );
            }
            Err(e) => {
                error!("accept failed: {e:?}");
            }
        }
    }
}
