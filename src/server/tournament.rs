//! Single-elimination tournament orchestrator. Owns the live tournament
//! cache; durable rows go through the Store so the shape of a bracket
//! survives a restart, but the cache is authoritative while the process runs.

use std::collections::HashMap;
use std::time::Duration;

use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::data::{
    GameId, MatchStatus, TournamentId, TournamentLink, TournamentMatchRow, TournamentStatus,
    UserId,
};
use crate::protocol::{BracketMatch, ServerEvent, TournamentEvent, TournamentSummary};
use crate::store::Store;

use super::hub::Hub;
use super::Message;

/// Grace period between a bracket filling up and round one starting.
pub const AUTO_START_DELAY: Duration = Duration::from_secs(3);
/// Breather between rounds.
pub const NEXT_ROUND_DELAY: Duration = Duration::from_secs(5);
/// How long a finished or cancelled tournament lingers in the cache.
pub const EVICT_DELAY: Duration = Duration::from_secs(300);

const ALLOWED_SIZES: [u32; 4] = [4, 8, 16, 32];
const DEFAULT_BRACKET: &str = "single_elimination";

#[derive(Debug)]
pub enum TournamentMsg {
    /// A client command, already parsed at the transport boundary.
    Client {
        user: UserId,
        event: TournamentEvent,
    },
    /// Fan-in from the lifecycle coordinator: a tournament-linked game ended.
    GameEnded {
        tournament_id: TournamentId,
        game_id: GameId,
        winner_id: Option<UserId>,
    },
    AutoStart {
        id: TournamentId,
    },
    StartRound {
        id: TournamentId,
        round: u32,
    },
    Evict {
        id: TournamentId,
    },
}

#[derive(Error, Debug)]
enum TournamentError {
    #[error("tournament does not exist")]
    NotFound,
    #[error("operation not allowed in the tournament's current state")]
    Unavailable,
    #[error("only the creator may do this")]
    NotCreator,
    #[error("tournament is full")]
    Full,
    #[error("user is already registered")]
    AlreadyRegistered,
    #[error("user is not registered")]
    NotRegistered,
    #[error("player count must be one of 4, 8, 16, 32")]
    InvalidMaxPlayers,
    #[error("at least two players are required")]
    NotEnoughPlayers,
    #[error("storage failure")]
    Internal,
}

impl TournamentError {
    fn code(&self) -> &'static str {
        match self {
            TournamentError::NotFound => "TOURNAMENT_NOT_FOUND",
            TournamentError::Unavailable => "UNAVAILABLE",
            TournamentError::NotCreator => "NOT_CREATOR",
            TournamentError::Full => "FULL",
            TournamentError::AlreadyRegistered => "ALREADY_REGISTERED",
            TournamentError::NotRegistered => "NOT_REGISTERED",
            TournamentError::InvalidMaxPlayers => "INVALID_MAX_PLAYERS",
            TournamentError::NotEnoughPlayers => "NOT_ENOUGH_PLAYERS",
            TournamentError::Internal => "INTERNAL",
        }
    }
}

#[derive(Clone, Debug)]
struct TMatch {
    match_id: String,
    round: u32,
    number: u32,
    p1: Option<UserId>,
    p2: Option<UserId>,
    winner: Option<UserId>,
    game_id: Option<GameId>,
    status: MatchStatus,
}

#[derive(Clone, Debug)]
struct Tournament {
    id: TournamentId,
    name: String,
    creator: UserId,
    bracket_type: String,
    max_players: u32,
    total_rounds: u32,
    status: TournamentStatus,
    current_round: u32,
    players: Vec<UserId>,
    matches: Vec<TMatch>,
    winner: Option<UserId>,
}

pub(super) struct Orchestrator {
    hub: Hub,
    store: Store,
    server: mpsc::Sender<Message>,
    self_tx: mpsc::Sender<TournamentMsg>,
    tournaments: HashMap<TournamentId, Tournament>,
    rng: StdRng,
}

/// Spawn the orchestrator actor and hand back its mailbox.
pub fn start(hub: Hub, store: Store, server: mpsc::Sender<Message>) -> mpsc::Sender<TournamentMsg> {
    let (tx, mut rx) = mpsc::channel(256);

    let mut orch = Orchestrator {
        hub,
        store,
        server,
        self_tx: tx.clone(),
        tournaments: HashMap::new(),
        rng: StdRng::from_entropy(),
    };

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            orch.handle(msg).await;
        }
    });

    tx
}

impl Orchestrator {
    async fn handle(&mut self, msg: TournamentMsg) {
        match msg {
            TournamentMsg::Client { user, event } => {
                let result = self.handle_client(user, event).await;
                if let Err(e) = result {
                    self.hub.emit_to_user(
                        user,
                        ServerEvent::TournamentError {
                            message: e.code().into(),
                        },
                    );
                }
            }
            TournamentMsg::GameEnded {
                tournament_id,
                game_id,
                winner_id,
            } => self.game_ended(tournament_id, game_id, winner_id).await,
            TournamentMsg::AutoStart { id } => self.auto_start(id).await,
            TournamentMsg::StartRound { id, round } => {
                let still_current = self
                    .tournaments
                    .get(&id)
                    .map(|t| t.status == TournamentStatus::InProgress && t.current_round == round)
                    .unwrap_or(false);
                if still_current {
                    self.start_round(id, round).await;
                }
            }
            TournamentMsg::Evict { id } => {
                if let Some(t) = self.tournaments.get(&id) {
                    if t.status.is_terminal() {
                        self.tournaments.remove(&id);
                        info!("tournament {id} evicted from cache");
                    }
                }
            }
        }
    }

    async fn handle_client(
        &mut self,
        user: UserId,
        event: TournamentEvent,
    ) -> Result<(), TournamentError> {
        match event {
            TournamentEvent::Create {
                name,
                max_players,
                bracket_type,
            } => self.create(user, name, max_players, bracket_type).await,
            TournamentEvent::Join { tournament_id } => self.join(user, tournament_id).await,
            TournamentEvent::Leave { tournament_id } => self.leave(user, tournament_id).await,
            TournamentEvent::Start { tournament_id } => {
                self.start_by_creator(user, tournament_id).await
            }
            TournamentEvent::Cancel { tournament_id } => self.cancel(user, tournament_id).await,
            TournamentEvent::Get { tournament_id } => {
                let t = self
                    .tournaments
                    .get(&tournament_id)
                    .ok_or(TournamentError::NotFound)?;
                self.hub
                    .emit_to_user(user, ServerEvent::TournamentDetails(summary(t)));
                Ok(())
            }
            TournamentEvent::GetBracket { tournament_id } => {
                let t = self
                    .tournaments
                    .get(&tournament_id)
                    .ok_or(TournamentError::NotFound)?;
                self.hub.emit_to_user(
                    user,
                    ServerEvent::TournamentBracket {
                        tournament_id,
                        matches: t.matches.iter().map(bracket_match).collect(),
                    },
                );
                Ok(())
            }
            TournamentEvent::ListActive => {
                let tournaments = self
                    .tournaments
                    .values()
                    .filter(|t| !t.status.is_terminal())
                    .map(summary)
                    .collect();
                self.hub
                    .emit_to_user(user, ServerEvent::TournamentList { tournaments });
                Ok(())
            }
            TournamentEvent::MyTournaments => {
                let tournaments = self
                    .tournaments
                    .values()
                    .filter(|t| t.players.contains(&user))
                    .map(summary)
                    .collect();
                self.hub
                    .emit_to_user(user, ServerEvent::TournamentList { tournaments });
                Ok(())
            }
        }
    }

    async fn create(
        &mut self,
        user: UserId,
        name: String,
        max_players: u32,
        bracket_type: Option<String>,
    ) -> Result<(), TournamentError> {
        if !ALLOWED_SIZES.contains(&max_players) {
            return Err(TournamentError::InvalidMaxPlayers);
        }
        let bracket_type = bracket_type.unwrap_or_else(|| DEFAULT_BRACKET.to_string());
        let total_rounds = max_players.trailing_zeros();

        let id = self
            .store
            .create_tournament(
                name.clone(),
                user,
                max_players,
                total_rounds,
                bracket_type.clone(),
            )
            .await
            .map_err(|e| {
                error!("failed to persist tournament: {e:?}");
                TournamentError::Internal
            })?;

        let t = Tournament {
            id,
            name,
            creator: user,
            bracket_type,
            max_players,
            total_rounds,
            status: TournamentStatus::Registration,
            current_round: 0,
            players: Vec::new(),
            matches: Vec::new(),
            winner: None,
        };
        self.hub
            .broadcast(ServerEvent::TournamentCreated(summary(&t)));
        self.tournaments.insert(id, t);
        info!("tournament {id} created by {user}");
        Ok(())
    }

    async fn join(&mut self, user: UserId, id: TournamentId) -> Result<(), TournamentError> {
        let t = self
            .tournaments
            .get_mut(&id)
            .ok_or(TournamentError::NotFound)?;
        if t.status != TournamentStatus::Registration {
            return Err(TournamentError::Unavailable);
        }
        if t.players.contains(&user) {
            return Err(TournamentError::AlreadyRegistered);
        }
        if t.players.len() as u32 >= t.max_players {
            return Err(TournamentError::Full);
        }

        t.players.push(user);
        let filled = t.players.len() as u32 == t.max_players;
        if filled {
            t.status = TournamentStatus::Starting;
        }
        let current = t.players.len() as u32;

        if let Err(e) = self.store.add_tournament_player(id, user).await {
            warn!("failed to persist tournament player: {e:?}");
        }
        self.hub.broadcast(ServerEvent::TournamentPlayerJoined {
            tournament_id: id,
            user_id: user,
            current_players: current,
        });

        if filled {
            let tx = self.self_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(AUTO_START_DELAY).await;
                let _ = tx.send(TournamentMsg::AutoStart { id }).await;
            });
        }
        Ok(())
    }

    async fn leave(&mut self, user: UserId, id: TournamentId) -> Result<(), TournamentError> {
        let t = self
            .tournaments
            .get_mut(&id)
            .ok_or(TournamentError::NotFound)?;
        if t.status != TournamentStatus::Registration {
            return Err(TournamentError::Unavailable);
        }
        let pos = t
            .players
            .iter()
            .position(|&p| p == user)
            .ok_or(TournamentError::NotRegistered)?;
        t.players.remove(pos);
        let current = t.players.len() as u32;

        if let Err(e) = self.store.remove_tournament_player(id, user).await {
            warn!("failed to remove tournament player: {e:?}");
        }
        self.hub.broadcast(ServerEvent::TournamentPlayerLeft {
            tournament_id: id,
            user_id: user,
            current_players: current,
        });
        Ok(())
    }

    async fn start_by_creator(
        &mut self,
        user: UserId,
        id: TournamentId,
    ) -> Result<(), TournamentError> {
        let t = self
            .tournaments
            .get(&id)
            .ok_or(TournamentError::NotFound)?;
        if t.creator != user {
            return Err(TournamentError::NotCreator);
        }
        if t.status != TournamentStatus::Registration {
            return Err(TournamentError::Unavailable);
        }
        if t.players.len() < 2 {
            return Err(TournamentError::NotEnoughPlayers);
        }
        self.do_start(id).await;
        Ok(())
    }

    async fn auto_start(&mut self, id: TournamentId) {
        // the timer may outlive a cancellation; only a full bracket that is
        // still counting down actually starts
        let ready = self
            .tournaments
            .get(&id)
            .map(|t| t.status == TournamentStatus::Starting)
            .unwrap_or(false);
        if ready {
            self.do_start(id).await;
        }
    }

    /// Seed, build the full match tree, and kick off round one.
    async fn do_start(&mut self, id: TournamentId) {
        let (seeds, match_rows) = {
            let Some(t) = self.tournaments.get_mut(&id) else {
                return;
            };

            // an early start shrinks the bracket to the smallest legal size
            // that still fits everyone; 4 is the smallest bracket there is
            let n = t.players.len() as u32;
            if n < t.max_players {
                t.max_players = n.next_power_of_two().max(4);
                t.total_rounds = t.max_players.trailing_zeros();
            }

            let mut seeds = t.players.clone();
            seeds.shuffle(&mut self.rng);

            let total = t.total_rounds;
            let mut matches = Vec::new();
            for round in 1..=total {
                let count = 1u32 << (total - round);
                for number in 0..count {
                    matches.push(TMatch {
                        match_id: format!("T{id}-R{round}-M{number}"),
                        round,
                        number,
                        p1: None,
                        p2: None,
                        winner: None,
                        game_id: None,
                        status: MatchStatus::Pending,
                    });
                }
            }

            // round one fills pairwise from the seeded order; a lone player
            // is a bye and advances immediately, an empty pairing just closes
            for m in matches.iter_mut().filter(|m| m.round == 1) {
                let k = m.number as usize;
                m.p1 = seeds.get(2 * k).copied();
                m.p2 = seeds.get(2 * k + 1).copied();
                match (m.p1, m.p2) {
                    (Some(_), Some(_)) => m.status = MatchStatus::Ready,
                    (Some(p), None) => {
                        m.status = MatchStatus::Completed;
                        m.winner = Some(p);
                    }
                    _ => m.status = MatchStatus::Completed,
                }
            }

            t.matches = matches;
            t.status = TournamentStatus::InProgress;
            t.current_round = 1;

            let rows: Vec<TournamentMatchRow> =
                t.matches.iter().map(|m| match_row(id, m)).collect();
            (seeds, rows)
        };

        let seed_rows = seeds
            .iter()
            .enumerate()
            .map(|(i, &u)| (u, i as u32 + 1))
            .collect();
        if let Err(e) = self.store.set_tournament_seeds(id, seed_rows).await {
            warn!("failed to persist seeds for tournament {id}: {e:?}");
        }
        self.persist_tournament(id).await;
        for row in match_rows {
            if let Err(e) = self.store.create_tournament_match(row).await {
                warn!("failed to persist match for tournament {id}: {e:?}");
            }
        }

        if let Some(t) = self.tournaments.get(&id) {
            self.hub
                .broadcast(ServerEvent::TournamentStarted(summary(t)));
            info!(
                "tournament {id} started: {} players, {} rounds",
                t.players.len(),
                t.total_rounds
            );
        }

        self.start_round(id, 1).await;
        // a bracket with enough byes can complete rounds without playing
        self.settle_rounds(id, 1).await;
    }

    /// Create the games for every ready match in a round.
    async fn start_round(&mut self, id: TournamentId, round: u32) {
        let (total_rounds, ready) = {
            let Some(t) = self.tournaments.get(&id) else {
                return;
            };
            let ready: Vec<(String, UserId, UserId)> = t
                .matches
                .iter()
                .filter(|m| m.round == round && m.status == MatchStatus::Ready)
                .filter_map(|m| Some((m.match_id.clone(), m.p1?, m.p2?)))
                .collect();
            (t.total_rounds, ready)
        };
        if ready.is_empty() {
            return;
        }

        self.hub.broadcast(ServerEvent::TournamentRoundStarted {
            tournament_id: id,
            round,
        });

        for (match_id, p1, p2) in ready {
            let link = TournamentLink {
                tournament_id: id,
                round,
                total_rounds,
                match_id: match_id.clone(),
            };
            let (resp, rx) = oneshot::channel();
            if self
                .server
                .send(Message::CreateTournamentGame {
                    p1,
                    p2,
                    link,
                    resp,
                })
                .await
                .is_err()
            {
                error!("lifecycle coordinator is gone; match {match_id} stranded");
                continue;
            }
            let game_id = match rx.await {
                Ok(Ok(game_id)) => game_id,
                Ok(Err(e)) => {
                    error!("failed to create game for match {match_id}: {e:?}");
                    continue;
                }
                Err(_) => continue,
            };

            if let Some(t) = self.tournaments.get_mut(&id) {
                if let Some(m) = t.matches.iter_mut().find(|m| m.match_id == match_id) {
                    m.game_id = Some(game_id);
                    m.status = MatchStatus::InProgress;
                }
            }
            if let Err(e) = self
                .store
                .update_tournament_match(
                    id,
                    match_id.clone(),
                    Some(p1),
                    Some(p2),
                    None,
                    Some(game_id),
                    MatchStatus::InProgress,
                )
                .await
            {
                warn!("failed to persist match update {match_id}: {e:?}");
            }

            for (player, opponent) in [(p1, p2), (p2, p1)] {
                self.hub.emit_to_user(
                    player,
                    ServerEvent::TournamentMatchReady {
                        tournament_id: id,
                        match_id: match_id.clone(),
                        round,
                        opponent_id: opponent,
                        game_id,
                    },
                );
            }
        }
    }

    /// Result capture: find the match the finished game decided.
    async fn game_ended(
        &mut self,
        tournament_id: TournamentId,
        game_id: GameId,
        winner_id: Option<UserId>,
    ) {
        let found = {
            let Some(t) = self.tournaments.get_mut(&tournament_id) else {
                warn!("game {game_id} ended for unknown tournament {tournament_id}");
                return;
            };
            match t.matches.iter_mut().find(|m| m.game_id == Some(game_id)) {
                Some(m) if m.status != MatchStatus::Completed => {
                    m.winner = winner_id;
                    m.status = MatchStatus::Completed;
                    Some((m.match_id.clone(), m.round, m.p1, m.p2))
                }
                Some(_) => None,
                None => {
                    warn!("game {game_id} does not map to a match of tournament {tournament_id}");
                    None
                }
            }
        };
        let Some((match_id, round, p1, p2)) = found else {
            return;
        };

        if let Err(e) = self
            .store
            .update_tournament_match(
                tournament_id,
                match_id.clone(),
                p1,
                p2,
                winner_id,
                Some(game_id),
                MatchStatus::Completed,
            )
            .await
        {
            warn!("failed to persist match result {match_id}: {e:?}");
        }
        self.hub.broadcast(ServerEvent::TournamentMatchCompleted {
            tournament_id,
            match_id,
            winner_id,
        });

        self.settle_rounds(tournament_id, round).await;
    }

    /// Advance through every round that is fully decided, promoting winners
    /// (and byes) until a round still has games to play or the tournament is
    /// over.
    async fn settle_rounds(&mut self, id: TournamentId, from_round: u32) {
        type MatchUpdate = (String, Option<UserId>, Option<UserId>, Option<UserId>, MatchStatus);
        enum Outcome {
            NotDone,
            Finished(Option<UserId>),
            Advanced {
                updated: Vec<MatchUpdate>,
                any_ready: bool,
            },
        }

        let mut round = from_round;
        loop {
            let outcome = {
                let Some(t) = self.tournaments.get_mut(&id) else {
                    return;
                };
                if t.status != TournamentStatus::InProgress {
                    return;
                }
                let complete = t
                    .matches
                    .iter()
                    .filter(|m| m.round == round)
                    .all(|m| m.status == MatchStatus::Completed);
                if !complete {
                    Outcome::NotDone
                } else if round == t.total_rounds {
                    let winner = t
                        .matches
                        .iter()
                        .find(|m| m.round == round)
                        .and_then(|m| m.winner);
                    t.status = TournamentStatus::Finished;
                    t.winner = winner;
                    Outcome::Finished(winner)
                } else {
                    let winners: Vec<Option<UserId>> = {
                        let mut of_round: Vec<&TMatch> =
                            t.matches.iter().filter(|m| m.round == round).collect();
                        of_round.sort_by_key(|m| m.number);
                        of_round.iter().map(|m| m.winner).collect()
                    };

                    let mut updated = Vec::new();
                    let mut any_ready = false;
                    for m in t.matches.iter_mut().filter(|m| m.round == round + 1) {
                        let k = m.number as usize;
                        m.p1 = winners.get(2 * k).copied().flatten();
                        m.p2 = winners.get(2 * k + 1).copied().flatten();
                        match (m.p1, m.p2) {
                            (Some(_), Some(_)) => {
                                m.status = MatchStatus::Ready;
                                any_ready = true;
                            }
                            (Some(p), None) | (None, Some(p)) => {
                                m.status = MatchStatus::Completed;
                                m.winner = Some(p);
                            }
                            (None, None) => m.status = MatchStatus::Completed,
                        }
                        updated.push((m.match_id.clone(), m.p1, m.p2, m.winner, m.status));
                    }
                    t.current_round = round + 1;
                    Outcome::Advanced { updated, any_ready }
                }
            };

            match outcome {
                Outcome::NotDone => return,
                Outcome::Finished(winner) => {
                    self.hub.broadcast(ServerEvent::TournamentRoundCompleted {
                        tournament_id: id,
                        round,
                    });
                    self.persist_tournament(id).await;
                    self.hub.broadcast(ServerEvent::TournamentCompleted {
                        tournament_id: id,
                        winner_id: winner,
                    });
                    info!("tournament {id} finished, winner {winner:?}");
                    self.schedule_evict(id);
                    return;
                }
                Outcome::Advanced { updated, any_ready } => {
                    self.hub.broadcast(ServerEvent::TournamentRoundCompleted {
                        tournament_id: id,
                        round,
                    });
                    self.persist_tournament(id).await;
                    for (match_id, p1, p2, winner, status) in updated {
                        if let Err(e) = self
                            .store
                            .update_tournament_match(id, match_id, p1, p2, winner, None, status)
                            .await
                        {
                            warn!("failed to persist advanced match: {e:?}");
                        }
                    }

                    if any_ready {
                        let tx = self.self_tx.clone();
                        let next = round + 1;
                        tokio::spawn(async move {
                            tokio::time::sleep(NEXT_ROUND_DELAY).await;
                            let _ = tx.send(TournamentMsg::StartRound { id, round: next }).await;
                        });
                        return;
                    }
                    // every next-round match resolved as a bye; keep settling
                    round += 1;
                }
            }
        }
    }

    async fn cancel(&mut self, user: UserId, id: TournamentId) -> Result<(), TournamentError> {
        let active_games = {
            let t = self
                .tournaments
                .get_mut(&id)
                .ok_or(TournamentError::NotFound)?;
            if t.creator != user {
                return Err(TournamentError::NotCreator);
            }
            if t.status == TournamentStatus::Finished || t.status == TournamentStatus::Cancelled {
                return Err(TournamentError::Unavailable);
            }
            t.status = TournamentStatus::Cancelled;
            t.matches
                .iter()
                .filter(|m| m.status == MatchStatus::InProgress)
                .filter_map(|m| m.game_id)
                .collect::<Vec<_>>()
        };

        self.persist_tournament(id).await;
        self.hub
            .broadcast(ServerEvent::TournamentCancelled { tournament_id: id });
        for game_id in active_games {
            let _ = self.server.send(Message::AbortRoom { room: game_id }).await;
        }
        self.schedule_evict(id);
        info!("tournament {id} cancelled by {user}");
        Ok(())
    }

    async fn persist_tournament(&self, id: TournamentId) {
        let Some(t) = self.tournaments.get(&id) else {
            return;
        };
        if let Err(e) = self
            .store
            .update_tournament(
                id,
                t.status,
                t.current_round,
                t.max_players,
                t.total_rounds,
                t.winner,
            )
            .await
        {
            warn!("failed to persist tournament {id}: {e:?}");
        }
    }

    fn schedule_evict(&self, id: TournamentId) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(EVICT_DELAY).await;
            let _ = tx.send(TournamentMsg::Evict { id }).await;
        });
    }
}

fn summary(t: &Tournament) -> TournamentSummary {
    TournamentSummary {
        tournament_id: t.id,
        name: t.name.clone(),
        creator_id: t.creator,
        max_players: t.max_players,
        total_rounds: t.total_rounds,
        bracket_type: t.bracket_type.clone(),
        status: t.status,
        current_round: t.current_round,
        players: t.players.clone(),
        winner_id: t.winner,
    }
}

fn bracket_match(m: &TMatch) -> BracketMatch {
    BracketMatch {
        match_id: m.match_id.clone(),
        round: m.round,
        match_number: m.number,
        p1_id: m.p1,
        p2_id: m.p2,
        winner_id: m.winner,
        game_id: m.game_id,
        status: m.status,
    }
}

fn match_row(id: TournamentId, m: &TMatch) -> TournamentMatchRow {
    TournamentMatchRow {
        tournament_id: id,
        match_id: m.match_id.clone(),
        round: m.round,
        match_number: m.number,
        p1_id: m.p1,
        p2_id: m.p2,
        winner_id: m.winner,
        game_id: m.game_id,
        status: m.status,
    }
}
