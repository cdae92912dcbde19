use anyhow::Result;
use log::error;
use tokio::sync::{mpsc, oneshot};

mod backend;
mod frontend;

pub use frontend::Store;

use crate::data::{
    GameId, GameRow, MatchStatus, TournamentId, TournamentMatchRow, TournamentStatus, UserId,
    UserRow,
};

enum Command {
    ResolveToken {
        token: String,
        resp: Responder<Result<Option<UserRow>>>,
    },

    GetUser {
        id: UserId,
        resp: Responder<Result<Option<UserRow>>>,
    },

    WriteUserStats {
        user: UserRow,
        resp: Responder<Result<()>>,
    },

    UpdateRanks {
        resp: Responder<Result<()>>,
    },

    CreateGame {
        row: GameRow,
        resp: Responder<Result<()>>,
    },

    FinishGame {
        id: GameId,
        p1_score: i64,
        p2_score: i64,
        winner_id: Option<UserId>,
        duration_secs: i64,
        resp: Responder<Result<()>>,
    },

    CreateTournament {
        name: String,
        creator_id: UserId,
        max_players: u32,
        total_rounds: u32,
        bracket_type: String,
        resp: Responder<Result<TournamentId>>,
    },

    UpdateTournament {
        id: TournamentId,
        status: TournamentStatus,
        current_round: u32,
        max_players: u32,
        total_rounds: u32,
        winner_id: Option<UserId>,
        resp: Responder<Result<()>>,
    },

    AddTournamentPlayer {
        tournament_id: TournamentId,
        user_id: UserId,
        resp: Responder<Result<()>>,
    },

    RemoveTournamentPlayer {
        tournament_id: TournamentId,
        user_id: UserId,
        resp: Responder<Result<()>>,
    },

    SetTournamentSeeds {
        tournament_id: TournamentId,
        seeds: Vec<(UserId, u32)>,
        resp: Responder<Result<()>>,
    },

    CreateTournamentMatch {
        row: TournamentMatchRow,
        resp: Responder<Result<()>>,
    },

    UpdateTournamentMatch {
        tournament_id: TournamentId,
        match_id: String,
        p1_id: Option<UserId>,
        p2_id: Option<UserId>,
        winner_id: Option<UserId>,
        game_id: Option<GameId>,
        status: MatchStatus,
        resp: Responder<Result<()>>,
    },

    #[cfg(test)]
    InsertUser {
        id: UserId,
        name: String,
        email: String,
        resp: Responder<Result<()>>,
    },

    #[cfg(test)]
    InsertSession {
        token: String,
        user_id: UserId,
        resp: Responder<Result<()>>,
    },
}

type Responder<T> = oneshot::Sender<T>;

pub fn run(path: &str) -> Result<Store> {
    let mut db = backend::create(path)?;
    let (tx, mut rx) = mpsc::channel(100);

    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            if !db.handle_command(cmd) {
                error!("store command failed");
            }
        }
    });

    Ok(Store { tx })
}
