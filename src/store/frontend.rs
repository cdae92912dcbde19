use anyhow::Result;
use tokio::sync::{mpsc, oneshot};

use crate::data::{
    GameId, GameRow, MatchStatus, TournamentId, TournamentMatchRow, TournamentStatus, UserId,
    UserRow,
};

use super::Command;

/// Cloneable handle to the persistence actor.
#[derive(Clone)]
pub struct Store {
    pub(super) tx: mpsc::Sender<Command>,
}

impl Store {
    /// Resolve a bearer token to the user it was minted for. The external
    /// auth service owns the sessions table; we only read it.
    pub async fn resolve_token(&self, token: String) -> Result<Option<UserRow>> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::ResolveToken { token, resp })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn get_user(&self, id: UserId) -> Result<Option<UserRow>> {
        let (resp, rx) = oneshot::channel();
        self.tx.send(Command::GetUser { id, resp }).await.unwrap();
        rx.await?
    }

    pub async fn write_user_stats(&self, user: UserRow) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::WriteUserStats { user, resp })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn update_ranks(&self) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx.send(Command::UpdateRanks { resp }).await.unwrap();
        rx.await?
    }

    pub async fn create_game(&self, row: GameRow) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::CreateGame { row, resp })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn finish_game(
        &self,
        id: GameId,
        p1_score: i64,
        p2_score: i64,
        winner_id: Option<UserId>,
        duration_secs: i64,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::FinishGame {
                id,
                p1_score,
                p2_score,
                winner_id,
                duration_secs,
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn create_tournament(
        &self,
        name: String,
        creator_id: UserId,
        max_players: u32,
        total_rounds: u32,
        bracket_type: String,
    ) -> Result<TournamentId> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::CreateTournament {
                name,
                creator_id,
                max_players,
                total_rounds,
                bracket_type,
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_tournament(
        &self,
        id: TournamentId,
        status: TournamentStatus,
        current_round: u32,
        max_players: u32,
        total_rounds: u32,
        winner_id: Option<UserId>,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::UpdateTournament {
                id,
                status,
                current_round,
                max_players,
                total_rounds,
                winner_id,
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn add_tournament_player(
        &self,
        tournament_id: TournamentId,
        user_id: UserId,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::AddTournamentPlayer {
                tournament_id,
                user_id,
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn remove_tournament_player(
        &self,
        tournament_id: TournamentId,
        user_id: UserId,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::RemoveTournamentPlayer {
                tournament_id,
                user_id,
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn set_tournament_seeds(
        &self,
        tournament_id: TournamentId,
        seeds: Vec<(UserId, u32)>,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::SetTournamentSeeds {
                tournament_id,
                seeds,
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    pub async fn create_tournament_match(&self, row: TournamentMatchRow) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::CreateTournamentMatch { row, resp })
            .await
            .unwrap();
        rx.await?
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn update_tournament_match(
        &self,
        tournament_id: TournamentId,
        match_id: String,
        p1_id: Option<UserId>,
        p2_id: Option<UserId>,
        winner_id: Option<UserId>,
        game_id: Option<GameId>,
        status: MatchStatus,
    ) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::UpdateTournamentMatch {
                tournament_id,
                match_id,
                p1_id,
                p2_id,
                winner_id,
                game_id,
                status,
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    #[cfg(test)]
    pub async fn insert_user(&self, id: UserId, name: &str, email: &str) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::InsertUser {
                id,
                name: name.to_string(),
                email: email.to_string(),
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }

    #[cfg(test)]
    pub async fn insert_session(&self, token: &str, user_id: UserId) -> Result<()> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(Command::InsertSession {
                token: token.to_string(),
                user_id,
                resp,
            })
            .await
            .unwrap();
        rx.await?
    }
}
