use serde::{Deserialize, Serialize};

pub type UserId = i64;
pub type GameId = i64;
pub type TournamentId = i64;

/// The AI opponent is a real user row, seeded by migration with a reserved
/// email. It never appears on the leaderboard and never gains or loses ELO.
pub const AI_USER_ID: UserId = 1;
/// Display name of the seeded AI user (mirrors the migration row).
pub const AI_USER_NAME: &str = "Marvin";

/// Initial ladder score for every fresh account.
pub const INITIAL_SCORE: i64 = 1200;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameMode {
    Public,
    Private,
    Local,
    Ai,
    Tournament,
}

impl GameMode {
    pub fn as_str(self) -> &'static str {
        match self {
            GameMode::Public => "PUBLIC",
            GameMode::Private => "PRIVATE",
            GameMode::Local => "LOCAL",
            GameMode::Ai => "AI",
            GameMode::Tournament => "TOURNAMENT",
        }
    }

    /// Only public ladder games and tournament games touch ELO.
    pub fn is_ranked(self) -> bool {
        matches!(self, GameMode::Public | GameMode::Tournament)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomStatus {
    Waiting,
    Starting,
    InProgress,
    Finished,
    Cancelled,
}

/// Paddle steering input. The wire encodes this as 0/1/2; anything else is a
/// validation error before it reaches a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum Direction {
    None,
    Up,
    Down,
}

impl TryFrom<u8> for Direction {
    type Error = String;

    fn try_from(v: u8) -> Result<Direction, String> {
        match v {
            0 => Ok(Direction::None),
            1 => Ok(Direction::Up),
            2 => Ok(Direction::Down),
            other => Err(format!("unknown direction {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Presence {
    Offline,
    Online,
    InGame,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TournamentStatus {
    Registration,
    Starting,
    InProgress,
    Finished,
    Cancelled,
}

impl TournamentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TournamentStatus::Registration => "REGISTRATION",
            TournamentStatus::Starting => "STARTING",
            TournamentStatus::InProgress => "IN_PROGRESS",
            TournamentStatus::Finished => "FINISHED",
            TournamentStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TournamentStatus::Finished | TournamentStatus::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
}

impl MatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchStatus::Pending => "pending",
            MatchStatus::Ready => "ready",
            MatchStatus::InProgress => "in_progress",
            MatchStatus::Completed => "completed",
        }
    }
}

/// Durable per-user record. Owned by the Store; the core reads it on demand
/// and writes it back after each ranked game.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRow {
    pub id: UserId,
    pub name: String,
    pub email: String,
    pub avatar: Option<String>,
    pub score: i64,
    pub rank: i64,
    pub games_played: i64,
    pub games_won: i64,
    pub games_lost: i64,
    pub win_rate: f64,
    /// Accumulated seconds spent in ranked games.
    pub play_time: i64,
    pub game_history: Vec<GameId>,
}

/// Links a game back to the tournament match it decides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentLink {
    pub tournament_id: TournamentId,
    pub round: u32,
    pub total_rounds: u32,
    pub match_id: String,
}

/// A completed (or, for tournament games, pre-created) game record.
#[derive(Clone, Debug)]
pub struct GameRow {
    pub id: GameId,
    pub mode: GameMode,
    pub p1_id: UserId,
    pub p2_id: Option<UserId>,
    pub p1_score: i64,
    pub p2_score: i64,
    pub winner_id: Option<UserId>,
    pub duration_secs: i64,
    pub tournament: Option<TournamentLink>,
}

#[derive(Clone, Debug)]
pub struct TournamentMatchRow {
    pub tournament_id: TournamentId,
    pub match_id: String,
    pub round: u32,
    pub match_number: u32,
    pub p1_id: Option<UserId>,
    pub p2_id: Option<UserId>,
    pub winner_id: Option<UserId>,
    pub game_id: Option<GameId>,
    pub status: MatchStatus,
}
