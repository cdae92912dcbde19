//! Wire protocol: JSON text frames shaped as `{"event": ..., "data": ...}`.
//!
//! Everything is statically typed here; validation happens when a frame is
//! deserialized, so the core only ever sees well-formed commands.

use serde::{Deserialize, Serialize};

use crate::data::{
    Difficulty, Direction, GameId, GameMode, MatchStatus, Presence, RoomStatus, TournamentId,
    TournamentLink, TournamentStatus, UserId,
};

/// Any frame a client may send. Game traffic and tournament traffic are
/// routed to different actors, so they parse into separate enums.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ClientEvent {
    Game(GameEvent),
    Tournament(TournamentEvent),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum GameEvent {
    #[serde(rename = "game:join-matchmaking")]
    JoinMatchmaking,
    #[serde(rename = "game:create-private")]
    CreatePrivate,
    #[serde(rename = "game:join-private", rename_all = "camelCase")]
    JoinPrivate { game_id: GameId },
    #[serde(rename = "game:create-local", rename_all = "camelCase")]
    CreateLocal {
        player1_name: String,
        player2_name: String,
    },
    #[serde(rename = "game:create-ai")]
    CreateAi { difficulty: Difficulty },
    #[serde(rename = "game:move", rename_all = "camelCase")]
    Move {
        game_id: GameId,
        direction: Direction,
        #[serde(default)]
        player_number: Option<u8>,
    },
    #[serde(rename = "game:leave")]
    Leave,
    #[serde(rename = "game:forfeit")]
    Forfeit,
    #[serde(rename = "game:rejoin", rename_all = "camelCase")]
    Rejoin { game_id: GameId },
    #[serde(rename = "game:spectate", rename_all = "camelCase")]
    Spectate { game_id: GameId },
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum TournamentEvent {
    #[serde(rename = "tournament:create", rename_all = "camelCase")]
    Create {
        name: String,
        max_players: u32,
        #[serde(default)]
        bracket_type: Option<String>,
    },
    #[serde(rename = "tournament:join", rename_all = "camelCase")]
    Join { tournament_id: TournamentId },
    #[serde(rename = "tournament:leave", rename_all = "camelCase")]
    Leave { tournament_id: TournamentId },
    #[serde(rename = "tournament:start", rename_all = "camelCase")]
    Start { tournament_id: TournamentId },
    #[serde(rename = "tournament:cancel", rename_all = "camelCase")]
    Cancel { tournament_id: TournamentId },
    #[serde(rename = "tournament:get", rename_all = "camelCase")]
    Get { tournament_id: TournamentId },
    #[serde(rename = "tournament:get-bracket", rename_all = "camelCase")]
    GetBracket { tournament_id: TournamentId },
    #[serde(rename = "tournament:list-active")]
    ListActive,
    #[serde(rename = "tournament:my-tournaments")]
    MyTournaments,
}

/// Every frame the server can push.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "game-created", rename_all = "camelCase")]
    GameCreated { game_id: GameId, mode: GameMode },
    #[serde(rename = "game-starting")]
    GameStarting(GameStarting),
    #[serde(rename = "game-update")]
    GameUpdate(GameSnapshot),
    #[serde(rename = "game-ended")]
    GameEnded(GameEnded),
    #[serde(rename = "game-cancelled", rename_all = "camelCase")]
    GameCancelled { game_id: GameId },
    #[serde(rename = "game-left", rename_all = "camelCase")]
    GameLeft {
        game_id: GameId,
        reconnect_deadline_ms: u64,
    },
    #[serde(rename = "opponent-disconnected", rename_all = "camelCase")]
    OpponentDisconnected {
        game_id: GameId,
        reconnect_deadline_ms: u64,
    },
    #[serde(rename = "opponent-reconnected", rename_all = "camelCase")]
    OpponentReconnected { game_id: GameId },
    #[serde(rename = "user-statuses-updated")]
    UserStatusesUpdated { statuses: Vec<UserStatus> },
    #[serde(rename = "game:error")]
    GameError { message: String },

    #[serde(rename = "tournament:created")]
    TournamentCreated(TournamentSummary),
    #[serde(rename = "tournament:player-joined", rename_all = "camelCase")]
    TournamentPlayerJoined {
        tournament_id: TournamentId,
        user_id: UserId,
        current_players: u32,
    },
    #[serde(rename = "tournament:player-left", rename_all = "camelCase")]
    TournamentPlayerLeft {
        tournament_id: TournamentId,
        user_id: UserId,
        current_players: u32,
    },
    #[serde(rename = "tournament:started")]
    TournamentStarted(TournamentSummary),
    #[serde(rename = "tournament:round-started", rename_all = "camelCase")]
    TournamentRoundStarted {
        tournament_id: TournamentId,
        round: u32,
    },
    #[serde(rename = "tournament:match-ready", rename_all = "camelCase")]
    TournamentMatchReady {
        tournament_id: TournamentId,
        match_id: String,
        round: u32,
        opponent_id: UserId,
        game_id: GameId,
    },
    #[serde(rename = "tournament:match-completed", rename_all = "camelCase")]
    TournamentMatchCompleted {
        tournament_id: TournamentId,
        match_id: String,
        winner_id: Option<UserId>,
    },
    #[serde(rename = "tournament:round-completed", rename_all = "camelCase")]
    TournamentRoundCompleted {
        tournament_id: TournamentId,
        round: u32,
    },
    #[serde(rename = "tournament:completed", rename_all = "camelCase")]
    TournamentCompleted {
        tournament_id: TournamentId,
        winner_id: Option<UserId>,
    },
    #[serde(rename = "tournament:cancelled", rename_all = "camelCase")]
    TournamentCancelled { tournament_id: TournamentId },
    #[serde(rename = "tournament:details")]
    TournamentDetails(TournamentSummary),
    #[serde(rename = "tournament:bracket", rename_all = "camelCase")]
    TournamentBracket {
        tournament_id: TournamentId,
        matches: Vec<BracketMatch>,
    },
    #[serde(rename = "tournament:list")]
    TournamentList { tournaments: Vec<TournamentSummary> },
    #[serde(rename = "tournament:error")]
    TournamentError { message: String },
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStarting {
    pub game_id: GameId,
    pub mode: GameMode,
    pub p1_id: UserId,
    pub p2_id: UserId,
    pub p1_name: String,
    pub p2_name: String,
    pub starts_in_ms: u64,
}

/// Authoritative state frame, pushed once per tick to everyone in the room
/// channel.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    pub game_id: GameId,
    pub p1_score: u8,
    pub p2_score: u8,
    pub paddle_left: f64,
    pub paddle_right: f64,
    pub ball_x: f64,
    pub ball_y: f64,
    pub status: RoomStatus,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEnded {
    pub game_id: GameId,
    pub winner_id: Option<UserId>,
    pub p1_score: u8,
    pub p2_score: u8,
    pub forfeit: bool,
    pub tournament: Option<TournamentLink>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    pub user_id: UserId,
    pub status: Presence,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TournamentSummary {
    pub tournament_id: TournamentId,
    pub name: String,
    pub creator_id: UserId,
    pub max_players: u32,
    pub total_rounds: u32,
    pub bracket_type: String,
    pub status: TournamentStatus,
    pub current_round: u32,
    pub players: Vec<UserId>,
    pub winner_id: Option<UserId>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BracketMatch {
    pub match_id: String,
    pub round: u32,
    pub match_number: u32,
    pub p1_id: Option<UserId>,
    pub p2_id: Option<UserId>,
    pub winner_id: Option<UserId>,
    pub game_id: Option<GameId>,
    pub status: MatchStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> ClientEvent {
        serde_json::from_str(s).expect("frame should parse")
    }

    #[test]
    fn parses_bare_commands() {
        assert!(matches!(
            parse(r#"{"event":"game:join-matchmaking"}"#),
            ClientEvent::Game(GameEvent::JoinMatchmaking)
        ));
        assert!(matches!(
            parse(r#"{"event":"game:leave"}"#),
            ClientEvent::Game(GameEvent::Leave)
        ));
        assert!(matches!(
            parse(r#"{"event":"tournament:list-active"}"#),
            ClientEvent::Tournament(TournamentEvent::ListActive)
        ));
    }

    #[test]
    fn parses_move_with_and_without_player_number() {
        match parse(r#"{"event":"game:move","data":{"gameId":7,"direction":1}}"#) {
            ClientEvent::Game(GameEvent::Move {
                game_id,
                direction,
                player_number,
            }) => {
                assert_eq!(game_id, 7);
                assert_eq!(direction, Direction::Up);
                assert_eq!(player_number, None);
            }
            other => panic!("unexpected parse: {other:?}"),
        }

        match parse(r#"{"event":"game:move","data":{"gameId":7,"direction":2,"playerNumber":2}}"#) {
            ClientEvent::Game(GameEvent::Move {
                direction,
                player_number,
                ..
            }) => {
                assert_eq!(direction, Direction::Down);
                assert_eq!(player_number, Some(2));
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_direction() {
        let r: Result<ClientEvent, _> =
            serde_json::from_str(r#"{"event":"game:move","data":{"gameId":7,"direction":9}}"#);
        assert!(r.is_err());
    }

    #[test]
    fn parses_tournament_create() {
        match parse(r#"{"event":"tournament:create","data":{"name":"Friday Cup","maxPlayers":8}}"#)
        {
            ClientEvent::Tournament(TournamentEvent::Create {
                name,
                max_players,
                bracket_type,
            }) => {
                assert_eq!(name, "Friday Cup");
                assert_eq!(max_players, 8);
                assert_eq!(bracket_type, None);
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn serializes_snapshot_shape() {
        let frame = ServerEvent::GameUpdate(GameSnapshot {
            game_id: 42,
            p1_score: 3,
            p2_score: 5,
            paddle_left: 10.0,
            paddle_right: 80.0,
            ball_x: 50.0,
            ball_y: 25.5,
            status: RoomStatus::InProgress,
        });
        let v: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(v["event"], "game-update");
        assert_eq!(v["data"]["gameId"], 42);
        assert_eq!(v["data"]["ballY"], 25.5);
        assert_eq!(v["data"]["status"], "IN_PROGRESS");
    }

    #[test]
    fn serializes_error_shape() {
        let v: serde_json::Value = serde_json::to_value(&ServerEvent::GameError {
            message: "NOT_IN_GAME".into(),
        })
        .unwrap();
        assert_eq!(v["event"], "game:error");
        assert_eq!(v["data"]["message"], "NOT_IN_GAME");
    }
}
