use anyhow::Result;
use log::error;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rusqlite_migration::{Migrations, M};

use crate::data::{
    GameId, GameRow, MatchStatus, TournamentId, TournamentMatchRow, TournamentStatus, UserId,
    UserRow, AI_USER_ID,
};

use super::Command;

pub(super) struct DB {
    conn: Connection,
}

fn user_from_row(row: &Row) -> rusqlite::Result<(UserRow, String)> {
    Ok((
        UserRow {
            id: row.get("id")?,
            name: row.get("name")?,
            email: row.get("email")?,
            avatar: row.get("avatar")?,
            score: row.get("score")?,
            rank: row.get("rank")?,
            games_played: row.get("games_played")?,
            games_won: row.get("games_won")?,
            games_lost: row.get("games_lost")?,
            win_rate: row.get("win_rate")?,
            play_time: row.get("play_time")?,
            game_history: Vec::new(),
        },
        row.get("game_history")?,
    ))
}

impl DB {
    fn resolve_token(&mut self, token: String) -> Result<Option<UserRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT u.* FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token = ?1
               AND (s.expires_at IS NULL OR s.expires_at > strftime('%s','now'))",
        )?;
        let found = stmt.query_row([token], user_from_row).optional()?;
        Ok(match found {
            Some((mut user, history)) => {
                user.game_history = serde_json::from_str(&history)?;
                Some(user)
            }
            None => None,
        })
    }

    fn get_user(&mut self, id: UserId) -> Result<Option<UserRow>> {
        let mut stmt = self.conn.prepare("SELECT * FROM users WHERE id = ?1")?;
        let found = stmt.query_row([id], user_from_row).optional()?;
        Ok(match found {
            Some((mut user, history)) => {
                user.game_history = serde_json::from_str(&history)?;
                Some(user)
            }
            None => None,
        })
    }

    fn write_user_stats(&mut self, user: UserRow) -> Result<()> {
        let history = serde_json::to_string(&user.game_history)?;
        let mut stmt = self.conn.prepare(
            "UPDATE users SET score = ?1, games_played = ?2, games_won = ?3,
             games_lost = ?4, win_rate = ?5, play_time = ?6, game_history = ?7
             WHERE id = ?8",
        )?;
        stmt.execute(params![
            user.score,
            user.games_played,
            user.games_won,
            user.games_lost,
            user.win_rate,
            user.play_time,
            history,
            user.id,
        ])?;
        Ok(())
    }

    /// Re-rank the ladder: everyone who has actually played a ranked game,
    /// best score first. The AI never appears on the board.
    fn update_ranks(&mut self) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM users WHERE games_played > 0 AND id != ?1
             ORDER BY score DESC, id ASC",
        )?;
        let ids: Vec<UserId> = stmt
            .query_map([AI_USER_ID], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;

        let mut update = self.conn.prepare("UPDATE users SET rank = ?1 WHERE id = ?2")?;
        for (index, id) in ids.iter().enumerate() {
            update.execute(params![(index + 1) as i64, id])?;
        }
        Ok(())
    }

    fn create_game(&mut self, row: GameRow) -> Result<()> {
        let (tournament_id, round, match_id) = match &row.tournament {
            Some(t) => (Some(t.tournament_id), Some(t.round), Some(t.match_id.clone())),
            None => (None, None, None),
        };
        let mut stmt = self.conn.prepare(
            "INSERT INTO games (id, mode, p1_id, p2_id, p1_score, p2_score,
             winner_id, duration, tournament_id, round, match_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;
        stmt.execute(params![
            row.id,
            row.mode.as_str(),
            row.p1_id,
            row.p2_id,
            row.p1_score,
            row.p2_score,
            row.winner_id,
            row.duration_secs,
            tournament_id,
            round,
            match_id,
        ])?;
        Ok(())
    }

    fn finish_game(
        &mut self,
        id: GameId,
        p1_score: i64,
        p2_score: i64,
        winner_id: Option<UserId>,
        duration_secs: i64,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "UPDATE games SET p1_score = ?1, p2_score = ?2, winner_id = ?3, duration = ?4
             WHERE id = ?5",
        )?;
        stmt.execute(params![p1_score, p2_score, winner_id, duration_secs, id])?;
        Ok(())
    }

    fn create_tournament(
        &mut self,
        name: String,
        creator_id: UserId,
        max_players: u32,
        total_rounds: u32,
        bracket_type: String,
    ) -> Result<TournamentId> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO tournaments (name, creator_id, max_players, total_rounds,
             bracket_type, status, current_round)
             VALUES (?1, ?2, ?3, ?4, ?5, 'REGISTRATION', 0)",
        )?;
        let id = stmt.insert(params![name, creator_id, max_players, total_rounds, bracket_type])?;
        Ok(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn update_tournament(
        &mut self,
        id: TournamentId,
        status: TournamentStatus,
        current_round: u32,
        max_players: u32,
        total_rounds: u32,
        winner_id: Option<UserId>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "UPDATE tournaments SET status = ?1, current_round = ?2, max_players = ?3,
             total_rounds = ?4, winner_id = ?5 WHERE id = ?6",
        )?;
        stmt.execute(params![
            status.as_str(),
            current_round,
            max_players,
            total_rounds,
            winner_id,
            id,
        ])?;
        Ok(())
    }

    fn add_tournament_player(&mut self, tournament_id: TournamentId, user_id: UserId) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO tournament_players (tournament_id, user_id) VALUES (?1, ?2)",
        )?;
        stmt.execute(params![tournament_id, user_id])?;
        Ok(())
    }

    fn remove_tournament_player(
        &mut self,
        tournament_id: TournamentId,
        user_id: UserId,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "DELETE FROM tournament_players WHERE tournament_id = ?1 AND user_id = ?2",
        )?;
        stmt.execute(params![tournament_id, user_id])?;
        Ok(())
    }

    fn set_tournament_seeds(
        &mut self,
        tournament_id: TournamentId,
        seeds: Vec<(UserId, u32)>,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "UPDATE tournament_players SET seed = ?1 WHERE tournament_id = ?2 AND user_id = ?3",
        )?;
        for (user_id, seed) in seeds {
            stmt.execute(params![seed, tournament_id, user_id])?;
        }
        Ok(())
    }

    fn create_tournament_match(&mut self, row: TournamentMatchRow) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "INSERT INTO tournament_matches (tournament_id, match_id, round, match_number,
             p1_id, p2_id, winner_id, game_id, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        stmt.execute(params![
            row.tournament_id,
            row.match_id,
            row.round,
            row.match_number,
            row.p1_id,
            row.p2_id,
            row.winner_id,
            row.game_id,
            row.status.as_str(),
        ])?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn update_tournament_match(
        &mut self,
        tournament_id: TournamentId,
        match_id: String,
        p1_id: Option<UserId>,
        p2_id: Option<UserId>,
        winner_id: Option<UserId>,
        game_id: Option<GameId>,
        status: MatchStatus,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "UPDATE tournament_matches SET p1_id = ?1, p2_id = ?2, winner_id = ?3,
             game_id = ?4, status = ?5
             WHERE tournament_id = ?6 AND match_id = ?7",
        )?;
        stmt.execute(params![
            p1_id,
            p2_id,
            winner_id,
            game_id,
            status.as_str(),
            tournament_id,
            match_id,
        ])?;
        Ok(())
    }

    #[cfg(test)]
    fn insert_user(&mut self, id: UserId, name: String, email: String) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("INSERT INTO users (id, name, email) VALUES (?1, ?2, ?3)")?;
        stmt.execute(params![id, name, email])?;
        Ok(())
    }

    #[cfg(test)]
    fn insert_session(&mut self, token: String, user_id: UserId) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("INSERT INTO sessions (token, user_id) VALUES (?1, ?2)")?;
        stmt.execute(params![token, user_id])?;
        Ok(())
    }

    pub(super) fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::ResolveToken { token, resp } => resp.send(self.resolve_token(token)).is_ok(),
            Command::GetUser { id, resp } => resp.send(self.get_user(id)).is_ok(),
            Command::WriteUserStats { user, resp } => {
                let id = user.id;
                match self.write_user_stats(user) {
                    Ok(()) => resp.send(Ok(())).is_ok(),
                    Err(e) => {
                        error!("failed to save stats for user {id}: {e:?}");
                        resp.send(Err(e)).is_ok()
                    }
                }
            }
            Command::UpdateRanks { resp } => resp.send(self.update_ranks()).is_ok(),
            Command::CreateGame { row, resp } => resp.send(self.create_game(row)).is_ok(),
            Command::FinishGame {
                id,
                p1_score,
                p2_score,
                winner_id,
                duration_secs,
                resp,
            } => resp
                .send(self.finish_game(id, p1_score, p2_score, winner_id, duration_secs))
                .is_ok(),
            Command::CreateTournament {
                name,
                creator_id,
                max_players,
                total_rounds,
                bracket_type,
                resp,
            } => resp
                .send(self.create_tournament(name, creator_id, max_players, total_rounds, bracket_type))
                .is_ok(),
            Command::UpdateTournament {
                id,
                status,
                current_round,
                max_players,
                total_rounds,
                winner_id,
                resp,
            } => resp
                .send(self.update_tournament(id, status, current_round, max_players, total_rounds, winner_id))
                .is_ok(),
            Command::AddTournamentPlayer {
                tournament_id,
                user_id,
                resp,
            } => resp
                .send(self.add_tournament_player(tournament_id, user_id))
                .is_ok(),
            Command::RemoveTournamentPlayer {
                tournament_id,
                user_id,
                resp,
            } => resp
                .send(self.remove_tournament_player(tournament_id, user_id))
                .is_ok(),
            Command::SetTournamentSeeds {
                tournament_id,
                seeds,
                resp,
            } => resp
                .send(self.set_tournament_seeds(tournament_id, seeds))
                .is_ok(),
            Command::CreateTournamentMatch { row, resp } => {
                resp.send(self.create_tournament_match(row)).is_ok()
            }
            Command::UpdateTournamentMatch {
                tournament_id,
                match_id,
                p1_id,
                p2_id,
                winner_id,
                game_id,
                status,
                resp,
            } => resp
                .send(self.update_tournament_match(
                    tournament_id,
                    match_id,
                    p1_id,
                    p2_id,
                    winner_id,
                    game_id,
                    status,
                ))
                .is_ok(),
            #[cfg(test)]
            Command::InsertUser {
                id,
                name,
                email,
                resp,
            } => resp.send(self.insert_user(id, name, email)).is_ok(),
            #[cfg(test)]
            Command::InsertSession {
                token,
                user_id,
                resp,
            } => resp.send(self.insert_session(token, user_id)).is_ok(),
        }
    }
}

pub(super) fn create(path: &str) -> Result<DB> {
    let migrations = Migrations::new(vec![
        M::up(
            "CREATE TABLE users(
				id INTEGER PRIMARY KEY NOT NULL,
				name TEXT NOT NULL,
				email TEXT NOT NULL UNIQUE,
				avatar TEXT,
				score INTEGER NOT NULL DEFAULT 1200,
				rank INTEGER NOT NULL DEFAULT 0,
				games_played INTEGER NOT NULL DEFAULT 0,
				games_won INTEGER NOT NULL DEFAULT 0,
				games_lost INTEGER NOT NULL DEFAULT 0,
				win_rate REAL NOT NULL DEFAULT 0,
				play_time INTEGER NOT NULL DEFAULT 0,
				game_history TEXT NOT NULL DEFAULT '[]'
			);",
        ),
        M::up(
            "CREATE TABLE sessions(
				token TEXT PRIMARY KEY NOT NULL,
				user_id INTEGER NOT NULL,
				expires_at INTEGER,
				FOREIGN KEY (user_id) REFERENCES users(id)
			);",
        ),
        M::up(
            "CREATE TABLE games(
				id INTEGER PRIMARY KEY NOT NULL,
				mode TEXT NOT NULL,
				p1_id INTEGER NOT NULL,
				p2_id INTEGER,
				p1_score INTEGER NOT NULL DEFAULT 0,
				p2_score INTEGER NOT NULL DEFAULT 0,
				winner_id INTEGER,
				duration INTEGER NOT NULL DEFAULT 0,
				tournament_id INTEGER,
				round INTEGER,
				match_id TEXT,
				created_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
			);",
        ),
        M::up(
            "CREATE TABLE tournaments(
				id INTEGER PRIMARY KEY NOT NULL,
				name TEXT NOT NULL,
				creator_id INTEGER NOT NULL,
				max_players INTEGER NOT NULL,
				total_rounds INTEGER NOT NULL,
				bracket_type TEXT NOT NULL,
				status TEXT NOT NULL,
				current_round INTEGER NOT NULL DEFAULT 0,
				winner_id INTEGER,
				created_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
			);",
        ),
        M::up(
            "CREATE TABLE tournament_players(
				tournament_id INTEGER NOT NULL,
				user_id INTEGER NOT NULL,
				seed INTEGER,
				PRIMARY KEY (tournament_id, user_id)
			);",
        ),
        M::up(
            "CREATE TABLE tournament_matches(
				tournament_id INTEGER NOT NULL,
				match_id TEXT NOT NULL,
				round INTEGER NOT NULL,
				match_number INTEGER NOT NULL,
				p1_id INTEGER,
				p2_id INTEGER,
				winner_id INTEGER,
				game_id INTEGER,
				status TEXT NOT NULL,
				PRIMARY KEY (tournament_id, match_id)
			);",
        ),
        // the AI opponent is a real account with a reserved email
        M::up("INSERT INTO users (id, name, email) VALUES (1, 'Marvin', 'ai@pong.local');"),
    ]);

    let mut conn = Connection::open(path)?;

    migrations.to_latest(&mut conn)?;

    let db = DB { conn };
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{GameMode, TournamentLink};

    fn db() -> DB {
        create(":memory:").expect("in-memory db")
    }

    #[test]
    fn migrations_apply_and_seed_ai_user() {
        let mut db = db();
        let ai = db.get_user(AI_USER_ID).unwrap().expect("ai user seeded");
        assert_eq!(ai.email, "ai@pong.local");
        assert_eq!(ai.score, 1200);
    }

    #[test]
    fn token_resolution_honors_expiry() {
        let mut db = db();
        db.insert_user(5, "ada".into(), "ada@example.com".into())
            .unwrap();
        db.insert_session("tok-live".into(), 5).unwrap();
        db.conn
            .execute(
                "INSERT INTO sessions (token, user_id, expires_at) VALUES ('tok-dead', 5, 1)",
                [],
            )
            .unwrap();

        let live = db.resolve_token("tok-live".into()).unwrap();
        assert_eq!(live.map(|u| u.id), Some(5));
        assert!(db.resolve_token("tok-dead".into()).unwrap().is_none());
        assert!(db.resolve_token("nope".into()).unwrap().is_none());
    }

    #[test]
    fn stats_roundtrip_includes_history() {
        let mut db = db();
        db.insert_user(5, "ada".into(), "ada@example.com".into())
            .unwrap();

        let mut user = db.get_user(5).unwrap().unwrap();
        user.score = 1216;
        user.games_played = 1;
        user.games_won = 1;
        user.win_rate = 100.0;
        user.play_time = 95;
        user.game_history.push(777);
        db.write_user_stats(user).unwrap();

        let back = db.get_user(5).unwrap().unwrap();
        assert_eq!(back.score, 1216);
        assert_eq!(back.game_history, vec![777]);
    }

    #[test]
    fn ranks_skip_ai_and_unplayed_users() {
        let mut db = db();
        for (id, score, played) in [(5, 1300, 4), (6, 1250, 2), (7, 1200, 0)] {
            db.insert_user(id, format!("u{id}"), format!("u{id}@example.com"))
                .unwrap();
            db.conn
                .execute(
                    "UPDATE users SET score = ?1, games_played = ?2 WHERE id = ?3",
                    params![score, played, id],
                )
                .unwrap();
        }
        // give the AI a score that would otherwise top the board
        db.conn
            .execute("UPDATE users SET score = 9999, games_played = 50 WHERE id = 1", [])
            .unwrap();

        db.update_ranks().unwrap();

        assert_eq!(db.get_user(5).unwrap().unwrap().rank, 1);
        assert_eq!(db.get_user(6).unwrap().unwrap().rank, 2);
        // never played: stays unranked
        assert_eq!(db.get_user(7).unwrap().unwrap().rank, 0);
        assert_eq!(db.get_user(AI_USER_ID).unwrap().unwrap().rank, 0);
    }

    #[test]
    fn tournament_game_precreate_then_patch() {
        let mut db = db();
        db.insert_user(5, "ada".into(), "ada@example.com".into())
            .unwrap();
        db.insert_user(6, "bob".into(), "bob@example.com".into())
            .unwrap();

        let row = GameRow {
            id: 4242,
            mode: GameMode::Tournament,
            p1_id: 5,
            p2_id: Some(6),
            p1_score: 0,
            p2_score: 0,
            winner_id: None,
            duration_secs: 0,
            tournament: Some(TournamentLink {
                tournament_id: 1,
                round: 1,
                total_rounds: 2,
                match_id: "T1-R1-M0".into(),
            }),
        };
        db.create_game(row).unwrap();
        db.finish_game(4242, 11, 4, Some(5), 180).unwrap();

        let (winner, duration): (Option<UserId>, i64) = db
            .conn
            .query_row(
                "SELECT winner_id, duration FROM games WHERE id = 4242",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(winner, Some(5));
        assert_eq!(duration, 180);
    }
}
