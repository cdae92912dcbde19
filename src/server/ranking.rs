//! ELO math and post-game stat bookkeeping. Pure functions; the coordinator
//! decides when a game counts (public and tournament games only, never games
//! involving the AI) and the Store applies the re-rank.

use crate::data::{GameId, UserId, UserRow, AI_USER_ID};

pub const K: f64 = 32.0;

/// Probability that a player rated `r_a` beats a player rated `r_b`.
pub fn expected(r_a: i64, r_b: i64) -> f64 {
    1.0 / (1.0 + 10f64.powf((r_b - r_a) as f64 / 400.0))
}

/// Integer rating transfer for a decided game. Applying `+delta` to the
/// winner and `-delta` to the loser keeps the ladder zero-sum even though
/// ratings are stored floored.
pub fn delta(winner_score: i64, loser_score: i64, multiplier: f64) -> i64 {
    (K * multiplier * (1.0 - expected(winner_score, loser_score))).floor() as i64
}

/// Tournament games weigh more the deeper the round; the final is heaviest.
pub fn round_multiplier(round: u32, total_rounds: u32) -> f64 {
    if total_rounds == 0 {
        1.0
    } else {
        1.0 + (round as f64 / total_rounds as f64) * 0.5
    }
}

/// Does this pairing move the ladder at all? Games against the AI never do.
pub fn moves_ladder(p1: UserId, p2: UserId) -> bool {
    p1 != AI_USER_ID && p2 != AI_USER_ID
}

/// Fold one decided game into both players' durable stats.
pub fn apply_result(
    winner: &mut UserRow,
    loser: &mut UserRow,
    game_id: GameId,
    duration_secs: i64,
    multiplier: f64,
) {
    let d = delta(winner.score, loser.score, multiplier);
    winner.score += d;
    loser.score -= d;

    winner.games_played += 1;
    winner.games_won += 1;
    loser.games_played += 1;
    loser.games_lost += 1;

    winner.win_rate = percent(winner.games_won, winner.games_played);
    loser.win_rate = percent(loser.games_won, loser.games_played);

    winner.play_time += duration_secs;
    loser.play_time += duration_secs;

    winner.game_history.push(game_id);
    loser.game_history.push(game_id);
}

fn percent(won: i64, played: i64) -> f64 {
    if played == 0 {
        0.0
    } else {
        (won as f64 / played as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: UserId, score: i64) -> UserRow {
        UserRow {
            id,
            name: format!("user-{id}"),
            email: format!("user-{id}@example.com"),
            avatar: None,
            score,
            rank: 0,
            games_played: 0,
            games_won: 0,
            games_lost: 0,
            win_rate: 0.0,
            play_time: 0,
            game_history: Vec::new(),
        }
    }

    #[test]
    fn expected_scores_are_complementary() {
        let ew = expected(1400, 1200);
        let el = expected(1200, 1400);
        assert!((ew + el - 1.0).abs() < 1e-12);
        assert!(ew > 0.5);
    }

    #[test]
    fn rating_transfer_is_zero_sum() {
        for (rw, rl) in [(1200, 1200), (1400, 1150), (900, 2100), (1201, 1199)] {
            let mut w = user(1, rw);
            let mut l = user(2, rl);
            apply_result(&mut w, &mut l, 10, 60, 1.0);
            assert_eq!(w.score + l.score, rw + rl);
        }
    }

    #[test]
    fn even_match_moves_sixteen_points() {
        let mut w = user(1, 1200);
        let mut l = user(2, 1200);
        apply_result(&mut w, &mut l, 10, 60, 1.0);
        assert_eq!(w.score, 1216);
        assert_eq!(l.score, 1184);
    }

    #[test]
    fn upsets_transfer_more_than_expected_wins() {
        let underdog_gain = delta(1100, 1400, 1.0);
        let favourite_gain = delta(1400, 1100, 1.0);
        assert!(underdog_gain > favourite_gain);
    }

    #[test]
    fn finals_weigh_heaviest() {
        let early = round_multiplier(1, 3);
        let finals = round_multiplier(3, 3);
        assert!(finals > early);
        assert!((finals - 1.5).abs() < 1e-12);
        assert!((round_multiplier(0, 0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn stats_accumulate_across_games() {
        let mut a = user(1, 1200);
        let mut b = user(2, 1200);
        apply_result(&mut a, &mut b, 10, 100, 1.0);
        apply_result(&mut b, &mut a, 11, 50, 1.0);

        assert_eq!(a.games_played, 2);
        assert_eq!(a.games_won, 1);
        assert_eq!(a.games_lost, 1);
        assert!((a.win_rate - 50.0).abs() < 1e-12);
        assert_eq!(a.play_time, 150);
        assert_eq!(a.game_history, vec![10, 11]);
    }

    #[test]
    fn ai_games_never_move_the_ladder() {
        assert!(!moves_ladder(AI_USER_ID, 7));
        assert!(!moves_ladder(7, AI_USER_ID));
        assert!(moves_ladder(7, 8));
    }
}
