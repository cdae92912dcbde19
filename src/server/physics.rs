//! Constant-step Pong simulation. One call to [`Physics::step`] is one tick;
//! the room actor decides when ticks happen, so the whole thing stays
//! deterministic for a given RNG seed and input sequence.

use std::f64::consts::PI;

use rand::rngs::StdRng;
use rand::Rng;

use crate::data::{Direction, Side};

pub const FIELD: f64 = 100.0;
pub const BALL_RADIUS: f64 = 1.0;
/// The court is square in logical units but rendered 16:9, so horizontal
/// distances carry the aspect correction.
pub const BALL_RADIUS_X: f64 = BALL_RADIUS * 16.0 / 9.0;

pub const PADDLE_SPEED: f64 = 1.0;
pub const PADDLE_HEIGHT: f64 = 10.0;
/// Highest legal paddle position (top edge coordinate).
pub const PADDLE_TRAVEL: f64 = FIELD - PADDLE_HEIGHT;
pub const PADDLE_LEFT_X: f64 = 4.0;
pub const PADDLE_RIGHT_X: f64 = 96.0;
/// Vertical slack added to each paddle end when testing a hit.
pub const HIT_TOLERANCE: f64 = 3.0;

pub const SPEED_DECAY: f64 = 0.9995;
pub const INITIAL_BALL_SPEED: f64 = 0.35;
pub const MAX_BALL_SPEED: f64 = 1.2;
/// Fraction of the full bounce angle actually imparted by hit position.
pub const SPIN: f64 = 0.8;
pub const BOUNCE_ANGLE: f64 = PI / 3.0;
pub const SERVE_ANGLE: f64 = PI / 6.0;
/// Below this horizontal speed the ball must be pushed back out of the
/// paddle's face, and below this total speed the rally is re-served.
pub const MIN_SPEED: f64 = 0.1;

pub const WIN_SCORE: u8 = 11;

pub struct Physics {
    pub ball_x: f64,
    pub ball_y: f64,
    pub vx: f64,
    pub vy: f64,
    pub speed: f64,
    pub paddle_left: f64,
    pub paddle_right: f64,
    pub left_dir: Direction,
    pub right_dir: Direction,
    prev_ball_x: f64,
    prev_ball_y: f64,
    rng: StdRng,
}

impl Physics {
    pub fn new(rng: StdRng) -> Physics {
        let mut p = Physics {
            ball_x: FIELD / 2.0,
            ball_y: FIELD / 2.0,
            vx: 0.0,
            vy: 0.0,
            speed: INITIAL_BALL_SPEED,
            paddle_left: PADDLE_TRAVEL / 2.0,
            paddle_right: PADDLE_TRAVEL / 2.0,
            left_dir: Direction::None,
            right_dir: Direction::None,
            prev_ball_x: FIELD / 2.0,
            prev_ball_y: FIELD / 2.0,
            rng,
        };
        p.serve();
        p
    }

    pub fn set_direction(&mut self, side: Side, dir: Direction) {
        match side {
            Side::Left => self.left_dir = dir,
            Side::Right => self.right_dir = dir,
        }
    }

    /// Center serve with a random angle inside ±π/6 and a random horizontal
    /// sign.
    fn serve(&mut self) {
        let angle = self.rng.gen_range(-SERVE_ANGLE..=SERVE_ANGLE);
        let sign = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
        self.speed = INITIAL_BALL_SPEED;
        self.ball_x = FIELD / 2.0;
        self.ball_y = FIELD / 2.0;
        self.prev_ball_x = self.ball_x;
        self.prev_ball_y = self.ball_y;
        self.vx = sign * self.speed * angle.cos();
        self.vy = self.speed * angle.sin();
    }

    /// Advance one tick. A frozen side's paddle holds still (its owner is
    /// disconnected). Returns the goal line the ball fully crossed, if any;
    /// the ball has already been re-served by then.
    pub fn step(&mut self, left_active: bool, right_active: bool) -> Option<Side> {
        // paddles first, recording per-tick velocity for momentum transfer
        let left_vel = if left_active {
            Self::move_paddle(&mut self.paddle_left, self.left_dir)
        } else {
            0.0
        };
        let right_vel = if right_active {
            Self::move_paddle(&mut self.paddle_right, self.right_dir)
        } else {
            0.0
        };

        // friction; a rally that decays to a crawl gets re-served
        self.vx *= SPEED_DECAY;
        self.vy *= SPEED_DECAY;
        self.speed *= SPEED_DECAY;
        if (self.vx * self.vx + self.vy * self.vy).sqrt() < MIN_SPEED {
            self.serve();
            return None;
        }

        self.prev_ball_x = self.ball_x;
        self.prev_ball_y = self.ball_y;
        let mut nx = self.ball_x + self.vx;
        let mut ny = self.ball_y + self.vy;

        // top/bottom walls
        if ny < BALL_RADIUS {
            ny = BALL_RADIUS;
            self.vy = -self.vy;
        } else if ny > FIELD - BALL_RADIUS {
            ny = FIELD - BALL_RADIUS;
            self.vy = -self.vy;
        }

        if self.vx < 0.0 {
            if let Some((cx, cy)) = self.sweep_paddle(Side::Left, nx, ny, left_vel) {
                nx = cx;
                ny = cy;
            }
        } else if self.vx > 0.0 {
            if let Some((cx, cy)) = self.sweep_paddle(Side::Right, nx, ny, right_vel) {
                nx = cx;
                ny = cy;
            }
        }

        self.ball_x = nx;
        self.ball_y = ny;

        if self.ball_x < -BALL_RADIUS_X {
            self.serve();
            return Some(Side::Left);
        }
        if self.ball_x > FIELD + BALL_RADIUS_X {
            self.serve();
            return Some(Side::Right);
        }
        None
    }

    fn move_paddle(pos: &mut f64, dir: Direction) -> f64 {
        let before = *pos;
        match dir {
            Direction::None => {}
            Direction::Up => *pos = (*pos - PADDLE_SPEED).max(0.0),
            Direction::Down => *pos = (*pos + PADDLE_SPEED).min(PADDLE_TRAVEL),
        }
        *pos - before
    }

    /// Swept collision: did the leading edge of the ball cross this paddle's
    /// inner face during the tick? Interpolates Y at the crossing so a fast
    /// ball cannot tunnel through the paddle.
    fn sweep_paddle(
        &mut self,
        side: Side,
        nx: f64,
        ny: f64,
        paddle_vel: f64,
    ) -> Option<(f64, f64)> {
        let (line, paddle_y, out_sign) = match side {
            Side::Left => (PADDLE_LEFT_X, self.paddle_left, 1.0),
            Side::Right => (PADDLE_RIGHT_X, self.paddle_right, -1.0),
        };

        // leading edge positions before and after the move
        let prev_edge = self.prev_ball_x - out_sign * BALL_RADIUS_X;
        let new_edge = nx - out_sign * BALL_RADIUS_X;
        let crossed = match side {
            Side::Left => prev_edge >= line && new_edge < line,
            Side::Right => prev_edge <= line && new_edge > line,
        };
        if !crossed {
            return None;
        }

        let travel = prev_edge - new_edge;
        let t = if travel.abs() < f64::EPSILON {
            0.0
        } else {
            (prev_edge - line) / travel
        };
        let y_at = self.prev_ball_y + t.clamp(0.0, 1.0) * (ny - self.prev_ball_y);

        if y_at < paddle_y - HIT_TOLERANCE || y_at > paddle_y + PADDLE_HEIGHT + HIT_TOLERANCE {
            return None;
        }

        self.speed =
            (self.speed * 1.08 + paddle_vel.abs() * 0.4).clamp(INITIAL_BALL_SPEED, MAX_BALL_SPEED);

        let half_span = PADDLE_HEIGHT / 2.0 + HIT_TOLERANCE;
        let hit = ((y_at - (paddle_y + PADDLE_HEIGHT / 2.0)) / half_span).clamp(-1.0, 1.0);
        let angle = hit * BOUNCE_ANGLE * SPIN;

        self.vx = out_sign * self.speed * angle.cos() + self.rng.gen_range(-0.01..=0.01);
        self.vy = self.speed * angle.sin() + paddle_vel * 0.2 + self.rng.gen_range(-0.01..=0.01);

        // the ball must always leave the paddle with real horizontal pace
        if self.vx * out_sign < MIN_SPEED {
            self.vx = out_sign * INITIAL_BALL_SPEED;
        }

        Some((line + out_sign * BALL_RADIUS_X, y_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn physics(seed: u64) -> Physics {
        Physics::new(StdRng::seed_from_u64(seed))
    }

    #[test]
    fn same_seed_and_inputs_replay_identically() {
        let mut a = physics(17);
        let mut b = physics(17);
        a.set_direction(Side::Left, Direction::Down);
        b.set_direction(Side::Left, Direction::Down);

        for _ in 0..2_000 {
            let ga = a.step(true, true);
            let gb = b.step(true, true);
            assert_eq!(ga, gb);
        }
        assert_eq!(a.ball_x, b.ball_x);
        assert_eq!(a.ball_y, b.ball_y);
        assert_eq!(a.vx, b.vx);
        assert_eq!(a.vy, b.vy);
        assert_eq!(a.paddle_left, b.paddle_left);
    }

    #[test]
    fn ball_stays_inside_vertical_bounds() {
        let mut p = physics(3);
        for _ in 0..10_000 {
            p.step(true, true);
            assert!(p.ball_y >= BALL_RADIUS - 1e-9);
            assert!(p.ball_y <= FIELD - BALL_RADIUS + 1e-9);
        }
    }

    #[test]
    fn paddles_clamp_to_travel_range() {
        let mut p = physics(3);
        p.set_direction(Side::Left, Direction::Up);
        p.set_direction(Side::Right, Direction::Down);
        for _ in 0..200 {
            p.step(true, true);
        }
        assert_eq!(p.paddle_left, 0.0);
        assert_eq!(p.paddle_right, PADDLE_TRAVEL);
    }

    #[test]
    fn frozen_paddle_does_not_move() {
        let mut p = physics(3);
        p.set_direction(Side::Left, Direction::Down);
        let before = p.paddle_left;
        for _ in 0..50 {
            p.step(false, true);
        }
        assert_eq!(p.paddle_left, before);
    }

    #[test]
    fn hit_inside_tolerance_reflects() {
        let mut p = physics(5);
        // ball about to cross the left paddle face, aimed at the very edge of
        // the tolerance band
        p.paddle_left = 40.0;
        p.prev_ball_x = PADDLE_LEFT_X + BALL_RADIUS_X + 0.5;
        p.ball_x = p.prev_ball_x;
        p.ball_y = 40.0 - HIT_TOLERANCE + 0.1;
        p.prev_ball_y = p.ball_y;
        p.vx = -1.0;
        p.vy = 0.0;
        p.speed = 1.0;

        let goal = p.step(true, true);
        assert_eq!(goal, None);
        assert!(p.vx > 0.0, "ball should bounce back to the right");
        assert!(p.ball_x >= PADDLE_LEFT_X + BALL_RADIUS_X - 1e-9);
    }

    #[test]
    fn hit_outside_tolerance_passes_through() {
        let mut p = physics(5);
        p.paddle_left = 40.0;
        p.prev_ball_x = PADDLE_LEFT_X + BALL_RADIUS_X + 0.5;
        p.ball_x = p.prev_ball_x;
        p.ball_y = 40.0 - HIT_TOLERANCE - 2.0;
        p.prev_ball_y = p.ball_y;
        p.vx = -1.0;
        p.vy = 0.0;
        p.speed = 1.0;

        p.step(true, true);
        assert!(p.vx < 0.0, "ball should keep travelling toward the goal");
    }

    #[test]
    fn speed_is_capped_after_collision() {
        let mut p = physics(5);
        p.paddle_right = 40.0;
        p.prev_ball_x = PADDLE_RIGHT_X - BALL_RADIUS_X - 0.5;
        p.ball_x = p.prev_ball_x;
        p.ball_y = 45.0;
        p.prev_ball_y = p.ball_y;
        p.vx = 1.19;
        p.vy = 0.0;
        p.speed = 1.19;
        p.set_direction(Side::Right, Direction::Down);

        p.step(true, true);
        assert!(p.speed <= MAX_BALL_SPEED + 1e-9);
        assert!(p.speed >= INITIAL_BALL_SPEED);
    }

    #[test]
    fn crossing_a_goal_line_reserves_from_center() {
        let mut p = physics(9);
        p.prev_ball_x = 1.0;
        p.ball_x = 1.0;
        p.ball_y = 80.0;
        p.prev_ball_y = 80.0;
        p.paddle_left = 0.0; // far away from the ball's path
        p.vx = -1.0;
        p.vy = 0.0;
        p.speed = 1.0;

        let mut goal = None;
        for _ in 0..10 {
            goal = p.step(true, true);
            if goal.is_some() {
                break;
            }
        }
        assert_eq!(goal, Some(Side::Left));
        assert_eq!(p.ball_x, FIELD / 2.0);
        assert_eq!(p.ball_y, FIELD / 2.0);
        assert!((p.vx * p.vx + p.vy * p.vy).sqrt() <= INITIAL_BALL_SPEED + 1e-9);
    }

    #[test]
    fn serves_stay_inside_the_angle_cone() {
        for seed in 0..50 {
            let p = physics(seed);
            assert!(p.vx.abs() > 0.0);
            let slope = (p.vy / p.vx).abs();
            assert!(slope <= SERVE_ANGLE.tan() + 1e-9);
        }
    }
}
