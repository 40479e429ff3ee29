//! ELO arithmetic.
//!
//! Pure functions; persistence and concurrency live in the store and the
//! recorder. Draws count as half a win for both sides. The K-factor drops
//! from 32 to 16 once a team has 30 games on record, so established
//! ratings move more slowly.

use crate::model::{Rating, Winner};

/// Every (team, game, tournament) starts here.
pub const INITIAL_RATING: f64 = 1500.0;

const K_PROVISIONAL: f64 = 32.0;
const K_ESTABLISHED: f64 = 16.0;
const PROVISIONAL_GAMES: u32 = 30;

/// Expected score of a player rated `r_a` against one rated `r_b`.
pub fn expected_score(r_a: f64, r_b: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((r_b - r_a) / 400.0))
}

/// K-factor based on games played so far.
pub fn k_factor(games: u32) -> f64 {
    if games < PROVISIONAL_GAMES {
        K_PROVISIONAL
    } else {
        K_ESTABLISHED
    }
}

/// Actual scores (S) for both sides given the winner.
pub fn actual_scores(winner: Winner) -> (f64, f64) {
    match winner {
        Winner::Player1 => (1.0, 0.0),
        Winner::Player2 => (0.0, 1.0),
        Winner::Draw => (0.5, 0.5),
    }
}

/// Apply one completed match to both rating rows in place.
///
/// Updates rating, win/loss/draw tallies and the game counts. The deltas
/// are symmetric whenever both K-factors are equal.
pub fn apply_match(a: &mut Rating, b: &mut Rating, winner: Winner) {
    let (s_a, s_b) = actual_scores(winner);
    let e_a = expected_score(a.rating, b.rating);
    let e_b = expected_score(b.rating, a.rating);

    a.rating += k_factor(a.games) * (s_a - e_a);
    b.rating += k_factor(b.games) * (s_b - e_b);

    match winner {
        Winner::Player1 => {
            a.wins += 1;
            b.losses += 1;
        }
        Winner::Player2 => {
            a.losses += 1;
            b.wins += 1;
        }
        Winner::Draw => {
            a.draws += 1;
            b.draws += 1;
        }
    }
    a.games += 1;
    b.games += 1;
}
