//! Outcome ingestion: exactly-once match updates, ELO application, round
//! bookkeeping, post-commit broadcast.
//!
//! [`Recorder::record_outcome`] is safe under concurrent calls for the
//! same match and under the duplicate deliveries the queue's reservation
//! timeout can produce. The match row's version guard is the commit
//! point: whichever caller flips the row to its terminal state applies
//! the rating and round effects, every other caller short-circuits with
//! `applied = false`.
//!
//! Events go out only after the writes land; a failed publish is logged
//! and never rolls anything back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use tracing::{error, info, instrument};

use crate::broadcast::{round_topic, tournament_topic, Broadcaster, Event};
use crate::error::EngineError;
use crate::model::{
    GameId, MatchId, MatchRow, MatchStatus, Outcome, Rating, TeamId, TournamentId,
};
use crate::rating;
use crate::store::Store;

/// Bounded retries for every version-guarded write.
const VERSION_RETRIES: u32 = 3;

/// Leaderboard memo lifetime.
const LEADERBOARD_TTL: Duration = Duration::from_secs(30);

/// One leaderboard line, rating-sorted.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaderboardRow {
    /// Rated team.
    pub team_id: TeamId,
    /// Current ELO value.
    pub rating: f64,
    /// Completed matches won.
    pub wins: u32,
    /// Completed matches lost.
    pub losses: u32,
    /// Completed matches drawn.
    pub draws: u32,
    /// Total completed matches.
    pub games: u32,
}

struct MemoEntry {
    generation: u64,
    built_at: Instant,
    rows: Vec<LeaderboardRow>,
}

/// Match cache and rating store front.
pub struct Recorder {
    store: Arc<dyn Store>,
    broadcaster: Arc<Broadcaster>,
    /// Bumped on every applied rating update; memo entries built under an
    /// older generation are stale regardless of age.
    rating_generation: AtomicU64,
    leaderboards: Mutex<HashMap<(TournamentId, GameId), MemoEntry>>,
}

impl Recorder {
    /// Wire the recorder over its store and event hub.
    pub fn new(store: Arc<dyn Store>, broadcaster: Arc<Broadcaster>) -> Self {
        Recorder {
            store,
            broadcaster,
            rating_generation: AtomicU64::new(0),
            leaderboards: Mutex::new(HashMap::new()),
        }
    }

    /// Apply `outcome` to the match. Returns whether this call was the
    /// one that took the row to its terminal state.
    #[instrument(skip_all, fields(match_id = %match_id))]
    pub fn record_outcome(
        &self,
        match_id: MatchId,
        outcome: &Outcome,
    ) -> Result<bool, EngineError> {
        let committed = match self.commit_match_row(match_id, outcome)? {
            Some(row) => row,
            None => return Ok(false),
        };

        let ratings_after = if committed.status == MatchStatus::Completed {
            self.apply_ratings(&committed)?
        } else {
            None
        };

        self.advance_round_counts(&committed)?;
        self.publish(&committed, ratings_after);
        Ok(true)
    }

    /// Rating-sorted standings for one (tournament, game), memoized for
    /// 30 s and invalidated by any rating update in between.
    pub fn leaderboard(
        &self,
        tournament_id: TournamentId,
        game_id: GameId,
    ) -> Vec<LeaderboardRow> {
        let generation = self.rating_generation.load(Ordering::Acquire);
        let key = (tournament_id, game_id);
        {
            let memo = self.leaderboards.lock().expect("poisoned");
            if let Some(entry) = memo.get(&key) {
                if entry.generation == generation && entry.built_at.elapsed() < LEADERBOARD_TTL {
                    return entry.rows.clone();
                }
            }
        }

        let mut rows: Vec<LeaderboardRow> = self
            .store
            .ratings(tournament_id, game_id)
            .into_iter()
            .map(|r| LeaderboardRow {
                team_id: r.team_id,
                rating: r.rating,
                wins: r.wins,
                losses: r.losses,
                draws: r.draws,
                games: r.games,
            })
            .collect();
        rows.sort_by(|a, b| {
            b.rating
                .partial_cmp(&a.rating)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.team_id.cmp(&b.team_id))
        });

        self.leaderboards.lock().expect("poisoned").insert(
            key,
            MemoEntry {
                generation,
                built_at: Instant::now(),
                rows: rows.clone(),
            },
        );
        rows
    }

    /// Flip the match row to its terminal state under the version guard.
    /// `Ok(None)` means someone else already did (idempotent path).
    fn commit_match_row(
        &self,
        match_id: MatchId,
        outcome: &Outcome,
    ) -> Result<Option<MatchRow>, EngineError> {
        for _ in 0..VERSION_RETRIES {
            let row = self
                .store
                .match_row(match_id)
                .ok_or(EngineError::NotFound { entity: "match" })?;
            if row.status.is_terminal() {
                return Ok(None);
            }
            let mut next = row;
            match outcome {
                Outcome::Scored {
                    score1,
                    score2,
                    winner,
                } => {
                    next.score1 = Some(*score1);
                    next.score2 = Some(*score2);
                    next.winner = Some(*winner);
                    next.error_kind = None;
                    next.status = MatchStatus::Completed;
                }
                Outcome::Fault(fault) => {
                    next.error_kind = Some(*fault);
                    next.status = MatchStatus::Failed;
                }
            }
            next.completed_at = Some(SystemTime::now());
            if self.store.update_match_guarded(&next) {
                next.version += 1;
                info!(status = ?next.status, "match committed");
                return Ok(Some(next));
            }
        }
        Err(EngineError::VersionConflict {
            entity: "match",
            attempts: VERSION_RETRIES,
        })
    }

    fn apply_ratings(
        &self,
        row: &MatchRow,
    ) -> Result<Option<Vec<(TeamId, f64)>>, EngineError> {
        let winner = row.winner.expect("completed match has a winner");
        let team1 = self.team_of(row.program1_id)?;
        let team2 = self.team_of(row.program2_id)?;

        for _ in 0..VERSION_RETRIES {
            let mut a = self
                .store
                .rating(team1, row.game_id, row.tournament_id)
                .unwrap_or_else(|| Rating::new(team1, row.game_id, row.tournament_id));
            let mut b = self
                .store
                .rating(team2, row.game_id, row.tournament_id)
                .unwrap_or_else(|| Rating::new(team2, row.game_id, row.tournament_id));
            rating::apply_match(&mut a, &mut b, winner);
            if self.store.apply_rating_pair(&a, &b) {
                self.rating_generation.fetch_add(1, Ordering::Release);
                return Ok(Some(vec![(team1, a.rating), (team2, b.rating)]));
            }
        }
        Err(EngineError::VersionConflict {
            entity: "rating",
            attempts: VERSION_RETRIES,
        })
    }

    fn advance_round_counts(&self, row: &MatchRow) -> Result<(), EngineError> {
        for _ in 0..VERSION_RETRIES {
            let Some(mut state) =
                self.store
                    .round_state(row.tournament_id, row.game_id, row.round_number)
            else {
                // A match without its round row is a bug upstream, but the
                // outcome itself is already safe.
                error!(
                    round = row.round_number,
                    "round state missing while recording outcome"
                );
                return Ok(());
            };
            match row.status {
                MatchStatus::Completed => state.completed_count += 1,
                MatchStatus::Failed => state.failed_count += 1,
                _ => unreachable!("only terminal rows reach round bookkeeping"),
            }
            if self.store.update_round_guarded(&state) {
                return Ok(());
            }
        }
        Err(EngineError::VersionConflict {
            entity: "round_state",
            attempts: VERSION_RETRIES,
        })
    }

    fn publish(&self, row: &MatchRow, ratings_after: Option<Vec<(TeamId, f64)>>) {
        let event = Event::MatchCompleted {
            match_id: row.id,
            tournament_id: row.tournament_id,
            game_id: row.game_id,
            winner: row.winner,
            score1: row.score1.unwrap_or(0),
            score2: row.score2.unwrap_or(0),
        };
        self.broadcaster
            .publish(&round_topic(row.tournament_id, row.game_id), &event);
        self.broadcaster
            .publish(&tournament_topic(row.tournament_id), &event);

        if let Some(ratings_after) = ratings_after {
            let event = Event::LeaderboardUpdate {
                tournament_id: row.tournament_id,
                game_id: row.game_id,
                ratings_after,
            };
            self.broadcaster
                .publish(&tournament_topic(row.tournament_id), &event);
        }
    }

    fn team_of(&self, program_id: crate::model::ProgramId) -> Result<TeamId, EngineError> {
        self.store
            .program(program_id)
            .map(|p| p.team_id)
            .ok_or(EngineError::NotFound { entity: "program" })
    }
}
