//! Round lifecycle: pending → running → completed.
//!
//! Schedule transitions are guarded twice: a distributed lock keeps
//! concurrent orchestrator calls (across processes) out of the critical
//! section, and optimistic version checks keep a crashed-and-recovered
//! holder from overwriting state it read before losing the lock.
//!
//! Enqueueing is not transactional with the store: a failed `start_round`
//! can leave a round pending with some matches already queued. Retrying
//! the call converges, because match insertion deduplicates on the
//! pairing key and double-delivered descriptors die on the recorder's
//! idempotence.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::broadcast::{round_topic, tournament_topic, Broadcaster, Event};
use crate::error::EngineError;
use crate::lock::{LockStore, LockToken};
use crate::model::{
    GameId, MatchDescriptor, MatchRow, MatchStatus, Priority, RoundState, RoundStatus,
    TournamentId,
};
use crate::queue::MatchQueue;
use crate::schedule;
use crate::store::Store;

/// TTL for schedule-transition locks; generous against the worst-case
/// critical section (schedule insert + enqueue of a full round).
const ROUND_LOCK_TTL: Duration = Duration::from_secs(30);

/// TTL for the team-join lock; the section is a read-check-write.
const TEAMS_LOCK_TTL: Duration = Duration::from_secs(10);

const VERSION_RETRIES: u32 = 3;

fn round_lock(t: TournamentId, g: GameId) -> String {
    format!("round:{t}:{g}")
}

fn teams_lock(t: TournamentId) -> String {
    format!("tournament:{t}:teams")
}

/// Drives round state for every (tournament, game).
pub struct RoundOrchestrator {
    store: Arc<dyn Store>,
    queue: Arc<dyn MatchQueue>,
    locks: Arc<dyn LockStore>,
    broadcaster: Arc<Broadcaster>,
    max_attempts: u32,
    lock_wait: Duration,
}

/// Releases on drop so an error path cannot leak the lock for a full TTL.
struct HeldLock<'a> {
    locks: &'a dyn LockStore,
    name: String,
    token: Option<LockToken>,
}

impl<'a> HeldLock<'a> {
    fn acquire(
        locks: &'a dyn LockStore,
        name: String,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Self, EngineError> {
        let token = locks.acquire(&name, ttl, wait)?;
        Ok(HeldLock {
            locks,
            name,
            token: Some(token),
        })
    }
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if !self.locks.release(&self.name, &token) {
                warn!(lock = %self.name, "lock expired before release");
            }
        }
    }
}

impl RoundOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn MatchQueue>,
        locks: Arc<dyn LockStore>,
        broadcaster: Arc<Broadcaster>,
        max_attempts: u32,
        lock_wait: Duration,
    ) -> Self {
        RoundOrchestrator {
            store,
            queue,
            locks,
            broadcaster,
            max_attempts,
            lock_wait,
        }
    }

    /// Generate and enqueue one round. Returns how many matches were
    /// queued; zero means the round completed immediately for lack of
    /// opponents.
    #[instrument(skip(self))]
    pub fn start_round(
        &self,
        tournament_id: TournamentId,
        game_id: GameId,
        round_number: u32,
        iterations: u32,
    ) -> Result<u32, EngineError> {
        let _lock = HeldLock::acquire(
            self.locks.as_ref(),
            round_lock(tournament_id, game_id),
            ROUND_LOCK_TTL,
            self.lock_wait,
        )?;

        if let Some(existing) = self.store.round_state(tournament_id, game_id, round_number) {
            if existing.status != RoundStatus::Pending {
                return Err(EngineError::RoundState {
                    expected: RoundStatus::Pending,
                    actual: existing.status,
                });
            }
        }

        let matches = schedule::generate(self.store.as_ref(), tournament_id, game_id, round_number);
        if matches.is_empty() {
            self.store.insert_round(
                &[],
                RoundState::new(tournament_id, game_id, round_number, 0),
            )?;
            self.transition_round(tournament_id, game_id, round_number, RoundStatus::Completed)?;
            self.broadcast_round_completed(tournament_id, game_id, round_number);
            info!("round completed empty");
            return Ok(0);
        }

        let total = matches.len() as u32;
        self.store.insert_round(
            &matches,
            RoundState::new(tournament_id, game_id, round_number, total),
        )?;

        let mut enqueued = 0;
        for m in self
            .store
            .matches_for_round(tournament_id, game_id, round_number)
        {
            if m.status != MatchStatus::Pending {
                continue;
            }
            self.queue
                .enqueue(descriptor_for(&m, iterations, Priority::Medium))?;
            enqueued += 1;
        }

        self.transition_round(tournament_id, game_id, round_number, RoundStatus::Running)?;
        info!(enqueued, "round started");
        Ok(enqueued)
    }

    /// Admit one more team, guarded against concurrent joins overshooting
    /// the cap. Returns the new participant count.
    #[instrument(skip(self))]
    pub fn join_team(&self, tournament_id: TournamentId) -> Result<u32, EngineError> {
        let _lock = HeldLock::acquire(
            self.locks.as_ref(),
            teams_lock(tournament_id),
            TEAMS_LOCK_TTL,
            self.lock_wait,
        )?;

        for _ in 0..VERSION_RETRIES {
            let tournament = self
                .store
                .tournament(tournament_id)
                .ok_or(EngineError::NotFound { entity: "tournament" })?;
            if tournament.team_count >= tournament.team_cap {
                return Err(EngineError::TournamentFull);
            }
            let mut next = tournament;
            next.team_count += 1;
            if self.store.update_tournament_guarded(&next) {
                return Ok(next.team_count);
            }
        }
        Err(EngineError::VersionConflict {
            entity: "tournament",
            attempts: VERSION_RETRIES,
        })
    }

    /// Re-enqueue failed matches that still have retry budget, at LOW
    /// priority. Admin-triggered. Returns how many went back out.
    #[instrument(skip(self))]
    pub fn retry_failed(
        &self,
        tournament_id: TournamentId,
        game_id: GameId,
        round_number: u32,
        iterations: u32,
    ) -> Result<u32, EngineError> {
        let _lock = HeldLock::acquire(
            self.locks.as_ref(),
            round_lock(tournament_id, game_id),
            ROUND_LOCK_TTL,
            self.lock_wait,
        )?;

        let mut reopened = 0;
        for m in self
            .store
            .matches_for_round(tournament_id, game_id, round_number)
        {
            if m.status != MatchStatus::Failed || m.attempt_count >= self.max_attempts {
                continue;
            }
            // Queue first: a descriptor for a still-failed row is skipped
            // by the worker, while a reopened row with no descriptor
            // would hang the round.
            self.queue
                .enqueue(descriptor_for(&m, iterations, Priority::Low))?;
            let mut next = m.clone();
            next.status = MatchStatus::Pending;
            next.error_kind = None;
            next.winner = None;
            next.score1 = None;
            next.score2 = None;
            next.completed_at = None;
            if self.store.update_match_guarded(&next) {
                reopened += 1;
            } else {
                warn!(match_id = %m.id, "failed match moved during retry, skipping");
            }
        }

        if reopened > 0 {
            for _ in 0..VERSION_RETRIES {
                let Some(state) =
                    self.store
                        .round_state(tournament_id, game_id, round_number)
                else {
                    break;
                };
                let mut next = state;
                next.failed_count = next.failed_count.saturating_sub(reopened);
                if next.status == RoundStatus::Completed {
                    next.status = RoundStatus::Running;
                }
                if self.store.update_round_guarded(&next) {
                    break;
                }
            }
        }
        info!(reopened, "failed matches re-enqueued");
        Ok(reopened)
    }

    /// Called by workers after each recorded outcome; flips the round to
    /// completed once every match is terminal. Optimistic, lock-free: the
    /// version guard arbitrates racing workers.
    pub fn maybe_complete_round(
        &self,
        tournament_id: TournamentId,
        game_id: GameId,
        round_number: u32,
    ) -> Result<bool, EngineError> {
        let Some(state) = self.store.round_state(tournament_id, game_id, round_number) else {
            return Ok(false);
        };
        if state.status != RoundStatus::Running || !state.is_drained() {
            return Ok(false);
        }
        let mut next = state;
        next.status = RoundStatus::Completed;
        if !self.store.update_round_guarded(&next) {
            return Ok(false);
        }
        info!(
            tournament_id,
            game_id, round_number, "round completed"
        );
        self.broadcast_round_completed(tournament_id, game_id, round_number);
        Ok(true)
    }

    fn transition_round(
        &self,
        tournament_id: TournamentId,
        game_id: GameId,
        round_number: u32,
        to: RoundStatus,
    ) -> Result<(), EngineError> {
        for _ in 0..VERSION_RETRIES {
            let state = self
                .store
                .round_state(tournament_id, game_id, round_number)
                .ok_or(EngineError::NotFound { entity: "round" })?;
            if state.status == to {
                return Ok(());
            }
            let mut next = state;
            next.status = to;
            if self.store.update_round_guarded(&next) {
                return Ok(());
            }
        }
        Err(EngineError::VersionConflict {
            entity: "round_state",
            attempts: VERSION_RETRIES,
        })
    }

    fn broadcast_round_completed(
        &self,
        tournament_id: TournamentId,
        game_id: GameId,
        round_number: u32,
    ) {
        let state = self.store.round_state(tournament_id, game_id, round_number);
        let (completed, failed) = state
            .map(|s| (s.completed_count, s.failed_count))
            .unwrap_or((0, 0));
        let event = Event::RoundCompleted {
            tournament_id,
            game_id,
            round_number,
            completed,
            failed,
        };
        self.broadcaster
            .publish(&round_topic(tournament_id, game_id), &event);
        self.broadcaster
            .publish(&tournament_topic(tournament_id), &event);
    }
}

/// Build the queue descriptor for a match row.
pub(crate) fn descriptor_for(m: &MatchRow, iterations: u32, priority: Priority) -> MatchDescriptor {
    MatchDescriptor {
        match_id: m.id,
        tournament_id: m.tournament_id,
        game_id: m.game_id,
        program1_id: m.program1_id,
        program2_id: m.program2_id,
        iterations,
        priority,
        attempt_count: m.attempt_count,
    }
}
