//! Entities persisted by the engine and the wire types that cross its
//! boundaries.
//!
//! Identifiers for tournaments, games, teams and programs are allocated by
//! the upload/CRUD layer and opaque to the engine. Matches are created here,
//! so they carry engine-allocated UUIDs.
//!
//! Every mutable row carries a `version` counter. Mutations go through the
//! store's guarded updates: the writer passes back the version it read, the
//! store rejects the write if the row moved underneath it.

use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MatchFault;

/// Tournament identifier, allocated by the CRUD layer.
pub type TournamentId = u64;
/// Game identifier (one per referee binary deployed).
pub type GameId = u64;
/// Team identifier.
pub type TeamId = u64;
/// Program (bot upload) identifier.
pub type ProgramId = u64;
/// Match identifier.
pub type MatchId = Uuid;

/// An uploaded bot bundle owned by a team, tied to one (tournament, game).
///
/// Immutable after upload except for `language` and the monotonic `version`.
/// Never deleted once it has appeared in a match.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    /// Upload identity.
    pub id: ProgramId,
    /// Owning team.
    pub team_id: TeamId,
    /// Tournament this upload competes in.
    pub tournament_id: TournamentId,
    /// Game this upload plays.
    pub game_id: GameId,
    /// Where the upload layer stored the executable bundle.
    pub storage_path: PathBuf,
    /// Language tag, mutable after upload.
    pub language: String,
    /// Monotonic upload counter per (team, tournament, game).
    pub version: u32,
}

/// Tournament row, as far as the engine cares: the team capacity that
/// `join_team` enforces under its lock.
#[derive(Debug, Clone, PartialEq)]
pub struct Tournament {
    /// Tournament identity.
    pub id: TournamentId,
    /// Maximum admitted teams.
    pub team_cap: u32,
    /// Teams admitted so far.
    pub team_count: u32,
    /// Optimistic concurrency counter.
    pub version: u64,
}

/// Lifecycle of a match row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Created, waiting in the queue.
    Pending,
    /// Claimed by a worker.
    Running,
    /// Finished with scores and a winner.
    Completed,
    /// Finished with an error kind; ratings untouched.
    Failed,
}

impl MatchStatus {
    /// Completed and failed rows never transition again (the admin
    /// retry path resets failed rows explicitly, see the orchestrator).
    pub fn is_terminal(self) -> bool {
        matches!(self, MatchStatus::Completed | MatchStatus::Failed)
    }
}

/// Who won a completed match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    /// Program 1 won.
    Player1,
    /// Program 2 won.
    Player2,
    /// Neither side won.
    Draw,
}

/// The atomic unit of execution.
///
/// `(tournament_id, game_id, program1_id, program2_id, round_number)` is
/// unique; the store rejects duplicate inserts, which is what makes
/// schedule generation safe to retry.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRow {
    /// Match identity.
    pub id: MatchId,
    /// Tournament scope.
    pub tournament_id: TournamentId,
    /// Game scope.
    pub game_id: GameId,
    /// The program playing side 1.
    pub program1_id: ProgramId,
    /// The program playing side 2.
    pub program2_id: ProgramId,
    /// Round this pairing belongs to.
    pub round_number: u32,
    /// Lifecycle state.
    pub status: MatchStatus,
    /// Side 1 score, set on completion.
    pub score1: Option<i64>,
    /// Side 2 score, set on completion.
    pub score2: Option<i64>,
    /// Set iff the match completed.
    pub winner: Option<Winner>,
    /// Set iff the match failed.
    pub error_kind: Option<MatchFault>,
    /// When a worker last claimed the match.
    pub started_at: Option<SystemTime>,
    /// When the match reached its terminal state.
    pub completed_at: Option<SystemTime>,
    /// Execution attempts spent so far.
    pub attempt_count: u32,
    /// Optimistic concurrency counter.
    pub version: u64,
}

impl MatchRow {
    /// A fresh pending match for round `round_number`.
    pub fn new(
        tournament_id: TournamentId,
        game_id: GameId,
        program1_id: ProgramId,
        program2_id: ProgramId,
        round_number: u32,
    ) -> Self {
        MatchRow {
            id: Uuid::new_v4(),
            tournament_id,
            game_id,
            program1_id,
            program2_id,
            round_number,
            status: MatchStatus::Pending,
            score1: None,
            score2: None,
            winner: None,
            error_kind: None,
            started_at: None,
            completed_at: None,
            attempt_count: 0,
            version: 0,
        }
    }

    /// The uniqueness key of the row.
    pub fn pairing_key(&self) -> (TournamentId, GameId, ProgramId, ProgramId, u32) {
        (
            self.tournament_id,
            self.game_id,
            self.program1_id,
            self.program2_id,
            self.round_number,
        )
    }
}

/// Lifecycle of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    /// Created, matches not yet enqueued.
    Pending,
    /// Matches are queued or executing.
    Running,
    /// Every match reached a terminal state.
    Completed,
}

/// Progress of all matches belonging to one (tournament, game, round).
///
/// Invariant: `total_matches = completed_count + failed_count` plus the
/// number of rows still pending or running.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundState {
    /// Tournament scope.
    pub tournament_id: TournamentId,
    /// Game scope.
    pub game_id: GameId,
    /// Which round this row aggregates.
    pub round_number: u32,
    /// Lifecycle state.
    pub status: RoundStatus,
    /// Matches generated for the round.
    pub total_matches: u32,
    /// Matches that completed.
    pub completed_count: u32,
    /// Matches that failed terminally.
    pub failed_count: u32,
    /// Optimistic concurrency counter.
    pub version: u64,
}

impl RoundState {
    /// A fresh pending round expecting `total` matches.
    pub fn new(tournament_id: TournamentId, game_id: GameId, round_number: u32, total: u32) -> Self {
        RoundState {
            tournament_id,
            game_id,
            round_number,
            status: RoundStatus::Pending,
            total_matches: total,
            completed_count: 0,
            failed_count: 0,
            version: 0,
        }
    }

    /// Every match reached a terminal state.
    pub fn is_drained(&self) -> bool {
        self.completed_count + self.failed_count == self.total_matches
    }
}

/// ELO record per (team, game, tournament). Created on first completed
/// match with [`crate::rating::INITIAL_RATING`].
#[derive(Debug, Clone, PartialEq)]
pub struct Rating {
    /// Rated team.
    pub team_id: TeamId,
    /// Game scope.
    pub game_id: GameId,
    /// Tournament scope.
    pub tournament_id: TournamentId,
    /// Current ELO value.
    pub rating: f64,
    /// Completed matches won.
    pub wins: u32,
    /// Completed matches lost.
    pub losses: u32,
    /// Completed matches drawn.
    pub draws: u32,
    /// Total completed matches; always `wins + losses + draws`.
    pub games: u32,
    /// Optimistic concurrency counter.
    pub version: u64,
}

impl Rating {
    /// A fresh rating row at the initial value.
    pub fn new(team_id: TeamId, game_id: GameId, tournament_id: TournamentId) -> Self {
        Rating {
            team_id,
            game_id,
            tournament_id,
            rating: crate::rating::INITIAL_RATING,
            wins: 0,
            losses: 0,
            draws: 0,
            games: 0,
            version: 0,
        }
    }
}

/// Queue lanes, drained in this order subject to the anti-starvation
/// budget in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    /// Drained first.
    High,
    /// Fresh rounds enqueue here.
    Medium,
    /// Retries and admin re-runs.
    Low,
}

impl Priority {
    /// All lanes in drain order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];
}

/// The JSON descriptor that travels through the queue. Field order is not
/// part of the contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchDescriptor {
    /// The match to execute.
    pub match_id: MatchId,
    /// Tournament scope.
    pub tournament_id: TournamentId,
    /// Selects the referee binary.
    pub game_id: GameId,
    /// Side 1 program.
    pub program1_id: ProgramId,
    /// Side 2 program.
    pub program2_id: ProgramId,
    /// Game length handed to the referee.
    pub iterations: u32,
    /// Current lane.
    pub priority: Priority,
    /// Deliveries already spent on this match.
    pub attempt_count: u32,
}

/// What a finished execution reports back: a parsed result line, or a
/// classified failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The referee produced a result line.
    Scored {
        /// Side 1 score.
        score1: i64,
        /// Side 2 score.
        score2: i64,
        /// Who won.
        winner: Winner,
    },
    /// The execution failed; see the fault for how.
    Fault(MatchFault),
}
