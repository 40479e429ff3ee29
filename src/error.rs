//! Failure taxonomy for the match pipeline.
//!
//! Two layers: [`MatchFault`] classifies what went wrong inside a single
//! execution (it ends up on the match row as `error_kind`), and
//! [`EngineError`] covers the coordination failures the orchestrator and
//! workers surface to their callers. Plumbing errors with no policy
//! attached stay `anyhow::Error` with context, as everywhere else in the
//! crate.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified failure of one match execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchFault {
    /// The referee ran past the wall-clock deadline.
    Timeout,
    /// The sandbox killed the process group for exceeding its memory cap.
    Oom,
    /// Program 1 crashed, as attributed by the referee.
    Crash1,
    /// Program 2 crashed, as attributed by the referee.
    Crash2,
    /// The referee exited zero but its final line was not a result line.
    Protocol,
    /// Infrastructure fault (sandbox refused to start, stdio lost, ...).
    Internal,
}

impl MatchFault {
    /// Transient faults are retried with backoff; the rest are terminal
    /// for the match. Crashes and protocol violations do not improve on
    /// retry.
    pub fn is_transient(self) -> bool {
        matches!(self, MatchFault::Timeout | MatchFault::Internal)
    }

    /// Name as stored/logged (`snake_case`, same as the serde form).
    pub fn as_str(self) -> &'static str {
        match self {
            MatchFault::Timeout => "timeout",
            MatchFault::Oom => "oom",
            MatchFault::Crash1 => "crash1",
            MatchFault::Crash2 => "crash2",
            MatchFault::Protocol => "protocol",
            MatchFault::Internal => "internal",
        }
    }
}

impl std::fmt::Display for MatchFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coordination failures surfaced across component boundaries.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A required lock stayed contended past the caller's wait budget.
    #[error("lock '{name}' not acquired within {waited:?}")]
    LockTimeout {
        /// Lock name.
        name: String,
        /// How long the caller was willing to block.
        waited: Duration,
    },

    /// The queue backend rejected or lost the operation.
    #[error("queue backend unavailable: {0}")]
    QueueUnavailable(String),

    /// A version-guarded write kept losing to concurrent writers.
    #[error("version conflict updating {entity} (gave up after {attempts} attempts)")]
    VersionConflict {
        /// Which table.
        entity: &'static str,
        /// Retries spent before giving up.
        attempts: u32,
    },

    /// A row the operation depends on does not exist.
    #[error("{entity} not found")]
    NotFound {
        /// Which table.
        entity: &'static str,
    },

    /// The pairing uniqueness constraint rejected an insert.
    #[error("duplicate match for pairing")]
    DuplicateMatch,

    /// `join_team` hit the tournament's cap.
    #[error("tournament is at team capacity")]
    TournamentFull,

    /// A round transition found the round in the wrong state.
    #[error("round is {actual:?}, expected {expected:?}")]
    RoundState {
        /// What the operation required.
        expected: crate::model::RoundStatus,
        /// What the store held.
        actual: crate::model::RoundStatus,
    },

    /// The engine is draining; no new work is accepted.
    #[error("engine is shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_split_matches_retry_policy() {
        assert!(MatchFault::Timeout.is_transient());
        assert!(MatchFault::Internal.is_transient());
        assert!(!MatchFault::Oom.is_transient());
        assert!(!MatchFault::Crash1.is_transient());
        assert!(!MatchFault::Crash2.is_transient());
        assert!(!MatchFault::Protocol.is_transient());
    }

    #[test]
    fn fault_serializes_snake_case() {
        let json = serde_json::to_string(&MatchFault::Crash2).unwrap();
        assert_eq!(json, "\"crash2\"");
    }
}
