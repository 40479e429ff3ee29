//! Persistent state boundary: programs, tournaments, matches, round
//! states, ratings.
//!
//! Every mutation is optimistic: the caller passes back the row it read
//! (with the `version` it saw) and the store applies the write only if the
//! stored version still matches, bumping it by one. Callers retry a small,
//! bounded number of times on conflict. Insertions of match batches
//! enforce the pairing uniqueness constraint, which is what makes schedule
//! generation idempotent under retry.
//!
//! The default [`MemoryStore`] keeps the tables under one mutex, so each
//! operation is atomic. A relational backend implements the same trait
//! with the tables of the persisted-state layout, wrapping the recorder's
//! write sequence in a database transaction.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::EngineError;
use crate::model::{
    GameId, MatchId, MatchRow, Program, ProgramId, Rating, RoundState, TeamId, Tournament,
    TournamentId,
};

/// Repository contract shared by workers, the recorder and the
/// orchestrator.
pub trait Store: Send + Sync {
    /// Register an uploaded program (the upload layer's write path).
    fn insert_program(&self, program: Program) -> Result<(), EngineError>;
    /// Look up one program.
    fn program(&self, id: ProgramId) -> Option<Program>;
    /// All programs of one (tournament, game).
    fn programs(&self, tournament_id: TournamentId, game_id: GameId) -> Vec<Program>;

    /// Create or replace a tournament row (CRUD-layer write path).
    fn upsert_tournament(&self, tournament: Tournament);
    /// Look up one tournament.
    fn tournament(&self, id: TournamentId) -> Option<Tournament>;
    /// Version-guarded write; true iff the stored version matched.
    fn update_tournament_guarded(&self, tournament: &Tournament) -> bool;

    /// Insert a generated round: its matches and its round-state row, in
    /// one step. Matches whose pairing already exists are skipped, and an
    /// existing round-state row is kept, so a retried call converges.
    /// Returns the number of matches actually inserted.
    fn insert_round(&self, matches: &[MatchRow], round: RoundState) -> Result<usize, EngineError>;

    /// Look up one match.
    fn match_row(&self, id: MatchId) -> Option<MatchRow>;
    /// All matches of one round.
    fn matches_for_round(
        &self,
        tournament_id: TournamentId,
        game_id: GameId,
        round_number: u32,
    ) -> Vec<MatchRow>;
    /// Version-guarded write; true iff the stored version matched.
    fn update_match_guarded(&self, row: &MatchRow) -> bool;

    /// Look up one round-state row.
    fn round_state(
        &self,
        tournament_id: TournamentId,
        game_id: GameId,
        round_number: u32,
    ) -> Option<RoundState>;
    /// Version-guarded write; true iff the stored version matched.
    fn update_round_guarded(&self, state: &RoundState) -> bool;

    /// Look up one rating row.
    fn rating(
        &self,
        team_id: TeamId,
        game_id: GameId,
        tournament_id: TournamentId,
    ) -> Option<Rating>;
    /// Version-guarded upsert: a row with `version == 0` inserts if (and
    /// only if) no row exists yet; otherwise the stored version must
    /// match. True iff applied.
    fn update_rating_guarded(&self, rating: &Rating) -> bool;
    /// Both-or-neither write of the two sides of a completed match, each
    /// side under its own version guard. This is the recorder's
    /// transaction boundary; a relational backend wraps it in one
    /// database transaction.
    fn apply_rating_pair(&self, a: &Rating, b: &Rating) -> bool;
    /// All rating rows of one (tournament, game).
    fn ratings(&self, tournament_id: TournamentId, game_id: GameId) -> Vec<Rating>;
}

type PairingKey = (TournamentId, GameId, ProgramId, ProgramId, u32);
type RoundKey = (TournamentId, GameId, u32);
type RatingKey = (TeamId, GameId, TournamentId);

#[derive(Default)]
struct Tables {
    programs: HashMap<ProgramId, Program>,
    tournaments: HashMap<TournamentId, Tournament>,
    matches: HashMap<MatchId, MatchRow>,
    pairings: HashMap<PairingKey, MatchId>,
    rounds: HashMap<RoundKey, RoundState>,
    ratings: HashMap<RatingKey, Rating>,
}

/// In-process [`Store`]; one mutex over all tables makes every operation
/// atomic with respect to the others.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn insert_program(&self, program: Program) -> Result<(), EngineError> {
        let mut t = self.tables.lock().expect("poisoned");
        t.programs.insert(program.id, program);
        Ok(())
    }

    fn program(&self, id: ProgramId) -> Option<Program> {
        self.tables.lock().expect("poisoned").programs.get(&id).cloned()
    }

    fn programs(&self, tournament_id: TournamentId, game_id: GameId) -> Vec<Program> {
        self.tables
            .lock()
            .expect("poisoned")
            .programs
            .values()
            .filter(|p| p.tournament_id == tournament_id && p.game_id == game_id)
            .cloned()
            .collect()
    }

    fn upsert_tournament(&self, tournament: Tournament) {
        self.tables
            .lock()
            .expect("poisoned")
            .tournaments
            .insert(tournament.id, tournament);
    }

    fn tournament(&self, id: TournamentId) -> Option<Tournament> {
        self.tables
            .lock()
            .expect("poisoned")
            .tournaments
            .get(&id)
            .cloned()
    }

    fn update_tournament_guarded(&self, tournament: &Tournament) -> bool {
        let mut t = self.tables.lock().expect("poisoned");
        match t.tournaments.get(&tournament.id) {
            Some(stored) if stored.version == tournament.version => {
                let mut next = tournament.clone();
                next.version += 1;
                t.tournaments.insert(next.id, next);
                true
            }
            _ => false,
        }
    }

    fn insert_round(&self, matches: &[MatchRow], round: RoundState) -> Result<usize, EngineError> {
        let mut t = self.tables.lock().expect("poisoned");
        let mut inserted = 0;
        for m in matches {
            if m.program1_id == m.program2_id {
                return Err(EngineError::DuplicateMatch);
            }
            let key = m.pairing_key();
            if t.pairings.contains_key(&key) {
                continue;
            }
            let mut row = m.clone();
            row.version += 1;
            t.pairings.insert(key, row.id);
            t.matches.insert(row.id, row);
            inserted += 1;
        }
        let round_key = (round.tournament_id, round.game_id, round.round_number);
        t.rounds.entry(round_key).or_insert_with(|| {
            let mut r = round.clone();
            r.version += 1;
            r
        });
        Ok(inserted)
    }

    fn match_row(&self, id: MatchId) -> Option<MatchRow> {
        self.tables.lock().expect("poisoned").matches.get(&id).cloned()
    }

    fn matches_for_round(
        &self,
        tournament_id: TournamentId,
        game_id: GameId,
        round_number: u32,
    ) -> Vec<MatchRow> {
        self.tables
            .lock()
            .expect("poisoned")
            .matches
            .values()
            .filter(|m| {
                m.tournament_id == tournament_id
                    && m.game_id == game_id
                    && m.round_number == round_number
            })
            .cloned()
            .collect()
    }

    fn update_match_guarded(&self, row: &MatchRow) -> bool {
        let mut t = self.tables.lock().expect("poisoned");
        match t.matches.get(&row.id) {
            Some(stored) if stored.version == row.version => {
                let mut next = row.clone();
                next.version += 1;
                t.matches.insert(next.id, next);
                true
            }
            _ => false,
        }
    }

    fn round_state(
        &self,
        tournament_id: TournamentId,
        game_id: GameId,
        round_number: u32,
    ) -> Option<RoundState> {
        self.tables
            .lock()
            .expect("poisoned")
            .rounds
            .get(&(tournament_id, game_id, round_number))
            .cloned()
    }

    fn update_round_guarded(&self, state: &RoundState) -> bool {
        let mut t = self.tables.lock().expect("poisoned");
        let key = (state.tournament_id, state.game_id, state.round_number);
        match t.rounds.get(&key) {
            Some(stored) if stored.version == state.version => {
                let mut next = state.clone();
                next.version += 1;
                t.rounds.insert(key, next);
                true
            }
            _ => false,
        }
    }

    fn rating(
        &self,
        team_id: TeamId,
        game_id: GameId,
        tournament_id: TournamentId,
    ) -> Option<Rating> {
        self.tables
            .lock()
            .expect("poisoned")
            .ratings
            .get(&(team_id, game_id, tournament_id))
            .cloned()
    }

    fn update_rating_guarded(&self, rating: &Rating) -> bool {
        let mut t = self.tables.lock().expect("poisoned");
        let key = (rating.team_id, rating.game_id, rating.tournament_id);
        let applies = match t.ratings.get(&key) {
            Some(stored) => stored.version == rating.version,
            None => rating.version == 0,
        };
        if applies {
            let mut next = rating.clone();
            next.version += 1;
            t.ratings.insert(key, next);
        }
        applies
    }

    fn apply_rating_pair(&self, a: &Rating, b: &Rating) -> bool {
        let mut t = self.tables.lock().expect("poisoned");
        let applies = |tables: &Tables, r: &Rating| {
            let key = (r.team_id, r.game_id, r.tournament_id);
            match tables.ratings.get(&key) {
                Some(stored) => stored.version == r.version,
                None => r.version == 0,
            }
        };
        if !applies(&t, a) || !applies(&t, b) {
            return false;
        }
        for r in [a, b] {
            let mut next = r.clone();
            next.version += 1;
            t.ratings
                .insert((next.team_id, next.game_id, next.tournament_id), next);
        }
        true
    }

    fn ratings(&self, tournament_id: TournamentId, game_id: GameId) -> Vec<Rating> {
        self.tables
            .lock()
            .expect("poisoned")
            .ratings
            .values()
            .filter(|r| r.tournament_id == tournament_id && r.game_id == game_id)
            .cloned()
            .collect()
    }
}
