//! Round-robin schedule generation.
//!
//! Double round-robin: every ordered pair of participating programs gets
//! one match, so each bot plays both sides against every opponent. The
//! participant list is a snapshot of the store at generation time,
//! distinct by team (the newest program version per team plays) and in
//! stable team order; programs uploaded after the round starts are not
//! scheduled into it.

use std::collections::HashMap;

use tracing::info;

use crate::model::{GameId, MatchRow, Program, TournamentId};
use crate::store::Store;

/// Generate the matches of one round. Pure with respect to the snapshot
/// it reads; inserting the result is the orchestrator's job, and the
/// store's pairing uniqueness makes re-generation harmless.
pub fn generate(
    store: &dyn Store,
    tournament_id: TournamentId,
    game_id: GameId,
    round_number: u32,
) -> Vec<MatchRow> {
    let participants = participants(store, tournament_id, game_id);
    if participants.len() < 2 {
        info!(
            tournament_id,
            game_id,
            entrants = participants.len(),
            "not enough participants, empty round"
        );
        return vec![];
    }

    let mut matches = Vec::with_capacity(participants.len() * (participants.len() - 1));
    for (i, p1) in participants.iter().enumerate() {
        for (j, p2) in participants.iter().enumerate() {
            if i == j {
                continue;
            }
            matches.push(MatchRow::new(
                tournament_id,
                game_id,
                p1.id,
                p2.id,
                round_number,
            ));
        }
    }
    matches
}

/// One program per team (the highest upload version wins), ordered by
/// team id for stable schedules.
fn participants(
    store: &dyn Store,
    tournament_id: TournamentId,
    game_id: GameId,
) -> Vec<Program> {
    let mut by_team: HashMap<u64, Program> = HashMap::new();
    for program in store.programs(tournament_id, game_id) {
        match by_team.get(&program.team_id) {
            Some(existing) if existing.version >= program.version => {}
            _ => {
                by_team.insert(program.team_id, program);
            }
        }
    }
    let mut list: Vec<Program> = by_team.into_values().collect();
    list.sort_by_key(|p| p.team_id);
    list
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn program(id: u64, team: u64, version: u32) -> Program {
        Program {
            id,
            team_id: team,
            tournament_id: 1,
            game_id: 1,
            storage_path: format!("/programs/{id}").into(),
            language: "rust".to_string(),
            version,
        }
    }

    fn store_with(programs: &[Program]) -> MemoryStore {
        let store = MemoryStore::new();
        for p in programs {
            store.insert_program(p.clone()).unwrap();
        }
        store
    }

    #[test]
    fn single_program_yields_nothing() {
        let store = store_with(&[program(1, 10, 1)]);
        assert!(generate(&store, 1, 1, 1).is_empty());
    }

    #[test]
    fn two_programs_yield_both_orientations() {
        let store = store_with(&[program(1, 10, 1), program(2, 11, 1)]);
        let matches = generate(&store, 1, 1, 1);
        assert_eq!(matches.len(), 2);
        let pairs: Vec<(u64, u64)> = matches
            .iter()
            .map(|m| (m.program1_id, m.program2_id))
            .collect();
        assert!(pairs.contains(&(1, 2)));
        assert!(pairs.contains(&(2, 1)));
    }

    #[test]
    fn n_programs_yield_n_times_n_minus_one() {
        let programs: Vec<Program> = (0..5).map(|i| program(i, 10 + i, 1)).collect();
        let store = store_with(&programs);
        let matches = generate(&store, 1, 1, 1);
        assert_eq!(matches.len(), 5 * 4);
        // No self-pairings, no duplicate ordered pairs.
        let mut seen = std::collections::HashSet::new();
        for m in &matches {
            assert_ne!(m.program1_id, m.program2_id);
            assert!(seen.insert((m.program1_id, m.program2_id)));
        }
    }

    #[test]
    fn one_program_per_team_highest_version() {
        let store = store_with(&[
            program(1, 10, 1),
            program(2, 10, 3),
            program(3, 11, 1),
        ]);
        let matches = generate(&store, 1, 1, 1);
        assert_eq!(matches.len(), 2);
        assert!(matches
            .iter()
            .all(|m| m.program1_id != 1 && m.program2_id != 1));
    }

    #[test]
    fn other_games_are_not_mixed_in() {
        let mut foreign = program(9, 50, 1);
        foreign.game_id = 2;
        let store = store_with(&[program(1, 10, 1), program(2, 11, 1), foreign]);
        let matches = generate(&store, 1, 1, 1);
        assert_eq!(matches.len(), 2);
    }
}
