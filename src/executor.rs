//! Sandboxed execution of one match.
//!
//! The executor launches the game's referee binary inside a fresh
//! [`Sandbox`], hands it the two program paths, streams its stdio, and
//! turns whatever happens into an [`Outcome`]. It is a pure function of
//! its inputs: no shared state, one sandbox per call, the sandbox is
//! destroyed unconditionally before returning.
//!
//! # Referee contract
//!
//! The referee is invoked as
//! `referee --iterations=<N> <program1_path> <program2_path>`. On success
//! its final stdout line is exactly
//! `RESULT score1=<int> score2=<int> winner=<1|2|draw>` and it exits 0;
//! anything else on a zero exit classifies as `protocol`. Non-zero exits
//! map to: 124 → timeout, 137 or SIGKILL → oom, anything else → a crash
//! attributed via the last `FAULT player=<1|2>` line on stderr, or
//! `internal` when the referee did not say whose fault it was.
//!
//! The wall clock runs from sandbox creation, not process fork, and is
//! enforced here rather than trusted to the referee.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{instrument, trace, warn};

use crate::error::MatchFault;
use crate::model::{GameId, MatchDescriptor, Outcome, Winner};
use crate::sandbox::{Sandbox, SandboxProfile};

/// How long we give a killed sandbox to actually release its processes.
const CLEANUP_GRACE: Duration = Duration::from_secs(2);

/// How many stderr tail lines are kept for fault attribution and logs.
const STDERR_TAIL: usize = 64;

/// Referee exit code for an exceeded internal time limit.
const EXIT_TIMEOUT: i32 = 124;
/// Exit code the runtime reports when the OOM killer got the process.
const EXIT_OOM: i32 = 137;

/// What one execution produced, plus bookkeeping for the retry policy.
#[derive(Debug)]
pub struct Execution {
    /// What the match produced.
    pub outcome: Outcome,
    /// Wall time from sandbox creation to teardown.
    pub duration: Duration,
    /// False when the failure happened before the match had any chance to
    /// run (sandbox refused to start); such failures do not consume one
    /// of the match's attempts.
    pub charge_attempt: bool,
}

impl Execution {
    fn infra_failure(duration: Duration) -> Self {
        Execution {
            outcome: Outcome::Fault(MatchFault::Internal),
            duration,
            charge_attempt: false,
        }
    }
}

/// Executes matches by driving per-game referee binaries.
pub struct Executor {
    profile: SandboxProfile,
    referees: HashMap<GameId, PathBuf>,
}

impl Executor {
    /// An executor with no referees registered yet.
    pub fn new(profile: SandboxProfile) -> Self {
        Executor {
            profile,
            referees: HashMap::new(),
        }
    }

    /// Register the referee binary for a game. Adding a game to the
    /// platform is exactly this: deploy a referee, register it here.
    #[must_use]
    pub fn with_referee(mut self, game_id: GameId, referee: impl AsRef<Path>) -> Self {
        self.referees.insert(game_id, referee.as_ref().to_path_buf());
        self
    }

    /// The resource profile every execution runs under.
    pub fn profile(&self) -> &SandboxProfile {
        &self.profile
    }

    /// Run one match to an outcome. Never panics, never leaves the
    /// sandbox behind.
    #[instrument(skip_all, fields(match_id = %descriptor.match_id))]
    pub fn execute(
        &self,
        descriptor: &MatchDescriptor,
        program1: &Path,
        program2: &Path,
    ) -> Execution {
        let started = Instant::now();

        let Some(referee) = self.referees.get(&descriptor.game_id) else {
            warn!(game_id = descriptor.game_id, "no referee registered");
            return Execution::infra_failure(started.elapsed());
        };

        // The deadline is anchored at sandbox creation, not process fork.
        let mut sandbox = match Sandbox::create(&self.profile) {
            Ok(s) => s,
            Err(e) => {
                warn!("sandbox allocation failed: {e:#}");
                return Execution::infra_failure(started.elapsed());
            }
        };
        let deadline = Instant::now() + self.profile.wall_clock;

        let mut command = Command::new(referee);
        command
            .arg(format!("--iterations={}", descriptor.iterations))
            .arg(program1)
            .arg(program2)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match sandbox.spawn(&mut command) {
            Ok(c) => c,
            Err(e) => {
                warn!("referee spawn failed: {e:#}");
                return Execution::infra_failure(started.elapsed());
            }
        };

        // Readers drain the pipes so the referee can never block on a
        // full pipe; they end at EOF, which the kill below guarantees.
        let stdout = child.stdout.take().expect("stdout was piped");
        let stdout_reader = std::thread::spawn(move || {
            let mut last_line = None;
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if !line.trim().is_empty() {
                    last_line = Some(line);
                }
            }
            last_line
        });
        let stderr = child.stderr.take().expect("stderr was piped");
        let stderr_reader = std::thread::spawn(move || {
            let mut tail = std::collections::VecDeque::with_capacity(STDERR_TAIL);
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail)
        });

        let mut timed_out = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    if Instant::now() >= deadline {
                        timed_out = true;
                        warn!("wall-clock deadline exceeded, killing sandbox");
                        sandbox.destroy(&mut child, CLEANUP_GRACE);
                        break None;
                    }
                    std::thread::sleep(Duration::from_millis(25));
                }
                Err(e) => {
                    warn!("waiting on referee failed: {e}");
                    sandbox.destroy(&mut child, CLEANUP_GRACE);
                    break None;
                }
            }
        };

        let last_stdout = stdout_reader.join().unwrap_or_default();
        let stderr_tail = stderr_reader.join().unwrap_or_default();
        sandbox.destroy(&mut child, CLEANUP_GRACE);
        let duration = started.elapsed();

        let outcome = if timed_out {
            Outcome::Fault(MatchFault::Timeout)
        } else {
            match status {
                None => Outcome::Fault(MatchFault::Internal),
                Some(status) => classify(status, last_stdout.as_deref(), &stderr_tail),
            }
        };

        if let Outcome::Fault(fault) = &outcome {
            warn!(
                match_id = %descriptor.match_id,
                error_kind = %fault,
                stderr = ?stderr_tail.last(),
                "execution faulted"
            );
        } else {
            trace!(?duration, "execution finished");
        }

        Execution {
            outcome,
            duration,
            charge_attempt: true,
        }
    }
}

fn classify(
    status: std::process::ExitStatus,
    last_stdout: Option<&str>,
    stderr_tail: &[String],
) -> Outcome {
    if status.success() {
        return match last_stdout.and_then(parse_result_line) {
            Some(outcome) => outcome,
            None => Outcome::Fault(MatchFault::Protocol),
        };
    }

    match status.code() {
        Some(EXIT_TIMEOUT) => Outcome::Fault(MatchFault::Timeout),
        Some(EXIT_OOM) => Outcome::Fault(MatchFault::Oom),
        Some(_) => Outcome::Fault(attribute_crash(stderr_tail)),
        // No code means a signal ended it; SIGKILL is the OOM killer's
        // signature, anything else is unexplained.
        None => {
            if killed_by_sigkill(&status) {
                Outcome::Fault(MatchFault::Oom)
            } else {
                Outcome::Fault(attribute_crash(stderr_tail))
            }
        }
    }
}

#[cfg(unix)]
fn killed_by_sigkill(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(libc_sigkill())
}

#[cfg(unix)]
fn libc_sigkill() -> i32 {
    9
}

#[cfg(not(unix))]
fn killed_by_sigkill(_status: &std::process::ExitStatus) -> bool {
    false
}

/// The referee names the culprit with a `FAULT player=<1|2>` line on
/// stderr; the last such line wins. Without one the crash stays
/// unattributed.
fn attribute_crash(stderr_tail: &[String]) -> MatchFault {
    for line in stderr_tail.iter().rev() {
        let line = line.trim();
        let Some(rest) = line.strip_prefix("FAULT ") else {
            continue;
        };
        match rest.trim() {
            "player=1" => return MatchFault::Crash1,
            "player=2" => return MatchFault::Crash2,
            _ => continue,
        }
    }
    MatchFault::Internal
}

/// Strict parse of `RESULT score1=<int> score2=<int> winner=<1|2|draw>`.
fn parse_result_line(line: &str) -> Option<Outcome> {
    let mut parts = line.trim().split_whitespace();
    if parts.next()? != "RESULT" {
        return None;
    }
    let score1: i64 = parts.next()?.strip_prefix("score1=")?.parse().ok()?;
    let score2: i64 = parts.next()?.strip_prefix("score2=")?.parse().ok()?;
    let winner = match parts.next()?.strip_prefix("winner=")? {
        "1" => Winner::Player1,
        "2" => Winner::Player2,
        "draw" => Winner::Draw,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(Outcome::Scored {
        score1,
        score2,
        winner,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn descriptor(game_id: GameId) -> MatchDescriptor {
        MatchDescriptor {
            match_id: Uuid::new_v4(),
            tournament_id: 1,
            game_id,
            program1_id: 1,
            program2_id: 2,
            iterations: 10,
            priority: crate::model::Priority::Medium,
            attempt_count: 0,
        }
    }

    #[test]
    fn parses_well_formed_result_line() {
        let got = parse_result_line("RESULT score1=30 score2=-4 winner=1").unwrap();
        assert_eq!(
            got,
            Outcome::Scored {
                score1: 30,
                score2: -4,
                winner: Winner::Player1,
            }
        );
        let draw = parse_result_line("RESULT score1=5 score2=5 winner=draw").unwrap();
        assert!(matches!(draw, Outcome::Scored { winner: Winner::Draw, .. }));
    }

    #[test]
    fn rejects_malformed_result_lines() {
        for line in [
            "",
            "RESULT",
            "RESULT score1=1 score2=2",
            "RESULT score1=1 score2=2 winner=3",
            "RESULT score1=a score2=2 winner=1",
            "RESULT score2=2 score1=1 winner=1",
            "RESULT score1=1 score2=2 winner=1 extra=field",
            "result score1=1 score2=2 winner=1",
        ] {
            assert!(parse_result_line(line).is_none(), "accepted: {line:?}");
        }
    }

    #[test]
    fn crash_attribution_takes_last_fault_line() {
        let tail = vec![
            "some log".to_string(),
            "FAULT player=2".to_string(),
            "more noise".to_string(),
            "FAULT player=1".to_string(),
        ];
        assert_eq!(attribute_crash(&tail), MatchFault::Crash1);
        assert_eq!(attribute_crash(&[]), MatchFault::Internal);
        assert_eq!(
            attribute_crash(&["FAULT player=banana".to_string()]),
            MatchFault::Internal
        );
    }

    // The process-driving tests use tiny shell scripts as referees and an
    // uncontained profile so they run without cgroup privileges.
    #[cfg(unix)]
    mod with_processes {
        use super::*;
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;
        use std::path::PathBuf;

        fn script_referee(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("referee.sh");
            let mut f = std::fs::File::create(&path).unwrap();
            writeln!(f, "#!/bin/sh\n{body}").unwrap();
            drop(f);
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn executor_for(referee: &Path, wall_clock: Duration) -> Executor {
            let profile = SandboxProfile::new()
                .with_wall_clock(wall_clock)
                .with_allow_uncontained(true);
            Executor::new(profile).with_referee(1, referee)
        }

        fn dummy_programs(dir: &Path) -> (PathBuf, PathBuf) {
            let p1 = dir.join("bot1");
            let p2 = dir.join("bot2");
            std::fs::write(&p1, b"").unwrap();
            std::fs::write(&p2, b"").unwrap();
            (p1, p2)
        }

        #[test]
        fn scored_outcome_from_result_line() {
            let dir = tempfile::tempdir().unwrap();
            let referee = script_referee(
                dir.path(),
                "echo starting\necho 'RESULT score1=12 score2=8 winner=1'",
            );
            let (p1, p2) = dummy_programs(dir.path());
            let exec = executor_for(&referee, Duration::from_secs(10));
            let run = exec.execute(&descriptor(1), &p1, &p2);
            assert_eq!(
                run.outcome,
                Outcome::Scored {
                    score1: 12,
                    score2: 8,
                    winner: Winner::Player1,
                }
            );
            assert!(run.charge_attempt);
        }

        #[test]
        fn garbage_final_line_is_protocol() {
            let dir = tempfile::tempdir().unwrap();
            let referee = script_referee(dir.path(), "echo 'segmentation fault (not really)'");
            let (p1, p2) = dummy_programs(dir.path());
            let exec = executor_for(&referee, Duration::from_secs(10));
            let run = exec.execute(&descriptor(1), &p1, &p2);
            assert_eq!(run.outcome, Outcome::Fault(MatchFault::Protocol));
        }

        #[test]
        fn exit_124_is_timeout_and_137_is_oom() {
            let dir = tempfile::tempdir().unwrap();
            let (p1, p2) = dummy_programs(dir.path());

            let referee = script_referee(dir.path(), "exit 124");
            let run = executor_for(&referee, Duration::from_secs(10))
                .execute(&descriptor(1), &p1, &p2);
            assert_eq!(run.outcome, Outcome::Fault(MatchFault::Timeout));

            let referee = script_referee(dir.path(), "exit 137");
            let run = executor_for(&referee, Duration::from_secs(10))
                .execute(&descriptor(1), &p1, &p2);
            assert_eq!(run.outcome, Outcome::Fault(MatchFault::Oom));
        }

        #[test]
        fn crash_attributed_through_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let referee = script_referee(dir.path(), "echo 'FAULT player=1' >&2\nexit 2");
            let (p1, p2) = dummy_programs(dir.path());
            let run = executor_for(&referee, Duration::from_secs(10))
                .execute(&descriptor(1), &p1, &p2);
            assert_eq!(run.outcome, Outcome::Fault(MatchFault::Crash1));
        }

        #[test]
        fn unattributed_crash_is_internal() {
            let dir = tempfile::tempdir().unwrap();
            let referee = script_referee(dir.path(), "exit 3");
            let (p1, p2) = dummy_programs(dir.path());
            let run = executor_for(&referee, Duration::from_secs(10))
                .execute(&descriptor(1), &p1, &p2);
            assert_eq!(run.outcome, Outcome::Fault(MatchFault::Internal));
        }

        #[test]
        fn wall_clock_kill_is_timeout() {
            let dir = tempfile::tempdir().unwrap();
            let referee = script_referee(dir.path(), "sleep 30");
            let (p1, p2) = dummy_programs(dir.path());
            let started = Instant::now();
            let run = executor_for(&referee, Duration::from_millis(200))
                .execute(&descriptor(1), &p1, &p2);
            assert_eq!(run.outcome, Outcome::Fault(MatchFault::Timeout));
            assert!(run.charge_attempt);
            assert!(started.elapsed() < Duration::from_secs(10));
        }

        #[test]
        fn missing_referee_is_free_internal_fault() {
            let exec = Executor::new(
                SandboxProfile::new().with_allow_uncontained(true),
            );
            let run = exec.execute(
                &descriptor(42),
                Path::new("/nonexistent/a"),
                Path::new("/nonexistent/b"),
            );
            assert_eq!(run.outcome, Outcome::Fault(MatchFault::Internal));
            assert!(!run.charge_attempt);
        }
    }
}
