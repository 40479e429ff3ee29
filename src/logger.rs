//! Opt-in file logger for the match pipeline.
//!
//! Every failure path in the crate emits a structured record carrying its
//! context fields (`match_id`, `error_kind`, `attempt`, lock names, queue
//! depths); the subscriber installed here writes them to one log file per
//! engine run. Worker threads are named (`worker-3`, `pool-controller`,
//! `reservation-sweeper`), so thread names are part of the line format:
//! that is what ties a `match_id` record to the worker that produced it
//! when several matches fail at once. Targets are dropped from the format
//! for the same reason, the thread name already locates the component.

use std::fs::File;
use std::path::Path;

use time::{format_description, OffsetDateTime};
use tracing::{subscriber::set_global_default, Level};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, FmtSubscriber};

/// Install the engine's global subscriber, writing to a fresh
/// `tjudge_<timestamp>.log` under `dir`.
///
/// Will panic on error (unwritable directory, or a subscriber already
/// installed by the host).
pub fn init_logger(dir: &Path) {
    let file = File::create(dir.join(log_file_name())).unwrap();
    let writer = BoxMakeWriter::new(file);
    let local_offset = time::UtcOffset::current_local_offset().unwrap_or(time::UtcOffset::UTC);
    let timer = tracing_subscriber::fmt::time::OffsetTime::new(
        local_offset,
        format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]").unwrap(),
    );

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::TRACE)
        .with_ansi(false)
        .with_timer(timer)
        .with_thread_names(true)
        .with_target(false)
        .with_writer(writer)
        .finish();

    set_global_default(subscriber).expect("Could not set global default tracing subscriber. Disable engine logging if the host already installs one.");
}

fn log_file_name() -> String {
    let format =
        format_description::parse("tjudge_[year]-[month]-[day]_[hour]:[minute]:[second].log")
            .unwrap();
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    now.format(&format).unwrap()
}
