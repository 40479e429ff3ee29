//! Engine facade: wires the components together and owns their
//! lifecycle.
//!
//! The four boundaries (queue, store, lock store, broadcaster) are
//! constructor-injected trait objects; everything else is concrete. The
//! default wiring is in-process stores plus the journal-backed queue when
//! a queue directory is configured. A process that cannot open its queue
//! journal refuses to start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, trace};

use crate::broadcast::Broadcaster;
use crate::configuration::Configuration;
use crate::executor::Executor;
use crate::lock::{KvLockStore, LockStore};
use crate::logger::init_logger;
use crate::metrics::Metrics;
use crate::orchestrator::RoundOrchestrator;
use crate::queue::{JournalQueue, MatchQueue};
use crate::recorder::Recorder;
use crate::store::{MemoryStore, Store};
use crate::worker::WorkerPool;

/// The match-execution engine. Construct, [`start`](Engine::start), feed
/// it rounds through the [`orchestrator`](Engine::orchestrator), shut it
/// down.
pub struct Engine {
    config: Configuration,
    store: Arc<dyn Store>,
    queue: Arc<dyn MatchQueue>,
    broadcaster: Arc<Broadcaster>,
    recorder: Arc<Recorder>,
    orchestrator: Arc<RoundOrchestrator>,
    executor: Arc<Executor>,
    metrics: Arc<Metrics>,
    pool: Option<WorkerPool>,
    sweeper: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
}

impl Engine {
    /// Default wiring: in-process store and locks, journal-backed queue
    /// when the configuration names a queue directory.
    ///
    /// # Errors
    ///
    /// Fails if the queue journal cannot be opened; a process without its
    /// queue does not start.
    pub fn new(config: Configuration, executor: Executor) -> anyhow::Result<Engine> {
        let queue: Arc<dyn MatchQueue> = match &config.queue_dir {
            Some(dir) => Arc::new(
                JournalQueue::open(dir, config.reservation_timeout)
                    .context("could not open queue journal")?,
            ),
            None => Arc::new(JournalQueue::in_memory(config.reservation_timeout)),
        };
        Self::with_components(
            config,
            executor,
            Arc::new(MemoryStore::new()),
            queue,
            Arc::new(KvLockStore::new()),
        )
    }

    /// Dependency-injected wiring for hosts that bring their own queue,
    /// store or lock backends.
    pub fn with_components(
        config: Configuration,
        executor: Executor,
        store: Arc<dyn Store>,
        queue: Arc<dyn MatchQueue>,
        locks: Arc<dyn LockStore>,
    ) -> anyhow::Result<Engine> {
        if config.is_logging_enabled() {
            init_logger(config.log_dir.as_deref().expect("log dir is set"));
        }
        trace!(?config);

        let broadcaster = Arc::new(Broadcaster::new());
        let metrics = Arc::new(Metrics::new());
        let recorder = Arc::new(Recorder::new(store.clone(), broadcaster.clone()));
        let orchestrator = Arc::new(RoundOrchestrator::new(
            store.clone(),
            queue.clone(),
            locks,
            broadcaster.clone(),
            config.max_attempts,
            config.lock_wait,
        ));

        Ok(Engine {
            config,
            store,
            queue,
            broadcaster,
            recorder,
            orchestrator,
            executor: Arc::new(executor),
            metrics,
            pool: None,
            sweeper: None,
        })
    }

    /// Spin up the worker pool, the autoscaler and the reservation
    /// sweeper. Idempotent.
    pub fn start(&mut self) {
        if self.pool.is_some() {
            return;
        }
        self.pool = Some(WorkerPool::start(
            self.queue.clone(),
            self.store.clone(),
            self.executor.clone(),
            self.recorder.clone(),
            self.orchestrator.clone(),
            self.metrics.clone(),
            self.config.worker_min,
            self.config.worker_max,
            self.config.max_attempts,
        ));
        self.sweeper = Some(spawn_sweeper(
            self.queue.clone(),
            self.config.reservation_timeout,
        ));
        info!("engine started");
    }

    /// Graceful drain: stop dequeueing, let in-flight matches finish,
    /// stop the sweeper. Unfinished matches come back through the
    /// reservation timeout on the next start.
    pub fn shutdown(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
        if let Some((stop, handle)) = self.sweeper.take() {
            stop.store(true, Ordering::SeqCst);
            let _ = handle.join();
        }
        info!("engine stopped");
    }

    /// The persistent-state boundary (programs, matches, ratings).
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The match queue.
    pub fn queue(&self) -> &Arc<dyn MatchQueue> {
        &self.queue
    }

    /// Subscribe here for match/round/leaderboard events.
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Outcome ingestion and leaderboards.
    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    /// Round lifecycle operations.
    pub fn orchestrator(&self) -> &Arc<RoundOrchestrator> {
        &self.orchestrator
    }

    /// Engine counters for the host's exporter.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Background redelivery of reservations whose worker died silently.
fn spawn_sweeper(
    queue: Arc<dyn MatchQueue>,
    reservation_timeout: Duration,
) -> (Arc<AtomicBool>, JoinHandle<()>) {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let tick = (reservation_timeout / 4).max(Duration::from_millis(250));
    let handle = std::thread::Builder::new()
        .name("reservation-sweeper".to_string())
        .spawn(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                std::thread::sleep(tick);
                let requeued = queue.requeue_expired();
                if requeued > 0 {
                    info!(requeued, "redelivered expired reservations");
                }
            }
        })
        .expect("could not spawn sweeper thread");
    (stop, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxProfile;

    #[test]
    fn engine_starts_and_stops_cleanly() {
        let config = Configuration::new().with_workers(1, 2);
        let executor = Executor::new(SandboxProfile::new().with_allow_uncontained(true));
        let mut engine = Engine::new(config, executor).unwrap();
        engine.start();
        engine.start(); // idempotent
        assert!(engine.metrics().snapshot().matches_processed == 0);
        engine.shutdown();
        engine.shutdown(); // idempotent
    }
}
