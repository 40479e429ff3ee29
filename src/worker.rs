//! Adaptive worker pool draining the match queue.
//!
//! Each worker is an OS thread looping dequeue → mark running → execute →
//! record → ack. Transient faults nack back to the LOW lane with an
//! exponential delay (1 s, 4 s, 16 s) until the attempt budget runs out;
//! terminal faults are recorded as failed immediately. A panic inside the
//! loop is caught, the reservation is nacked, and the worker keeps going.
//!
//! A controller thread samples queue depth and the idle ratio every two
//! seconds and grows or shrinks the pool inside its `[min, max]` budget.
//! Removed workers finish their current match before exiting; shutdown
//! stops dequeueing everywhere and waits for in-flight matches, anything
//! unfinished coming back via the reservation timeout.
//!
//! Workers never hold a lock across an executor call; the only shared
//! state is the atomic counters in [`Metrics`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{info, instrument, trace, warn};

use crate::error::MatchFault;
use crate::executor::Executor;
use crate::metrics::Metrics;
use crate::model::{MatchStatus, Outcome};
use crate::orchestrator::RoundOrchestrator;
use crate::queue::{MatchQueue, Reservation};
use crate::recorder::Recorder;
use crate::store::Store;

/// Autoscale sampling period.
const CONTROLLER_TICK: Duration = Duration::from_secs(2);

/// Queue depths at which the controller adds workers.
const DEPTH_SURGE: usize = 100;
const DEPTH_BUSY: usize = 50;
/// Depth below which (with enough idle workers) the pool shrinks.
const DEPTH_QUIET: usize = 10;
const IDLE_SHRINK_RATIO: f64 = 0.5;

/// How long one dequeue call blocks before the worker re-checks its stop
/// signals.
const DEQUEUE_SLICE: Duration = Duration::from_millis(500);

/// Backoff ladder for dequeue errors (unreachable backend).
const DEQUEUE_BACKOFF_FLOOR: Duration = Duration::from_millis(100);
const DEQUEUE_BACKOFF_CEIL: Duration = Duration::from_secs(5);

/// Nack delay for retry `n` (1-based): 1 s, 4 s, 16 s.
fn retry_delay(attempt: u32) -> Duration {
    Duration::from_secs(4u64.pow(attempt.saturating_sub(1).min(2)))
}

struct WorkerHandle {
    id: usize,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct PoolShared {
    queue: Arc<dyn MatchQueue>,
    store: Arc<dyn Store>,
    executor: Arc<Executor>,
    recorder: Arc<Recorder>,
    orchestrator: Arc<RoundOrchestrator>,
    metrics: Arc<Metrics>,
    min: usize,
    max: usize,
    max_attempts: u32,
    shutdown: AtomicBool,
    workers: Mutex<Vec<WorkerHandle>>,
    next_worker_id: AtomicUsize,
}

/// Pool facade owned by the engine.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    controller: Option<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the minimum worker count and the autoscale controller.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        queue: Arc<dyn MatchQueue>,
        store: Arc<dyn Store>,
        executor: Arc<Executor>,
        recorder: Arc<Recorder>,
        orchestrator: Arc<RoundOrchestrator>,
        metrics: Arc<Metrics>,
        min: usize,
        max: usize,
        max_attempts: u32,
    ) -> WorkerPool {
        let shared = Arc::new(PoolShared {
            queue,
            store,
            executor,
            recorder,
            orchestrator,
            metrics,
            min,
            max,
            max_attempts,
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            next_worker_id: AtomicUsize::new(0),
        });

        grow(&shared, min);

        let controller_shared = shared.clone();
        let controller = std::thread::Builder::new()
            .name("pool-controller".to_string())
            .spawn(move || controller_loop(&controller_shared))
            .expect("could not spawn controller thread");

        info!(min, max, "worker pool started");
        WorkerPool {
            shared,
            controller: Some(controller),
        }
    }

    /// Stop dequeueing everywhere and wait for in-flight matches.
    pub fn shutdown(mut self) {
        info!("worker pool shutting down");
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.queue.close();
        if let Some(controller) = self.controller.take() {
            let _ = controller.join();
        }
        let workers = std::mem::take(&mut *self.shared.workers.lock().expect("poisoned"));
        for w in workers {
            w.stop.store(true, Ordering::SeqCst);
            let _ = w.handle.join();
        }
        info!("worker pool stopped");
    }
}

fn controller_loop(shared: &Arc<PoolShared>) {
    while !shared.shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(CONTROLLER_TICK);
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        reap_finished(shared);

        let depth = shared.queue.total_len();
        shared.metrics.queue_depth.store(depth, Ordering::Relaxed);
        let current = shared.workers.lock().expect("poisoned").len();
        let idle_ratio = shared.metrics.idle_ratio();

        if depth > DEPTH_SURGE {
            grow(shared, 10.min(shared.max.saturating_sub(current)));
        } else if depth > DEPTH_BUSY {
            grow(shared, 5.min(shared.max.saturating_sub(current)));
        } else if depth < DEPTH_QUIET && idle_ratio > IDLE_SHRINK_RATIO {
            shrink(shared, 5.min(current.saturating_sub(shared.min)));
        }
    }
}

fn reap_finished(shared: &Arc<PoolShared>) {
    let mut workers = shared.workers.lock().expect("poisoned");
    let mut i = 0;
    while i < workers.len() {
        if workers[i].handle.is_finished() {
            let w = workers.swap_remove(i);
            let _ = w.handle.join();
            trace!(worker = w.id, "reaped");
        } else {
            i += 1;
        }
    }
}

fn grow(shared: &Arc<PoolShared>, count: usize) {
    if count == 0 {
        return;
    }
    let mut workers = shared.workers.lock().expect("poisoned");
    for _ in 0..count {
        if workers.len() >= shared.max {
            break;
        }
        let id = shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || worker_loop(id, &worker_shared, &worker_stop))
            .expect("could not spawn worker thread");
        workers.push(WorkerHandle { id, stop, handle });
    }
    trace!(workers = workers.len(), "pool grew");
}

fn shrink(shared: &Arc<PoolShared>, count: usize) {
    if count == 0 {
        return;
    }
    let workers = shared.workers.lock().expect("poisoned");
    // Newest first; they are the least likely to be mid-match.
    for w in workers.iter().rev().take(count) {
        w.stop.store(true, Ordering::SeqCst);
    }
    trace!(count, "pool shrink requested");
}

fn worker_loop(id: usize, shared: &Arc<PoolShared>, stop: &AtomicBool) {
    shared.metrics.active_workers.fetch_add(1, Ordering::Relaxed);
    trace!(worker = id, "worker up");
    let mut backoff = DEQUEUE_BACKOFF_FLOOR;

    while !shared.shutdown.load(Ordering::SeqCst) && !stop.load(Ordering::SeqCst) {
        shared.metrics.idle_workers.fetch_add(1, Ordering::Relaxed);
        let dequeued = shared.queue.dequeue(DEQUEUE_SLICE);
        shared.metrics.idle_workers.fetch_sub(1, Ordering::Relaxed);

        let reservation = match dequeued {
            Ok(Some(r)) => {
                backoff = DEQUEUE_BACKOFF_FLOOR;
                r
            }
            Ok(None) => continue,
            Err(e) => {
                warn!(worker = id, "dequeue failed, backing off: {e}");
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(DEQUEUE_BACKOFF_CEIL);
                continue;
            }
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            process_reservation(shared, &reservation);
        }));
        if outcome.is_err() {
            shared.metrics.record_panic();
            recover_from_panic(shared, &reservation);
        }
    }

    shared.metrics.active_workers.fetch_sub(1, Ordering::Relaxed);
    trace!(worker = id, "worker down");
}

/// One delivery, end to end.
#[instrument(skip_all, fields(match_id = %reservation.descriptor.match_id))]
fn process_reservation(shared: &Arc<PoolShared>, reservation: &Reservation) {
    let descriptor = &reservation.descriptor;

    // Claim the row. Terminal rows mean duplicate delivery (reservation
    // expiry, or a retried enqueue); consume silently.
    let Some(row) = shared.store.match_row(descriptor.match_id) else {
        warn!("descriptor for unknown match, dropping");
        let _ = shared.queue.ack(reservation);
        return;
    };
    if row.status.is_terminal() {
        trace!("duplicate delivery of terminal match");
        let _ = shared.queue.ack(reservation);
        return;
    }
    let attempt = descriptor.attempt_count + 1;
    let mut claimed = row;
    claimed.status = MatchStatus::Running;
    claimed.started_at = Some(std::time::SystemTime::now());
    claimed.attempt_count = attempt;
    if !shared.store.update_match_guarded(&claimed) {
        // Somebody moved the row under us; requeue without charging and
        // let the next delivery sort it out.
        let _ = shared.queue.nack(
            reservation,
            descriptor.priority,
            Duration::from_secs(1),
            false,
        );
        return;
    }

    let (Some(program1), Some(program2)) = (
        shared.store.program(descriptor.program1_id),
        shared.store.program(descriptor.program2_id),
    ) else {
        warn!("program rows missing for match");
        finish_with_fault(shared, reservation, MatchFault::Internal, attempt);
        return;
    };

    let run = shared.executor.execute(
        descriptor,
        &program1.storage_path,
        &program2.storage_path,
    );

    match run.outcome {
        Outcome::Scored { .. } => {
            match shared
                .recorder
                .record_outcome(descriptor.match_id, &run.outcome)
            {
                Ok(applied) => {
                    if applied {
                        shared.metrics.record_processed(run.duration);
                    }
                    let _ = shared.queue.ack(reservation);
                    complete_round_if_drained(shared, reservation);
                }
                Err(e) => {
                    // The outcome is good but persistence said no; this is
                    // the transient-store case, retry the whole match.
                    warn!("recording outcome failed: {e}");
                    let _ = shared.queue.nack(
                        reservation,
                        crate::model::Priority::Low,
                        retry_delay(attempt),
                        true,
                    );
                }
            }
        }
        Outcome::Fault(fault) => {
            if !run.charge_attempt {
                // The match never ran; redeliver at full priority without
                // spending an attempt.
                let _ = shared.queue.nack(
                    reservation,
                    descriptor.priority,
                    Duration::from_secs(1),
                    false,
                );
                return;
            }
            if fault.is_transient() && attempt < shared.max_attempts {
                info!(error_kind = %fault, attempt, "transient fault, requeueing");
                shared.metrics.record_requeued();
                let _ = shared.queue.nack(
                    reservation,
                    crate::model::Priority::Low,
                    retry_delay(attempt),
                    true,
                );
            } else {
                finish_with_fault(shared, reservation, fault, attempt);
            }
        }
    }
}

fn finish_with_fault(
    shared: &Arc<PoolShared>,
    reservation: &Reservation,
    fault: MatchFault,
    attempt: u32,
) {
    warn!(
        match_id = %reservation.descriptor.match_id,
        error_kind = %fault,
        attempt,
        "match failed terminally"
    );
    match shared
        .recorder
        .record_outcome(reservation.descriptor.match_id, &Outcome::Fault(fault))
    {
        Ok(applied) => {
            if applied {
                shared.metrics.record_failed();
            }
            let _ = shared.queue.ack(reservation);
            complete_round_if_drained(shared, reservation);
        }
        Err(e) => {
            warn!("recording failure failed: {e}");
            let _ = shared.queue.nack(
                reservation,
                crate::model::Priority::Low,
                retry_delay(attempt),
                true,
            );
        }
    }
}

fn complete_round_if_drained(shared: &Arc<PoolShared>, reservation: &Reservation) {
    // The descriptor does not carry the round number; the row does.
    let Some(row) = shared.store.match_row(reservation.descriptor.match_id) else {
        return;
    };
    if let Err(e) = shared.orchestrator.maybe_complete_round(
        row.tournament_id,
        row.game_id,
        row.round_number,
    ) {
        warn!("round completion check failed: {e}");
    }
}

/// A panicking worker must not lose its match: requeue with the attempt
/// spent, or fail the match once the budget is gone.
fn recover_from_panic(shared: &Arc<PoolShared>, reservation: &Reservation) {
    let attempt = reservation.descriptor.attempt_count + 1;
    warn!(
        match_id = %reservation.descriptor.match_id,
        attempt,
        "worker panicked mid-match, recovering"
    );
    if attempt < shared.max_attempts {
        let _ = shared.queue.nack(
            reservation,
            crate::model::Priority::Low,
            retry_delay(attempt),
            true,
        );
    } else {
        finish_with_fault(shared, reservation, MatchFault::Internal, attempt);
    }
}
