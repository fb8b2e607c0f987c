//! Worker runtime: one thread per worker, each with its own database
//! connection, stopped through a shared shutdown flag.
//!
//! Queue consumers drain their queue and back off when it is empty. Periodic
//! workers run one cycle per interval while holding their named lease, so
//! at most one instance runs each of them at a time.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rusqlite::Connection;

use super::context::PipelineContext;
use super::error::PipelineError;
use super::refill_intake::run_refill_intake;
use super::router::process_routing_batch;
use super::status::process_status_batch;
use super::sweeper::run_status_sweep;
use super::transmission_errors::run_transmission_error_cycle;
use crate::db::open_database;
use crate::lock::{try_lease, REFILL_INTAKE_LEASE, SWEEPER_LEASE, TRANSMISSION_ERRORS_LEASE};

/// Sleep granularity for shutdown responsiveness.
const SLEEP_GRANULARITY: Duration = Duration::from_millis(250);

type BatchFn = fn(&Connection, &PipelineContext) -> Result<usize, PipelineError>;
type CycleFn = fn(&Connection, &PipelineContext) -> Result<(), PipelineError>;

/// Handle for the worker threads.
///
/// Dropping it requests shutdown and joins every thread; a cycle already in
/// progress completes first.
pub struct WorkerHandle {
    shutdown: Arc<AtomicBool>,
    threads: Vec<(&'static str, JoinHandle<()>)>,
}

impl WorkerHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn worker_names(&self) -> Vec<&'static str> {
        self.threads.iter().map(|(name, _)| *name).collect()
    }

    /// Block until every worker exits.
    pub fn wait(mut self) {
        self.join_all();
    }

    fn join_all(&mut self) {
        for (name, thread) in self.threads.drain(..) {
            if thread.join().is_err() {
                tracing::error!(worker = name, "Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
        self.join_all();
    }
}

/// Spawn every worker against the database at `db_path`.
pub fn start_workers(ctx: PipelineContext, db_path: &Path) -> std::io::Result<WorkerHandle> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut handle = WorkerHandle {
        shutdown: shutdown.clone(),
        threads: Vec::new(),
    };

    let consumers: [(&'static str, BatchFn); 2] = [
        ("routing", process_routing_batch),
        ("status", process_status_batch),
    ];
    for (name, batch) in consumers {
        let worker = Worker::new(name, &ctx, db_path, &shutdown);
        let thread = std::thread::Builder::new()
            .name(format!("erx-{name}"))
            .spawn(move || worker.consume(batch))?;
        handle.threads.push((name, thread));
    }

    let periodic: [(&'static str, &'static str, Duration, CycleFn); 3] = [
        (
            "refill-intake",
            REFILL_INTAKE_LEASE,
            ctx.config.refill_poll_interval,
            |conn, ctx| {
                let summary = run_refill_intake(conn, ctx)?;
                tracing::debug!(?summary, "Refill intake cycle");
                Ok(())
            },
        ),
        (
            "transmission-errors",
            TRANSMISSION_ERRORS_LEASE,
            ctx.config.transmission_error_poll_interval,
            |conn, ctx| {
                let summary = run_transmission_error_cycle(conn, ctx)?;
                tracing::debug!(?summary, "Transmission error cycle");
                Ok(())
            },
        ),
        (
            "sweeper",
            SWEEPER_LEASE,
            ctx.config.sweeper_interval,
            |conn, ctx| run_status_sweep(conn, ctx).map(|_| ()),
        ),
    ];
    for (name, lease, interval, cycle) in periodic {
        let worker = Worker::new(name, &ctx, db_path, &shutdown);
        let thread = std::thread::Builder::new()
            .name(format!("erx-{name}"))
            .spawn(move || worker.every(interval, lease, cycle))?;
        handle.threads.push((name, thread));
    }

    tracing::info!(workers = handle.threads.len(), db = %db_path.display(), "Workers started");
    Ok(handle)
}

struct Worker {
    name: &'static str,
    ctx: PipelineContext,
    db_path: PathBuf,
    shutdown: Arc<AtomicBool>,
    conn: Option<Connection>,
}

impl Worker {
    fn new(
        name: &'static str,
        ctx: &PipelineContext,
        db_path: &Path,
        shutdown: &Arc<AtomicBool>,
    ) -> Self {
        Self {
            name,
            ctx: ctx.clone(),
            db_path: db_path.to_path_buf(),
            shutdown: shutdown.clone(),
            conn: None,
        }
    }

    fn running(&self) -> bool {
        !self.shutdown.load(Ordering::Relaxed)
    }

    /// Drain a queue; wait `empty_queue_wait` whenever it comes back empty.
    fn consume(mut self, batch: BatchFn) {
        tracing::info!(worker = self.name, "Queue consumer started");
        while self.running() {
            match self.with_connection(|conn, ctx| batch(conn, ctx)) {
                Ok(received) if received > 0 => continue,
                Ok(_) => {}
                Err(e) => tracing::error!(worker = self.name, error = %e, "Queue batch failed"),
            }
            self.sleep(self.ctx.config.empty_queue_wait);
        }
        tracing::info!(worker = self.name, "Queue consumer shutting down");
    }

    /// Run `cycle` once per `interval` under the named lease.
    fn every(mut self, interval: Duration, lease: &'static str, cycle: CycleFn) {
        tracing::info!(worker = self.name, interval_secs = interval.as_secs(), "Periodic worker started");
        while self.running() {
            let lock = self.ctx.lease.clone();
            match try_lease(lock.as_ref(), lease, self.ctx.config.lease_ttl) {
                Some(_guard) => {
                    if let Err(e) = self.with_connection(cycle) {
                        tracing::error!(worker = self.name, error = %e, "Periodic cycle failed");
                    }
                }
                None => tracing::debug!(worker = self.name, lease, "Lease held elsewhere, skipping cycle"),
            }
            self.sleep(interval);
        }
        tracing::info!(worker = self.name, "Periodic worker shutting down");
    }

    /// Run `f` on this worker's connection, opening it on first use. A
    /// storage failure drops the connection so the next cycle reopens it.
    fn with_connection<T>(
        &mut self,
        f: impl FnOnce(&Connection, &PipelineContext) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => open_database(&self.db_path)?,
        };
        let result = f(&conn, &self.ctx);
        if !matches!(result, Err(PipelineError::Persistence(_))) {
            self.conn = Some(conn);
        }
        result
    }

    fn sleep(&self, total: Duration) {
        let mut remaining = total;
        while !remaining.is_zero() && self.running() {
            let step = remaining.min(SLEEP_GRANULARITY);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }
}
