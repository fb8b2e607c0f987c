//! Sweeper: re-enqueues status checks for owners that are still pending but
//! whose polling went quiet, e.g. after a failed enqueue or a lost message.

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use rusqlite::Connection;

use super::context::PipelineContext;
use super::error::PipelineError;
use super::status::enqueue_status_check;
use crate::db::{get_status_check_tracking, list_stale_status_targets, mark_status_check_finished, now};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    pub stale: usize,
    pub requeued: usize,
    pub abandoned: usize,
    pub failures: usize,
}

pub fn run_status_sweep(
    conn: &Connection,
    ctx: &PipelineContext,
) -> Result<SweepSummary, PipelineError> {
    let stale_after = ChronoDuration::from_std(ctx.config.sweeper_stale_after)
        .unwrap_or_else(|_| ChronoDuration::hours(1));
    let at = now();
    let targets = list_stale_status_targets(conn, &(at - stale_after))?;

    let mut summary = SweepSummary {
        stale: targets.len(),
        ..Default::default()
    };
    for target in targets {
        let attempt = get_status_check_tracking(conn, &target)?
            .map_or(1, |t| t.attempts.saturating_add(1));

        if ctx.config.max_status_attempts.is_some_and(|max| attempt > max) {
            mark_status_check_finished(conn, &target, &at)?;
            summary.abandoned += 1;
            continue;
        }

        match enqueue_status_check(
            conn,
            ctx.status_queue.as_ref(),
            std::slice::from_ref(&target),
            attempt,
            Duration::ZERO,
        ) {
            Ok(()) => summary.requeued += 1,
            Err(e) => {
                tracing::warn!(
                    prescription_id = target.prescription_id,
                    owner_kind = %target.owner_kind,
                    error = %e,
                    "Sweeper could not enqueue status check"
                );
                summary.failures += 1;
            }
        }
    }

    if summary.stale > 0 {
        tracing::info!(
            stale = summary.stale,
            requeued = summary.requeued,
            abandoned = summary.abandoned,
            failures = summary.failures,
            "Status sweep complete"
        );
    }
    Ok(summary)
}
