//! Status worker: reconciles local status histories with what the gateway
//! reports for each polled prescription.

use std::collections::HashSet;
use std::time::Duration;

use chrono::NaiveDateTime;
use rand::Rng;
use rusqlite::Connection;

use super::context::PipelineContext;
use super::error::PipelineError;
use super::transmission_errors::emit_transmission_error_item;
use crate::db::{
    append_status_event, get_active_status_event, get_prescription_owner, get_status_history,
    mark_status_check_finished, normalize_timestamp, now, record_status_check_enqueued,
    DatabaseError, PrescriptionOwner,
};
use crate::dispatch::PipelineEvent;
use crate::erx::GatewayStatusEvent;
use crate::models::{can_transition, ErxStatus, NewStatusEvent, StatusTarget};
use crate::queue::{QueueMessage, ReceivedMessage, WorkQueue};

/// Result of reconciling one prescription.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub appended: Vec<ErxStatus>,
    pub active: Option<ErxStatus>,
    /// The owner still needs polling.
    pub pending: bool,
}

// ═══════════════════════════════════════════════════════════
// Enqueue
// ═══════════════════════════════════════════════════════════

/// Record tracking for `targets`, then enqueue one status-check message for
/// all of them.
pub fn enqueue_status_check(
    conn: &Connection,
    queue: &dyn WorkQueue,
    targets: &[StatusTarget],
    attempt: u32,
    delay: Duration,
) -> Result<(), PipelineError> {
    if targets.is_empty() {
        return Ok(());
    }
    let at = now();
    for target in targets {
        record_status_check_enqueued(conn, target, attempt, &at)?;
    }
    queue.send(
        &QueueMessage::StatusCheck {
            targets: targets.to_vec(),
            attempt,
        },
        delay,
    )?;
    Ok(())
}

/// Schedule the first check for each target, one message per target. A
/// failure is logged and left to the sweeper: the triggering state change
/// is already committed.
pub fn schedule_first_checks(conn: &Connection, ctx: &PipelineContext, targets: &[StatusTarget]) {
    let delay = with_jitter(ctx.config.status_backoff(1));
    for target in targets {
        if let Err(e) = enqueue_status_check(
            conn,
            ctx.status_queue.as_ref(),
            std::slice::from_ref(target),
            1,
            delay,
        ) {
            tracing::warn!(
                prescription_id = target.prescription_id,
                owner_kind = %target.owner_kind,
                error = %e,
                "Could not schedule status check; sweeper will retry"
            );
        }
    }
}

/// Spread requeues by up to a tenth of the delay.
pub fn with_jitter(delay: Duration) -> Duration {
    let spread = delay.as_millis() as u64 / 10;
    if spread == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}

// ═══════════════════════════════════════════════════════════
// Consumer
// ═══════════════════════════════════════════════════════════

/// Receive and handle one batch from the status queue. Returns how many
/// messages were received.
pub fn process_status_batch(conn: &Connection, ctx: &PipelineContext) -> Result<usize, PipelineError> {
    let received = ctx
        .status_queue
        .receive(ctx.config.receive_batch_size, ctx.config.visibility_timeout)?;
    for message in &received {
        if let Err(e) = handle_status_message(conn, ctx, message) {
            // Left undeleted: redelivered once the visibility timeout lapses.
            tracing::error!(error = %e, "Status message handling failed");
        }
    }
    Ok(received.len())
}

pub fn handle_status_message(
    conn: &Connection,
    ctx: &PipelineContext,
    received: &ReceivedMessage,
) -> Result<(), PipelineError> {
    let (targets, attempt) = match received.decode() {
        Ok(QueueMessage::StatusCheck { targets, attempt }) => (targets, attempt),
        Ok(other) => {
            tracing::warn!(message = ?other, "Dropping non status-check message from status queue");
            ctx.status_queue.delete(&received.receipt)?;
            return Ok(());
        }
        Err(e) => {
            tracing::warn!(error = %e, body = %received.body, "Dropping malformed status message");
            ctx.status_queue.delete(&received.receipt)?;
            return Ok(());
        }
    };

    let mut requeue = Vec::new();
    for target in targets {
        match reconcile_target(conn, ctx, &target) {
            Ok(outcome) if outcome.pending => requeue.push(target),
            Ok(outcome) => {
                tracing::debug!(
                    prescription_id = target.prescription_id,
                    active = ?outcome.active,
                    "Status polling finished"
                );
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    prescription_id = target.prescription_id,
                    error = %e,
                    "Status check failed, will retry"
                );
                requeue.push(target);
            }
            Err(e) => {
                tracing::error!(
                    prescription_id = target.prescription_id,
                    owner_kind = %target.owner_kind,
                    owner_id = %target.owner_id,
                    error = %e,
                    "Status check failed"
                );
            }
        }
    }

    // A lapsed receipt means the message was redelivered; the copy holding
    // the current receipt owns the follow-up check.
    if !ctx.status_queue.delete(&received.receipt)? {
        tracing::debug!(
            attempt,
            receive_count = received.receive_count,
            "Status message receipt expired, leaving follow-up to the redelivery"
        );
        return Ok(());
    }

    if !requeue.is_empty() {
        if ctx
            .config
            .max_status_attempts
            .is_some_and(|max| attempt >= max)
        {
            let at = now();
            for target in &requeue {
                tracing::warn!(
                    prescription_id = target.prescription_id,
                    attempts = attempt,
                    "Status polling cap reached, giving up"
                );
                mark_status_check_finished(conn, target, &at)?;
            }
        } else {
            let next = attempt.saturating_add(1);
            let delay = with_jitter(ctx.config.status_backoff(next));
            enqueue_status_check(conn, ctx.status_queue.as_ref(), &requeue, next, delay)?;
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════
// Reconciliation
// ═══════════════════════════════════════════════════════════

/// Fetch the gateway's history for one prescription and append whatever the
/// local history is missing.
pub fn reconcile_target(
    conn: &Connection,
    ctx: &PipelineContext,
    target: &StatusTarget,
) -> Result<ReconcileOutcome, PipelineError> {
    let owner = get_prescription_owner(conn, target.owner_kind, &target.owner_id)?;
    let mut reported = ctx.gateway.get_prescription_status(target.prescription_id)?;
    reported.sort_by_key(|e| e.reported_at);

    let tx = conn.unchecked_transaction()?;
    let applied = apply_gateway_statuses(&tx, &owner, target.prescription_id, &reported)?;
    tx.commit()?;

    for details in applied.errors {
        tracing::info!(
            prescription_id = target.prescription_id,
            owner_kind = %owner.kind,
            %details,
            "Transmission error recorded"
        );
        ctx.publish(PipelineEvent::TransmissionError {
            owner_kind: owner.kind,
            owner_id: owner.id,
            event_type: owner.kind.transmission_error_type(),
        });
    }

    let pending = applied
        .active
        .map_or(true, |status| status.is_pending_for(owner.kind));
    if !pending {
        mark_status_check_finished(conn, target, &now())?;
    }

    Ok(ReconcileOutcome {
        appended: applied.appended,
        active: applied.active,
        pending,
    })
}

struct Applied {
    appended: Vec<ErxStatus>,
    active: Option<ErxStatus>,
    /// Details of Error events that produced a new doctor-queue item.
    errors: Vec<String>,
}

fn apply_gateway_statuses(
    conn: &Connection,
    owner: &PrescriptionOwner,
    prescription_id: i64,
    reported: &[GatewayStatusEvent],
) -> Result<Applied, DatabaseError> {
    let history = get_status_history(conn, owner.kind, &owner.id)?;
    let known: HashSet<(ErxStatus, NaiveDateTime, Option<String>)> = history
        .iter()
        .map(|e| (e.status, e.reported_at, e.details.clone()))
        .collect();
    let seen_statuses: HashSet<ErxStatus> = history.iter().map(|e| e.status).collect();

    let mut active = get_active_status_event(conn, owner.kind, &owner.id)?
        .map(|e| (e.status, e.reported_at));
    let mut applied = Applied {
        appended: Vec::new(),
        active: active.map(|(status, _)| status),
        errors: Vec::new(),
    };

    for event in reported {
        let at = normalize_timestamp(event.reported_at);
        if known.contains(&(event.status, at, event.details.clone())) {
            continue;
        }
        // The gateway stamps in-flight markers with its own clock; the local
        // copy written at routing time is the same transition.
        if event.status.is_in_flight_marker() && seen_statuses.contains(&event.status) {
            continue;
        }

        if let Some((status, active_at)) = active {
            if status == event.status {
                tracing::debug!(prescription_id, status = %event.status, "Status already active");
                continue;
            }
            if at < active_at {
                if event.status.is_in_flight_marker() {
                    tracing::debug!(prescription_id, status = %event.status, "Skipping stale marker");
                } else {
                    tracing::warn!(
                        prescription_id,
                        status = %event.status,
                        reported_at = %at,
                        active_at = %active_at,
                        "Ordering violation: gateway event precedes active status, skipped"
                    );
                }
                continue;
            }
        }

        let from = active.map(|(status, _)| status);
        if !can_transition(owner.kind, from, event.status) {
            if event.status.is_in_flight_marker() {
                tracing::debug!(prescription_id, status = %event.status, "Skipping marker");
            } else {
                tracing::warn!(
                    prescription_id,
                    owner_kind = %owner.kind,
                    from = ?from,
                    to = %event.status,
                    "Gateway reported a transition that is not allowed, skipped"
                );
            }
            continue;
        }

        let mut new_event = NewStatusEvent::new(event.status, at);
        new_event.details = event.details.clone();
        append_status_event(conn, owner.kind, &owner.id, &new_event)?;
        tracing::debug!(prescription_id, status = %event.status, "Status appended");

        active = Some((event.status, at));
        applied.appended.push(event.status);

        if event.status == ErxStatus::Error {
            let details = event.details.clone().unwrap_or_default();
            if emit_transmission_error_item(conn, owner, &details)? {
                applied.errors.push(details);
            }
        }
    }

    applied.active = active.map(|(status, _)| status);
    Ok(applied)
}
