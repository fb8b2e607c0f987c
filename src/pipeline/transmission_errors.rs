//! Transmission-error worker: the safety net for errors the status worker
//! never saw, e.g. an error reported after a prescription was already Sent.

use std::cmp::max;

use rusqlite::Connection;

use super::context::PipelineContext;
use super::error::PipelineError;
use crate::db::{
    append_status_event, find_owner_by_prescription_id, get_active_status_event,
    insert_doctor_queue_item, list_doctors_with_clinician_id, now, normalize_timestamp,
    DatabaseError, PrescriptionOwner,
};
use crate::dispatch::PipelineEvent;
use crate::erx::TransmissionErrorReport;
use crate::models::{can_transition, DoctorQueueItem, ErxStatus, NewStatusEvent};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransmissionErrorSummary {
    pub reported: usize,
    pub recorded: usize,
    pub unknown_prescriptions: usize,
    pub failures: usize,
}

/// Put a Pending transmission-error item on the owning doctor's queue.
/// Returns false if one is already pending.
pub fn emit_transmission_error_item(
    conn: &Connection,
    owner: &PrescriptionOwner,
    details: &str,
) -> Result<bool, DatabaseError> {
    let mut item = DoctorQueueItem::pending(
        owner.doctor_id,
        owner.kind.transmission_error_type(),
        owner.id,
        owner.kind.queue_item_kind(),
        now(),
    );
    if !details.is_empty() {
        item = item.with_description(details);
    }
    insert_doctor_queue_item(conn, &item)
}

/// One pass over the gateway's transmission errors for every clinician.
pub fn run_transmission_error_cycle(
    conn: &Connection,
    ctx: &PipelineContext,
) -> Result<TransmissionErrorSummary, PipelineError> {
    let mut summary = TransmissionErrorSummary::default();

    for doctor in list_doctors_with_clinician_id(conn)? {
        let Some(clinician_id) = doctor.clinician_id else {
            continue;
        };
        let reports = match ctx.gateway.get_transmission_errors(clinician_id) {
            Ok(reports) => reports,
            Err(e) => {
                tracing::warn!(clinician_id, error = %e, "Could not fetch transmission errors");
                summary.failures += 1;
                continue;
            }
        };

        for report in &reports {
            summary.reported += 1;
            match record_reported_error(conn, ctx, report) {
                Ok(Recorded::Yes) => summary.recorded += 1,
                Ok(Recorded::AlreadyKnown) => {}
                Ok(Recorded::UnknownPrescription) => summary.unknown_prescriptions += 1,
                Err(e) => {
                    tracing::warn!(
                        prescription_id = report.prescription_id,
                        error = %e,
                        "Failed to record transmission error"
                    );
                    summary.failures += 1;
                }
            }
        }
    }

    tracing::info!(
        reported = summary.reported,
        recorded = summary.recorded,
        unknown = summary.unknown_prescriptions,
        failures = summary.failures,
        "Transmission error cycle complete"
    );
    Ok(summary)
}

#[derive(Debug, PartialEq, Eq)]
enum Recorded {
    Yes,
    AlreadyKnown,
    UnknownPrescription,
}

fn record_reported_error(
    conn: &Connection,
    ctx: &PipelineContext,
    report: &TransmissionErrorReport,
) -> Result<Recorded, PipelineError> {
    let Some(owner) = find_owner_by_prescription_id(conn, report.prescription_id)? else {
        tracing::debug!(prescription_id = report.prescription_id, "No owner for reported error");
        return Ok(Recorded::UnknownPrescription);
    };

    let tx = conn.unchecked_transaction()?;
    let Some(active) = get_active_status_event(&tx, owner.kind, &owner.id)? else {
        return Ok(Recorded::AlreadyKnown);
    };
    if matches!(active.status, ErxStatus::Error | ErxStatus::ErrorResolved) {
        return Ok(Recorded::AlreadyKnown);
    }
    if !can_transition(owner.kind, Some(active.status), ErxStatus::Error) {
        tracing::warn!(
            prescription_id = report.prescription_id,
            owner_kind = %owner.kind,
            active = %active.status,
            "Reported error does not apply to the current status, skipped"
        );
        return Ok(Recorded::AlreadyKnown);
    }

    // Never rewind: an error stamped before the active status lands at it.
    let at = max(normalize_timestamp(report.error_date), active.reported_at);
    append_status_event(
        &tx,
        owner.kind,
        &owner.id,
        &NewStatusEvent::new(ErxStatus::Error, at).with_details(report.details.clone()),
    )?;
    emit_transmission_error_item(&tx, &owner, &report.details)?;
    tx.commit()?;

    ctx.publish(PipelineEvent::TransmissionError {
        owner_kind: owner.kind,
        owner_id: owner.id,
        event_type: owner.kind.transmission_error_type(),
    });
    Ok(Recorded::Yes)
}
