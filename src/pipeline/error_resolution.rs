//! Doctor acknowledgement of a transmission error.

use std::cmp::max;

use rusqlite::Connection;
use uuid::Uuid;

use super::context::PipelineContext;
use super::error::PipelineError;
use crate::db::{
    append_status_event, complete_pending_queue_item, get_active_status_event, get_doctor,
    get_prescription_owner, get_refill_request, get_treatment, get_unlinked_dntf_treatment, now,
    PrescriptionOwner,
};
use crate::dispatch::PipelineEvent;
use crate::models::{ErxStatus, NewStatusEvent, OwnerKind, QueueItemStatus};

/// Move an owner from Error to ErrorResolved, dismiss the gateway alert and
/// close the doctor's pending transmission-error item. Resolving twice is a
/// no-op.
pub fn resolve_transmission_error(
    conn: &Connection,
    ctx: &PipelineContext,
    owner_kind: OwnerKind,
    owner_id: &Uuid,
) -> Result<ErxStatus, PipelineError> {
    let owner = get_prescription_owner(conn, owner_kind, owner_id)?;
    let active = get_active_status_event(conn, owner_kind, owner_id)?;

    let active = match active {
        Some(event) if event.status == ErxStatus::ErrorResolved => {
            tracing::debug!(owner_kind = %owner_kind, owner_id = %owner_id, "Error already resolved");
            return Ok(ErxStatus::ErrorResolved);
        }
        Some(event) if event.status == ErxStatus::Error => event,
        other => {
            return Err(PipelineError::InvalidTransition(format!(
                "{owner_kind} {owner_id} is {} and has no error to resolve",
                other.map_or("without status", |e| e.status.as_str())
            )));
        }
    };

    if let Some(prescription_id) = owner_prescription_id(conn, &owner)? {
        let doctor = get_doctor(conn, &owner.doctor_id)?;
        match doctor.clinician_id {
            Some(clinician_id) => ctx.gateway.ignore_alert(clinician_id, prescription_id)?,
            None => tracing::warn!(
                doctor_id = %owner.doctor_id,
                prescription_id,
                "Doctor has no clinician id; gateway alert left in place"
            ),
        }
    }

    let at = now();
    let tx = conn.unchecked_transaction()?;
    append_status_event(
        &tx,
        owner_kind,
        owner_id,
        &NewStatusEvent::new(ErxStatus::ErrorResolved, max(at, active.reported_at)),
    )?;
    let closed = complete_pending_queue_item(
        &tx,
        owner_kind.transmission_error_type(),
        owner_id,
        QueueItemStatus::ErrorResolved,
        &at,
    )?;
    tx.commit()?;

    if !closed {
        tracing::warn!(owner_kind = %owner_kind, owner_id = %owner_id, "No pending error item to close");
    }
    tracing::info!(owner_kind = %owner_kind, owner_id = %owner_id, "Transmission error resolved");
    ctx.publish(PipelineEvent::TransmissionErrorResolved {
        owner_kind,
        owner_id: *owner_id,
    });
    Ok(ErxStatus::ErrorResolved)
}

fn owner_prescription_id(
    conn: &Connection,
    owner: &PrescriptionOwner,
) -> Result<Option<i64>, PipelineError> {
    Ok(match owner.kind {
        OwnerKind::Treatment => get_treatment(conn, &owner.id)?.erx_id,
        OwnerKind::UnlinkedDntfTreatment => get_unlinked_dntf_treatment(conn, &owner.id)?.erx_id,
        OwnerKind::RefillRequest => {
            let refill = get_refill_request(conn, &owner.id)?;
            refill.approved_prescription_id.or(refill.requested_erx_id())
        }
    })
}
