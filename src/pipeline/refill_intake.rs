//! Refill intake worker: drains the gateway's refill-request queue into
//! local refill requests and routes each to a doctor.

use std::cmp::min;

use rusqlite::Connection;
use uuid::Uuid;

use super::context::PipelineContext;
use super::error::PipelineError;
use crate::db::{
    append_status_event, existing_queue_item_ids, find_doctor_by_clinician_id,
    find_patient_by_erx_id, find_pharmacy_by_source, find_treatment_by_erx_id, get_treatment_plan,
    insert_doctor_queue_item, insert_patient, insert_refill_request,
    list_doctors_with_clinician_id, normalize_timestamp, now, upsert_pharmacy,
};
use crate::dispatch::PipelineEvent;
use crate::erx::RefillRequestItem;
use crate::models::{
    DoctorQueueItem, ErxStatus, NewStatusEvent, OwnerKind, Patient, PatientStatus, Pharmacy,
    QueueEventType, QueueItemKind, RefillRequest,
};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IntakeSummary {
    pub fetched: usize,
    pub created: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub failures: usize,
}

/// One pass over every clinician's refill queue. Per-item failures are
/// logged and retried on the next pass.
pub fn run_refill_intake(conn: &Connection, ctx: &PipelineContext) -> Result<IntakeSummary, PipelineError> {
    let mut summary = IntakeSummary::default();

    for doctor in list_doctors_with_clinician_id(conn)? {
        let Some(clinician_id) = doctor.clinician_id else {
            continue;
        };
        let items = match ctx.gateway.get_refill_request_queue(clinician_id) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(clinician_id, error = %e, "Could not fetch refill requests");
                summary.failures += 1;
                continue;
            }
        };

        let ids: Vec<i64> = items.iter().map(|i| i.queue_item_id).collect();
        let existing = existing_queue_item_ids(conn, &ids)?;

        for item in &items {
            summary.fetched += 1;
            if existing.contains(&item.queue_item_id) {
                summary.duplicates += 1;
                continue;
            }
            match intake_refill_item(conn, ctx, item) {
                Ok(Some(_)) => summary.created += 1,
                Ok(None) => summary.skipped += 1,
                Err(PipelineError::DuplicateIntake(_)) => summary.duplicates += 1,
                Err(e) => {
                    tracing::warn!(
                        queue_item_id = item.queue_item_id,
                        error = %e,
                        "Refill intake failed for item"
                    );
                    summary.failures += 1;
                }
            }
        }
    }

    tracing::info!(
        fetched = summary.fetched,
        created = summary.created,
        duplicates = summary.duplicates,
        failures = summary.failures,
        "Refill intake cycle complete"
    );
    Ok(summary)
}

/// Store one gateway refill item. Returns `None` when the item carries no
/// requested prescription and is skipped.
pub fn intake_refill_item(
    conn: &Connection,
    ctx: &PipelineContext,
    item: &RefillRequestItem,
) -> Result<Option<RefillRequest>, PipelineError> {
    let Some(requested) = item.requested_prescription.clone() else {
        tracing::warn!(queue_item_id = item.queue_item_id, "Refill item has no requested prescription");
        return Ok(None);
    };

    let (patient, is_new_patient) = match find_patient_by_erx_id(conn, item.erx_patient_id)? {
        Some(patient) => (patient, false),
        None => (unlinked_patient_shell(conn, ctx, item.erx_patient_id)?, true),
    };

    let pharmacy = item
        .pharmacy_source_id
        .map(|source_id| resolve_pharmacy(conn, ctx, source_id))
        .transpose()?;

    let mut originating = None;
    if let (true, Some(prescription_id)) = (patient.is_registered(), requested.prescription_id) {
        if let Some(treatment) = find_treatment_by_erx_id(conn, prescription_id)? {
            let plan = get_treatment_plan(conn, &treatment.treatment_plan_id)?;
            if plan.patient_id == patient.id {
                originating = Some((treatment.id, plan.doctor_id));
            }
        }
    }

    let doctor_id = match originating {
        Some((_, doctor_id)) => doctor_id,
        None => {
            find_doctor_by_clinician_id(conn, item.clinician_id)?
                .ok_or_else(|| PipelineError::NotFound {
                    entity_type: "doctor with clinician id".into(),
                    id: item.clinician_id.to_string(),
                })?
                .id
        }
    };

    let at = now();
    let refill = RefillRequest {
        id: Uuid::new_v4(),
        erx_queue_item_id: item.queue_item_id,
        reference_number: item.reference_number.clone(),
        pharmacy_rx_reference: item.pharmacy_rx_reference.clone(),
        patient_id: patient.id,
        doctor_id,
        pharmacy_id: pharmacy.as_ref().map(|p| p.id),
        requested_prescription: requested,
        dispensed_prescription: item.dispensed_prescription.clone(),
        originating_treatment_id: originating.map(|(id, _)| id),
        approved_prescription_id: None,
        approved_refill_amount: None,
        comments: None,
        denial_reason_id: None,
        clinician_id: item.clinician_id,
        request_date: normalize_timestamp(item.request_date),
        created_at: at,
    };

    let tx = conn.unchecked_transaction()?;
    if is_new_patient {
        insert_patient(&tx, &patient)?;
    }
    if !insert_refill_request(&tx, &refill)? {
        return Err(PipelineError::DuplicateIntake(item.queue_item_id));
    }
    append_status_event(
        &tx,
        OwnerKind::RefillRequest,
        &refill.id,
        &NewStatusEvent::new(ErxStatus::Requested, min(refill.request_date, at)),
    )?;
    let queue_item = DoctorQueueItem::pending(
        doctor_id,
        QueueEventType::RefillRequest,
        refill.id,
        QueueItemKind::RefillRequest,
        at,
    )
    .with_description(refill.requested_prescription.rx.drug_internal_name.clone());
    insert_doctor_queue_item(&tx, &queue_item)?;
    tx.commit()?;

    tracing::info!(
        queue_item_id = item.queue_item_id,
        refill_request_id = %refill.id,
        %doctor_id,
        linked = refill.originating_treatment_id.is_some(),
        unlinked_patient = !patient.is_registered(),
        "Refill request stored"
    );
    ctx.publish(PipelineEvent::RefillRequestCreated {
        refill_request_id: refill.id,
        doctor_id,
    });
    Ok(Some(refill))
}

/// Build (not store) an Unlinked patient from the gateway's demographics.
fn unlinked_patient_shell(
    conn: &Connection,
    ctx: &PipelineContext,
    erx_patient_id: i64,
) -> Result<Patient, PipelineError> {
    let details = ctx.gateway.get_patient_details(erx_patient_id)?;
    let preferred = details
        .preferred_pharmacy_source_id
        .map(|source_id| resolve_pharmacy(conn, ctx, source_id))
        .transpose()?;

    Ok(Patient {
        id: Uuid::new_v4(),
        erx_patient_id: Some(erx_patient_id),
        first_name: details.first_name,
        last_name: details.last_name,
        date_of_birth: details.date_of_birth,
        gender: details.gender,
        phone: details.phone,
        address: details.address,
        status: PatientStatus::Unlinked,
        preferred_pharmacy_id: preferred.map(|p| p.id),
        created_at: now(),
    })
}

/// Local pharmacy for a source id, fetched from the gateway on first sight.
pub fn resolve_pharmacy(
    conn: &Connection,
    ctx: &PipelineContext,
    source_id: i64,
) -> Result<Pharmacy, PipelineError> {
    let source = &ctx.config.pharmacy_source;
    if let Some(pharmacy) = find_pharmacy_by_source(conn, source, source_id)? {
        return Ok(pharmacy);
    }
    let record = ctx.gateway.get_pharmacy_details(source_id)?;
    let pharmacy = upsert_pharmacy(
        conn,
        &Pharmacy {
            id: Uuid::new_v4(),
            source: source.clone(),
            source_id,
            name: record.name,
            address: record.address,
            phone: record.phone,
        },
    )?;
    tracing::debug!(source_id, pharmacy_id = %pharmacy.id, "Pharmacy added");
    Ok(pharmacy)
}
