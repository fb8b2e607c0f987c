//! Prescription router: delivers a submitted treatment plan to the gateway
//! and starts status polling for every routed treatment.

use rusqlite::Connection;
use uuid::Uuid;

use super::context::PipelineContext;
use super::error::PipelineError;
use super::status::{schedule_first_checks, with_jitter};
use super::transmission_errors::emit_transmission_error_item;
use crate::db::{
    append_status_event, get_active_status, get_doctor, get_patient, get_pharmacy,
    get_treatment_plan, get_treatments_for_plan, mark_treatment_routed, now,
    set_patient_erx_id, set_treatment_plan_status, PrescriptionOwner,
};
use crate::dispatch::PipelineEvent;
use crate::erx::{
    GatewayError, OutboundPrescription, PatientDemographics, SendPrescriptionsRequest,
    SendPrescriptionsResponse,
};
use crate::models::{
    ControlledSubstancePolicy, ErxStatus, NewStatusEvent, OwnerKind, Patient, Pharmacy,
    StatusTarget, Treatment, TreatmentPlanStatus,
};
use crate::queue::{QueueMessage, ReceivedMessage};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RoutingOutcome {
    /// Treatments now Sending, with their status-check targets.
    pub routed: Vec<StatusTarget>,
    /// Treatments the gateway refused; each is in Error.
    pub rejected: Vec<Uuid>,
    /// Controlled treatments left Entered under `SkipControlled`.
    pub skipped_controlled: Vec<Uuid>,
    /// Treatments that already carried a prescription id.
    pub already_routed: usize,
}

/// Route every unrouted treatment of a plan. Re-running after success is a
/// no-op.
pub fn route_treatment_plan(
    conn: &Connection,
    ctx: &PipelineContext,
    treatment_plan_id: &Uuid,
    doctor_id: &Uuid,
    patient_id: &Uuid,
) -> Result<RoutingOutcome, PipelineError> {
    let plan = get_treatment_plan(conn, treatment_plan_id)?;
    if plan.doctor_id != *doctor_id || plan.patient_id != *patient_id {
        return Err(PipelineError::NotOwned {
            doctor_id: *doctor_id,
            item: format!("treatment plan {treatment_plan_id}"),
        });
    }

    let treatments = get_treatments_for_plan(conn, treatment_plan_id)?;
    let patient = get_patient(conn, patient_id)?;
    let doctor = get_doctor(conn, doctor_id)?;
    let clinician_id = doctor.clinician_id.ok_or_else(|| {
        PipelineError::Validation(format!("doctor {doctor_id} has no clinician id"))
    })?;
    let pharmacy_id = patient
        .preferred_pharmacy_id
        .ok_or(PipelineError::PatientHasNoPharmacy(patient.id))?;
    let pharmacy = get_pharmacy(conn, &pharmacy_id)?;

    let mut outcome = RoutingOutcome::default();
    let mut to_route = Vec::new();
    for treatment in treatments {
        if treatment.erx_id.is_some() {
            outcome.already_routed += 1;
            continue;
        }
        let status = get_active_status(conn, OwnerKind::Treatment, &treatment.id)?;
        if status != Some(ErxStatus::Entered) {
            return Err(PipelineError::InvalidTransition(format!(
                "treatment {} is {} and cannot be routed",
                treatment.id,
                status.map_or("without status", |s| s.as_str())
            )));
        }
        to_route.push(treatment);
    }

    let (controlled, mut to_route): (Vec<_>, Vec<_>) = to_route
        .into_iter()
        .partition(|t| t.rx.is_controlled_substance);
    if !controlled.is_empty() {
        match ctx.config.controlled_substance_policy {
            ControlledSubstancePolicy::RejectPlan => {
                return Err(PipelineError::ControlledSubstanceBlocked(format!(
                    "treatment plan {treatment_plan_id} contains {} controlled substance(s)",
                    controlled.len()
                )));
            }
            ControlledSubstancePolicy::SkipControlled => {
                outcome.skipped_controlled = controlled.iter().map(|t| t.id).collect();
            }
        }
    }

    if to_route.is_empty() {
        tracing::debug!(%treatment_plan_id, "Nothing left to route");
        return Ok(outcome);
    }

    let request = SendPrescriptionsRequest {
        clinician_id,
        patient: demographics(&patient, &pharmacy),
        pharmacy_source_id: pharmacy.source_id,
        prescriptions: to_route
            .iter()
            .map(|t| OutboundPrescription {
                treatment_id: t.id,
                rx: t.rx.clone(),
            })
            .collect(),
    };

    let response = match ctx.gateway.send_prescriptions(&request) {
        Ok(response) => response,
        Err(GatewayError::Rejected(reason)) => {
            tracing::warn!(%treatment_plan_id, %reason, "Gateway rejected the whole plan");
            SendPrescriptionsResponse {
                erx_patient_id: None,
                assigned: Vec::new(),
                rejected: to_route
                    .iter()
                    .map(|t| crate::erx::RejectedPrescription {
                        treatment_id: t.id,
                        prescription_id: None,
                        reason: reason.clone(),
                    })
                    .collect(),
            }
        }
        Err(e) => return Err(e.into()),
    };

    let sent_at = now();
    let tx = conn.unchecked_transaction()?;
    for treatment in to_route.drain(..) {
        if let Some(prescription_id) = response.prescription_id_for(&treatment.id) {
            mark_treatment_routed(&tx, &treatment.id, prescription_id, &pharmacy.id, &sent_at)?;
            append_status_event(
                &tx,
                OwnerKind::Treatment,
                &treatment.id,
                &NewStatusEvent::new(ErxStatus::Sending, sent_at),
            )?;
            outcome.routed.push(StatusTarget {
                prescription_id,
                owner_kind: OwnerKind::Treatment,
                owner_id: treatment.id,
            });
        } else {
            let reason = response
                .rejected
                .iter()
                .find(|r| r.treatment_id == treatment.id)
                .map(|r| (r.prescription_id, r.reason.clone()))
                .unwrap_or((None, "gateway assigned no prescription id".into()));
            record_rejection(&tx, &plan.doctor_id, &treatment, &pharmacy, reason, &sent_at)?;
            outcome.rejected.push(treatment.id);
        }
    }
    set_treatment_plan_status(&tx, treatment_plan_id, TreatmentPlanStatus::Active)?;
    if let (None, Some(erx_patient_id)) = (patient.erx_patient_id, response.erx_patient_id) {
        set_patient_erx_id(&tx, &patient.id, erx_patient_id)?;
    }
    tx.commit()?;

    tracing::info!(
        %treatment_plan_id,
        routed = outcome.routed.len(),
        rejected = outcome.rejected.len(),
        "Treatment plan routed"
    );

    schedule_first_checks(conn, ctx, &outcome.routed);

    for treatment_id in &outcome.rejected {
        ctx.publish(PipelineEvent::TransmissionError {
            owner_kind: OwnerKind::Treatment,
            owner_id: *treatment_id,
            event_type: OwnerKind::Treatment.transmission_error_type(),
        });
    }
    ctx.publish(PipelineEvent::TreatmentPlanRouted {
        treatment_plan_id: *treatment_plan_id,
        routed: outcome.routed.len(),
        rejected: outcome.rejected.len(),
    });
    Ok(outcome)
}

fn record_rejection(
    conn: &Connection,
    doctor_id: &Uuid,
    treatment: &Treatment,
    pharmacy: &Pharmacy,
    (prescription_id, reason): (Option<i64>, String),
    at: &chrono::NaiveDateTime,
) -> Result<(), PipelineError> {
    tracing::warn!(treatment_id = %treatment.id, %reason, "Gateway rejected treatment");
    if let Some(prescription_id) = prescription_id {
        mark_treatment_routed(conn, &treatment.id, prescription_id, &pharmacy.id, at)?;
    }
    append_status_event(
        conn,
        OwnerKind::Treatment,
        &treatment.id,
        &NewStatusEvent::new(ErxStatus::Sending, *at),
    )?;
    append_status_event(
        conn,
        OwnerKind::Treatment,
        &treatment.id,
        &NewStatusEvent::new(ErxStatus::Error, *at).with_details(reason.clone()),
    )?;
    let owner = PrescriptionOwner {
        kind: OwnerKind::Treatment,
        id: treatment.id,
        doctor_id: *doctor_id,
    };
    emit_transmission_error_item(conn, &owner, &reason)?;
    Ok(())
}

fn demographics(patient: &Patient, pharmacy: &Pharmacy) -> PatientDemographics {
    PatientDemographics {
        erx_patient_id: patient.erx_patient_id,
        first_name: patient.first_name.clone(),
        last_name: patient.last_name.clone(),
        date_of_birth: patient.date_of_birth,
        gender: patient.gender.clone(),
        phone: patient.phone.clone(),
        address: patient.address.clone(),
        preferred_pharmacy_source_id: Some(pharmacy.source_id),
    }
}

// ═══════════════════════════════════════════════════════════
// Consumer
// ═══════════════════════════════════════════════════════════

/// Receive and route one batch from the routing queue. Returns how many
/// messages were received.
pub fn process_routing_batch(conn: &Connection, ctx: &PipelineContext) -> Result<usize, PipelineError> {
    let received = ctx
        .routing_queue
        .receive(ctx.config.receive_batch_size, ctx.config.visibility_timeout)?;
    for message in &received {
        if let Err(e) = handle_routing_message(conn, ctx, message) {
            tracing::error!(error = %e, "Routing message handling failed");
        }
    }
    Ok(received.len())
}

pub fn handle_routing_message(
    conn: &Connection,
    ctx: &PipelineContext,
    received: &ReceivedMessage,
) -> Result<(), PipelineError> {
    let (plan_id, doctor_id, patient_id) = match received.decode() {
        Ok(QueueMessage::RouteTreatmentPlan {
            treatment_plan_id,
            doctor_id,
            patient_id,
        }) => (treatment_plan_id, doctor_id, patient_id),
        Ok(other) => {
            tracing::warn!(message = ?other, "Dropping non-routing message from routing queue");
            ctx.routing_queue.delete(&received.receipt)?;
            return Ok(());
        }
        Err(e) => {
            tracing::warn!(error = %e, body = %received.body, "Dropping malformed routing message");
            ctx.routing_queue.delete(&received.receipt)?;
            return Ok(());
        }
    };

    match route_treatment_plan(conn, ctx, &plan_id, &doctor_id, &patient_id) {
        Ok(_) => {
            ctx.routing_queue.delete(&received.receipt)?;
        }
        Err(e) if e.is_retryable() => {
            let delay = with_jitter(ctx.config.status_backoff(received.receive_count));
            tracing::warn!(
                treatment_plan_id = %plan_id,
                error = %e,
                retry_in_secs = delay.as_secs(),
                "Routing failed, will retry"
            );
            ctx.routing_queue.release(&received.receipt, delay)?;
        }
        Err(e) => {
            tracing::error!(treatment_plan_id = %plan_id, error = %e, "Routing failed permanently");
            ctx.routing_queue.delete(&received.receipt)?;
        }
    }
    Ok(())
}
