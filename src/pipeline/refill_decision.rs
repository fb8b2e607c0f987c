//! Doctor decisions on refill requests: approve, deny, and deny with a new
//! prescription to follow (DNTF).

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::context::PipelineContext;
use super::error::PipelineError;
use super::status::schedule_first_checks;
use crate::db::{
    append_status_event, complete_pending_queue_item, get_active_status, get_denial_reason,
    get_dntf_mapping_for_refill, get_doctor, get_patient, get_pharmacy, get_refill_request,
    get_treatment, get_treatment_template, insert_dntf_mapping, insert_treatment,
    insert_unlinked_dntf_treatment, now, record_refill_approval, record_refill_denial,
};
use crate::dispatch::PipelineEvent;
use crate::erx::{DntfRequest, RefillApproval, RefillDenial};
use crate::models::{
    DenialReason, DntfMapping, DntfTarget, ErxStatus, NewStatusEvent, OwnerKind, QueueEventType,
    QueueItemStatus, RefillRequest, RxDetails, StatusTarget, Treatment, UnlinkedDntfTreatment,
};

pub const MAX_COMMENT_CHARS: usize = 70;
pub const MAX_REFILL_AMOUNT: i64 = 99;

/// Replacement treatment for a DNTF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DntfTreatment {
    Freeform { rx: RxDetails },
    Template { template_id: Uuid },
}

/// What a decision left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct RefillDecision {
    pub refill_request_id: Uuid,
    pub status: ErxStatus,
    /// Approved prescription, or the new prescription of a DNTF.
    pub prescription_id: Option<i64>,
    pub dntf_target: Option<DntfTarget>,
}

// ═══════════════════════════════════════════════════════════
// Approve
// ═══════════════════════════════════════════════════════════

pub fn approve_refill(
    conn: &Connection,
    ctx: &PipelineContext,
    doctor_id: &Uuid,
    refill_request_id: &Uuid,
    amount: i64,
    comments: Option<&str>,
) -> Result<RefillDecision, PipelineError> {
    let (refill, status) = load_for_decision(conn, doctor_id, refill_request_id, comments)?;
    if status == Some(ErxStatus::Approved) {
        return Ok(recorded_decision(&refill, ErxStatus::Approved, None));
    }
    require_requested(&refill, status)?;

    if !(1..=MAX_REFILL_AMOUNT).contains(&amount) {
        return Err(PipelineError::Validation(format!(
            "approved refill amount must be between 1 and {MAX_REFILL_AMOUNT}, got {amount}"
        )));
    }
    if refill.is_controlled_substance() {
        return Err(PipelineError::ControlledSubstanceBlocked(format!(
            "refill request {} is for a controlled substance",
            refill.id
        )));
    }

    let clinician_id = clinician_id(conn, doctor_id)?;
    let prescription_id = ctx.gateway.approve_refill(
        clinician_id,
        &RefillApproval {
            queue_item_id: refill.erx_queue_item_id,
            amount,
            comments: comments.map(String::from),
        },
    )?;

    let at = now();
    let tx = conn.unchecked_transaction()?;
    record_refill_approval(&tx, &refill.id, prescription_id, amount, comments)?;
    append_status_event(
        &tx,
        OwnerKind::RefillRequest,
        &refill.id,
        &NewStatusEvent::new(ErxStatus::Approved, at),
    )?;
    complete_refill_queue_item(&tx, &refill.id, QueueItemStatus::RefillApproved, &at)?;
    tx.commit()?;

    tracing::info!(refill_request_id = %refill.id, prescription_id, amount, "Refill approved");
    schedule_first_checks(
        conn,
        ctx,
        &[StatusTarget {
            prescription_id,
            owner_kind: OwnerKind::RefillRequest,
            owner_id: refill.id,
        }],
    );
    ctx.publish(PipelineEvent::RefillRequestResolved {
        refill_request_id: refill.id,
        approved: true,
    });

    Ok(RefillDecision {
        refill_request_id: refill.id,
        status: ErxStatus::Approved,
        prescription_id: Some(prescription_id),
        dntf_target: None,
    })
}

// ═══════════════════════════════════════════════════════════
// Deny
// ═══════════════════════════════════════════════════════════

pub fn deny_refill(
    conn: &Connection,
    ctx: &PipelineContext,
    doctor_id: &Uuid,
    refill_request_id: &Uuid,
    denial_reason_id: i64,
    comments: Option<&str>,
) -> Result<RefillDecision, PipelineError> {
    let (refill, status) = load_for_decision(conn, doctor_id, refill_request_id, comments)?;
    let reason = get_denial_reason(conn, denial_reason_id)?;
    if reason.is_dntf() {
        return Err(PipelineError::Validation(
            "a new-prescription-to-follow denial needs a treatment".into(),
        ));
    }
    if status == Some(ErxStatus::Denied) && get_dntf_mapping_for_refill(conn, &refill.id)?.is_none() {
        return Ok(recorded_decision(&refill, ErxStatus::Denied, None));
    }
    require_requested(&refill, status)?;

    let clinician_id = clinician_id(conn, doctor_id)?;
    ctx.gateway.deny_refill(
        clinician_id,
        &RefillDenial {
            queue_item_id: refill.erx_queue_item_id,
            denial_reason_code: reason.code.clone(),
            comments: comments.map(String::from),
        },
    )?;

    let at = now();
    let tx = conn.unchecked_transaction()?;
    record_refill_denial(&tx, &refill.id, reason.id, comments, None)?;
    append_status_event(
        &tx,
        OwnerKind::RefillRequest,
        &refill.id,
        &NewStatusEvent::new(ErxStatus::Denied, at),
    )?;
    complete_refill_queue_item(&tx, &refill.id, QueueItemStatus::RefillDenied, &at)?;
    tx.commit()?;

    tracing::info!(refill_request_id = %refill.id, reason = %reason.code, "Refill denied");
    // The gateway follows a denial with Deleted on the requested prescription.
    if let Some(prescription_id) = refill.status_check_prescription_id(ErxStatus::Denied) {
        schedule_first_checks(
            conn,
            ctx,
            &[StatusTarget {
                prescription_id,
                owner_kind: OwnerKind::RefillRequest,
                owner_id: refill.id,
            }],
        );
    } else {
        tracing::warn!(
            refill_request_id = %refill.id,
            queue_item_id = refill.erx_queue_item_id,
            "Denied refill has no requested prescription id, its status will not be polled"
        );
    }
    ctx.publish(PipelineEvent::RefillRequestResolved {
        refill_request_id: refill.id,
        approved: false,
    });

    Ok(RefillDecision {
        refill_request_id: refill.id,
        status: ErxStatus::Denied,
        prescription_id: None,
        dntf_target: None,
    })
}

// ═══════════════════════════════════════════════════════════
// Deny with new prescription to follow
// ═══════════════════════════════════════════════════════════

pub fn deny_refill_with_new_rx(
    conn: &Connection,
    ctx: &PipelineContext,
    doctor_id: &Uuid,
    refill_request_id: &Uuid,
    denial_reason_id: i64,
    comments: Option<&str>,
    treatment: Option<DntfTreatment>,
) -> Result<RefillDecision, PipelineError> {
    let (refill, status) = load_for_decision(conn, doctor_id, refill_request_id, comments)?;
    let reason = get_denial_reason(conn, denial_reason_id)?;
    if !reason.is_dntf() {
        return Err(PipelineError::Validation(format!(
            "denial reason {} is not a new-prescription-to-follow reason",
            reason.code
        )));
    }
    if status == Some(ErxStatus::Denied) {
        if let Some(mapping) = get_dntf_mapping_for_refill(conn, &refill.id)? {
            return Ok(recorded_decision(&refill, ErxStatus::Denied, Some(mapping.target)));
        }
    }
    require_requested(&refill, status)?;

    let rx = resolve_dntf_treatment(conn, doctor_id, treatment.ok_or(PipelineError::MissingTreatment)?)?;
    if refill.reference_number.as_deref().map_or(true, |r| r.trim().is_empty()) {
        return Err(PipelineError::Validation(format!(
            "refill request {} has no reference number",
            refill.id
        )));
    }

    let patient = get_patient(conn, &refill.patient_id)?;
    let pharmacy_id = refill.pharmacy_id.or(patient.preferred_pharmacy_id);
    let pharmacy_source_id = pharmacy_id
        .map(|id| get_pharmacy(conn, &id))
        .transpose()?
        .map(|p| p.source_id);

    let clinician_id = clinician_id(conn, doctor_id)?;
    let prescription_id = ctx.gateway.deny_refill_with_new_rx(
        clinician_id,
        &DntfRequest {
            queue_item_id: refill.erx_queue_item_id,
            denial_reason_code: reason.code.clone(),
            comments: comments.map(String::from),
            erx_patient_id: patient.erx_patient_id,
            pharmacy_source_id,
            treatment: rx.clone(),
        },
    )?;

    let at = now();
    let tx = conn.unchecked_transaction()?;
    let target = match refill.originating_treatment_id {
        Some(originating_id) => {
            let originating = get_treatment(&tx, &originating_id)?;
            let treatment = Treatment {
                id: Uuid::new_v4(),
                treatment_plan_id: originating.treatment_plan_id,
                rx,
                erx_id: Some(prescription_id),
                pharmacy_id,
                erx_sent_date: Some(at),
                created_at: at,
            };
            insert_treatment(&tx, &treatment)?;
            DntfTarget::Treatment(treatment.id)
        }
        None => {
            let treatment = UnlinkedDntfTreatment {
                id: Uuid::new_v4(),
                patient_id: patient.id,
                doctor_id: *doctor_id,
                rx,
                erx_id: Some(prescription_id),
                pharmacy_id,
                erx_sent_date: Some(at),
                created_at: at,
            };
            insert_unlinked_dntf_treatment(&tx, &treatment)?;
            DntfTarget::UnlinkedDntfTreatment(treatment.id)
        }
    };
    let (owner_kind, owner_id) = match target {
        DntfTarget::Treatment(id) => (OwnerKind::Treatment, id),
        DntfTarget::UnlinkedDntfTreatment(id) => (OwnerKind::UnlinkedDntfTreatment, id),
    };
    for status in [ErxStatus::NewRxFromDntf, ErxStatus::Sending] {
        append_status_event(&tx, owner_kind, &owner_id, &NewStatusEvent::new(status, at))?;
    }

    insert_dntf_mapping(
        &tx,
        &DntfMapping {
            id: Uuid::new_v4(),
            refill_request_id: refill.id,
            target,
            created_at: at,
        },
    )?;
    record_refill_denial(&tx, &refill.id, reason.id, comments, Some(prescription_id))?;
    append_status_event(
        &tx,
        OwnerKind::RefillRequest,
        &refill.id,
        &NewStatusEvent::new(ErxStatus::Denied, at),
    )?;
    complete_refill_queue_item(&tx, &refill.id, QueueItemStatus::RefillDenied, &at)?;
    tx.commit()?;

    tracing::info!(
        refill_request_id = %refill.id,
        prescription_id,
        owner_kind = %owner_kind,
        "Refill denied with new prescription to follow"
    );
    schedule_first_checks(
        conn,
        ctx,
        &[StatusTarget {
            prescription_id,
            owner_kind,
            owner_id,
        }],
    );
    ctx.publish(PipelineEvent::RefillRequestResolved {
        refill_request_id: refill.id,
        approved: false,
    });

    Ok(RefillDecision {
        refill_request_id: refill.id,
        status: ErxStatus::Denied,
        prescription_id: Some(prescription_id),
        dntf_target: Some(target),
    })
}

/// Validated rx for a DNTF, from a freeform payload or one of the doctor's
/// templates.
pub fn resolve_dntf_treatment(
    conn: &Connection,
    doctor_id: &Uuid,
    treatment: DntfTreatment,
) -> Result<RxDetails, PipelineError> {
    let rx = match treatment {
        DntfTreatment::Freeform { rx } => rx,
        DntfTreatment::Template { template_id } => {
            let template = get_treatment_template(conn, &template_id)?;
            if template.doctor_id != *doctor_id {
                return Err(PipelineError::NotOwned {
                    doctor_id: *doctor_id,
                    item: format!("treatment template {template_id}"),
                });
            }
            template.rx
        }
    };

    let rx = rx.with_name_components();
    rx.validate().map_err(PipelineError::InvalidTreatment)?;
    if rx.is_controlled_substance {
        return Err(PipelineError::ControlledSubstanceBlocked(format!(
            "{} is a controlled substance",
            rx.drug_internal_name
        )));
    }
    Ok(rx)
}

// ═══════════════════════════════════════════════════════════
// Shared checks
// ═══════════════════════════════════════════════════════════

fn load_for_decision(
    conn: &Connection,
    doctor_id: &Uuid,
    refill_request_id: &Uuid,
    comments: Option<&str>,
) -> Result<(RefillRequest, Option<ErxStatus>), PipelineError> {
    if let Some(comments) = comments {
        let len = comments.chars().count();
        if len > MAX_COMMENT_CHARS {
            return Err(PipelineError::Validation(format!(
                "comments are limited to {MAX_COMMENT_CHARS} characters, got {len}"
            )));
        }
    }

    let refill = get_refill_request(conn, refill_request_id)?;
    if refill.doctor_id != *doctor_id {
        return Err(PipelineError::NotOwned {
            doctor_id: *doctor_id,
            item: format!("refill request {refill_request_id}"),
        });
    }
    let status = get_active_status(conn, OwnerKind::RefillRequest, &refill.id)?;
    Ok((refill, status))
}

fn require_requested(refill: &RefillRequest, status: Option<ErxStatus>) -> Result<(), PipelineError> {
    if status == Some(ErxStatus::Requested) {
        return Ok(());
    }
    Err(PipelineError::InvalidTransition(format!(
        "refill request {} is {} and no longer awaits a decision",
        refill.id,
        status.map_or("without status", |s| s.as_str())
    )))
}

fn clinician_id(conn: &Connection, doctor_id: &Uuid) -> Result<i64, PipelineError> {
    get_doctor(conn, doctor_id)?
        .clinician_id
        .ok_or_else(|| PipelineError::Validation(format!("doctor {doctor_id} has no clinician id")))
}

fn complete_refill_queue_item(
    conn: &Connection,
    refill_id: &Uuid,
    status: QueueItemStatus,
    at: &chrono::NaiveDateTime,
) -> Result<(), PipelineError> {
    if !complete_pending_queue_item(conn, QueueEventType::RefillRequest, refill_id, status, at)? {
        tracing::debug!(refill_request_id = %refill_id, "No pending queue item to complete");
    }
    Ok(())
}

fn recorded_decision(
    refill: &RefillRequest,
    status: ErxStatus,
    dntf_target: Option<DntfTarget>,
) -> RefillDecision {
    RefillDecision {
        refill_request_id: refill.id,
        status,
        prescription_id: refill.approved_prescription_id,
        dntf_target,
    }
}

/// Denial reasons a doctor can pick from, the DNTF sentinel included.
pub fn denial_reasons(conn: &Connection) -> Result<Vec<DenialReason>, PipelineError> {
    Ok(crate::db::list_denial_reasons(conn)?)
}
