use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::ErxStatus;
use super::treatment::RxDetails;

/// Denial reason code that turns a denial into a DNTF.
pub const DENIED_NEW_RX_CODE: &str = "DeniedNewRx";

/// Prescription as described by the pharmacy in a refill request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrescriptionSnapshot {
    pub prescription_id: Option<i64>,
    pub rx: RxDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefillRequest {
    pub id: Uuid,
    /// Gateway refill-queue item id. Unique; the intake idempotency key.
    pub erx_queue_item_id: i64,
    pub reference_number: Option<String>,
    pub pharmacy_rx_reference: Option<String>,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub pharmacy_id: Option<Uuid>,
    pub requested_prescription: PrescriptionSnapshot,
    pub dispensed_prescription: Option<PrescriptionSnapshot>,
    pub originating_treatment_id: Option<Uuid>,
    /// Prescription id returned by an approval or a DNTF.
    pub approved_prescription_id: Option<i64>,
    pub approved_refill_amount: Option<i64>,
    pub comments: Option<String>,
    pub denial_reason_id: Option<i64>,
    pub clinician_id: i64,
    pub request_date: NaiveDateTime,
    pub created_at: NaiveDateTime,
}

impl RefillRequest {
    pub fn requested_erx_id(&self) -> Option<i64> {
        self.requested_prescription.prescription_id
    }

    pub fn is_controlled_substance(&self) -> bool {
        self.requested_prescription.rx.is_controlled_substance
    }

    /// Prescription whose gateway status reflects this request once a
    /// decision is recorded: the approved prescription after an approval,
    /// the requested one after a denial.
    pub fn status_check_prescription_id(&self, status: ErxStatus) -> Option<i64> {
        match status {
            ErxStatus::Approved => self.approved_prescription_id,
            _ => self.requested_erx_id().or(self.approved_prescription_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenialReason {
    pub id: i64,
    pub code: String,
    pub reason: String,
}

impl DenialReason {
    pub fn is_dntf(&self) -> bool {
        self.code == DENIED_NEW_RX_CODE
    }
}

/// What a DNTF produced. Exactly one of the two, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum DntfTarget {
    Treatment(Uuid),
    UnlinkedDntfTreatment(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DntfMapping {
    pub id: Uuid,
    pub refill_request_id: Uuid,
    pub target: DntfTarget,
    pub created_at: NaiveDateTime,
}
