//! Request and response shapes exchanged with the e-prescribing gateway.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Address, ErxStatus, PrescriptionSnapshot, RxDetails};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientDemographics {
    pub erx_patient_id: Option<i64>,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Address,
    pub preferred_pharmacy_source_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PharmacyRecord {
    pub source_id: i64,
    pub name: String,
    #[serde(default)]
    pub address: Address,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundPrescription {
    pub treatment_id: Uuid,
    pub rx: RxDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendPrescriptionsRequest {
    pub clinician_id: i64,
    pub patient: PatientDemographics,
    pub pharmacy_source_id: i64,
    pub prescriptions: Vec<OutboundPrescription>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignedPrescription {
    pub treatment_id: Uuid,
    pub prescription_id: i64,
}

/// A treatment the gateway accepted into the batch but refused to transmit.
/// It still carries a prescription id so its error can be tracked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedPrescription {
    pub treatment_id: Uuid,
    pub prescription_id: Option<i64>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendPrescriptionsResponse {
    /// Patient id the gateway holds for this patient, assigned on first send.
    pub erx_patient_id: Option<i64>,
    #[serde(default)]
    pub assigned: Vec<AssignedPrescription>,
    #[serde(default)]
    pub rejected: Vec<RejectedPrescription>,
}

impl SendPrescriptionsResponse {
    pub fn prescription_id_for(&self, treatment_id: &Uuid) -> Option<i64> {
        self.assigned
            .iter()
            .find(|a| a.treatment_id == *treatment_id)
            .map(|a| a.prescription_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayStatusEvent {
    pub status: ErxStatus,
    pub details: Option<String>,
    pub reported_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransmissionErrorReport {
    pub prescription_id: i64,
    pub details: String,
    pub error_date: NaiveDateTime,
}

/// One pending item in the gateway's refill-request queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefillRequestItem {
    pub queue_item_id: i64,
    pub reference_number: Option<String>,
    pub pharmacy_rx_reference: Option<String>,
    pub erx_patient_id: i64,
    pub clinician_id: i64,
    pub pharmacy_source_id: Option<i64>,
    pub requested_prescription: Option<PrescriptionSnapshot>,
    pub dispensed_prescription: Option<PrescriptionSnapshot>,
    pub request_date: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefillApproval {
    pub queue_item_id: i64,
    pub amount: i64,
    pub comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefillDenial {
    pub queue_item_id: i64,
    pub denial_reason_code: String,
    pub comments: Option<String>,
}

/// Deny-with-new-prescription: the denial plus the replacement treatment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DntfRequest {
    pub queue_item_id: i64,
    pub denial_reason_code: String,
    pub comments: Option<String>,
    pub erx_patient_id: Option<i64>,
    pub pharmacy_source_id: Option<i64>,
    pub treatment: RxDetails,
}
