use thiserror::Error;

use super::types::*;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Gateway is not reachable at {0}")]
    Connection(String),

    #[error("Gateway request timed out after {0}s")]
    Timeout(u64),

    #[error("Gateway returned error (status {status}): {body}")]
    Server { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Gateway rejected request: {0}")]
    Rejected(String),

    #[error("Gateway has no record: {0}")]
    NotFound(String),

    #[error("Malformed gateway response: {0}")]
    MalformedResponse(String),
}

impl GatewayError {
    /// Worth retrying later without changing anything locally. A response
    /// that cannot be parsed says nothing about whether the call took effect,
    /// so it is retried too.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::Timeout(_)
                | Self::Server { .. }
                | Self::HttpClient(_)
                | Self::MalformedResponse(_)
        )
    }
}

/// Capability set of the external e-prescribing service. Operations taken on
/// behalf of a doctor carry the doctor's clinician id.
pub trait ErxGateway: Send + Sync {
    fn send_prescriptions(
        &self,
        request: &SendPrescriptionsRequest,
    ) -> Result<SendPrescriptionsResponse, GatewayError>;

    /// Status history of a prescription, oldest first.
    fn get_prescription_status(
        &self,
        prescription_id: i64,
    ) -> Result<Vec<GatewayStatusEvent>, GatewayError>;

    fn get_transmission_errors(
        &self,
        clinician_id: i64,
    ) -> Result<Vec<TransmissionErrorReport>, GatewayError>;

    fn get_refill_request_queue(
        &self,
        clinician_id: i64,
    ) -> Result<Vec<RefillRequestItem>, GatewayError>;

    /// Returns the id of the approved prescription.
    fn approve_refill(
        &self,
        clinician_id: i64,
        approval: &RefillApproval,
    ) -> Result<i64, GatewayError>;

    fn deny_refill(&self, clinician_id: i64, denial: &RefillDenial) -> Result<(), GatewayError>;

    /// Returns the id of the new prescription.
    fn deny_refill_with_new_rx(
        &self,
        clinician_id: i64,
        request: &DntfRequest,
    ) -> Result<i64, GatewayError>;

    /// Dismiss the transmission-error alert on a prescription.
    fn ignore_alert(&self, clinician_id: i64, prescription_id: i64) -> Result<(), GatewayError>;

    fn get_patient_details(&self, erx_patient_id: i64) -> Result<PatientDemographics, GatewayError>;

    fn get_pharmacy_details(&self, pharmacy_source_id: i64) -> Result<PharmacyRecord, GatewayError>;
}
