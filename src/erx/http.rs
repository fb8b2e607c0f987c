//! JSON-over-HTTP gateway client.

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::gateway::{ErxGateway, GatewayError};
use super::types::*;

const API_KEY_HEADER: &str = "X-Api-Key";

/// Blocking HTTP client for the e-prescribing gateway.
pub struct HttpErxGateway {
    base_url: String,
    api_key: Option<String>,
    client: Client,
    timeout_secs: u64,
}

#[derive(Serialize)]
struct IgnoreAlertRequest {
    clinician_id: i64,
}

#[derive(Deserialize)]
struct PrescriptionIdResponse {
    prescription_id: i64,
}

impl HttpErxGateway {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
            timeout_secs: timeout.as_secs(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    fn execute(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let response = self.authorized(request).send().map_err(|e| {
            if e.is_connect() {
                GatewayError::Connection(self.base_url.clone())
            } else if e.is_timeout() {
                GatewayError::Timeout(self.timeout_secs)
            } else {
                GatewayError::HttpClient(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(classify_status(status.as_u16(), body));
        }
        Ok(response)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let response = self.execute(self.client.get(self.url(path)))?;
        response
            .json()
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))
    }

    fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, GatewayError> {
        let response = self.execute(self.client.post(self.url(path)).json(body))?;
        response
            .json()
            .map_err(|e| GatewayError::MalformedResponse(e.to_string()))
    }

    fn post_no_content<B: Serialize>(&self, path: &str, body: &B) -> Result<(), GatewayError> {
        self.execute(self.client.post(self.url(path)).json(body))?;
        Ok(())
    }
}

/// Map a non-success HTTP status onto the gateway error taxonomy.
fn classify_status(status: u16, body: String) -> GatewayError {
    match status {
        404 => GatewayError::NotFound(body),
        408 | 429 | 500..=599 => GatewayError::Server { status, body },
        _ => GatewayError::Rejected(if body.is_empty() {
            format!("status {status}")
        } else {
            body
        }),
    }
}

impl ErxGateway for HttpErxGateway {
    fn send_prescriptions(
        &self,
        request: &SendPrescriptionsRequest,
    ) -> Result<SendPrescriptionsResponse, GatewayError> {
        self.post_json("prescriptions", request)
    }

    fn get_prescription_status(
        &self,
        prescription_id: i64,
    ) -> Result<Vec<GatewayStatusEvent>, GatewayError> {
        self.get_json(&format!("prescriptions/{prescription_id}/status"))
    }

    fn get_transmission_errors(
        &self,
        clinician_id: i64,
    ) -> Result<Vec<TransmissionErrorReport>, GatewayError> {
        self.get_json(&format!("clinicians/{clinician_id}/transmission-errors"))
    }

    fn get_refill_request_queue(
        &self,
        clinician_id: i64,
    ) -> Result<Vec<RefillRequestItem>, GatewayError> {
        self.get_json(&format!("clinicians/{clinician_id}/refill-requests"))
    }

    fn approve_refill(
        &self,
        clinician_id: i64,
        approval: &RefillApproval,
    ) -> Result<i64, GatewayError> {
        let response: PrescriptionIdResponse = self.post_json(
            &format!(
                "clinicians/{clinician_id}/refill-requests/{}/approve",
                approval.queue_item_id
            ),
            approval,
        )?;
        Ok(response.prescription_id)
    }

    fn deny_refill(&self, clinician_id: i64, denial: &RefillDenial) -> Result<(), GatewayError> {
        self.post_no_content(
            &format!(
                "clinicians/{clinician_id}/refill-requests/{}/deny",
                denial.queue_item_id
            ),
            denial,
        )
    }

    fn deny_refill_with_new_rx(
        &self,
        clinician_id: i64,
        request: &DntfRequest,
    ) -> Result<i64, GatewayError> {
        let response: PrescriptionIdResponse = self.post_json(
            &format!(
                "clinicians/{clinician_id}/refill-requests/{}/deny-with-new-rx",
                request.queue_item_id
            ),
            request,
        )?;
        Ok(response.prescription_id)
    }

    fn ignore_alert(&self, clinician_id: i64, prescription_id: i64) -> Result<(), GatewayError> {
        self.post_no_content(
            &format!("prescriptions/{prescription_id}/ignore-alert"),
            &IgnoreAlertRequest { clinician_id },
        )
    }

    fn get_patient_details(&self, erx_patient_id: i64) -> Result<PatientDemographics, GatewayError> {
        self.get_json(&format!("patients/{erx_patient_id}"))
    }

    fn get_pharmacy_details(&self, pharmacy_source_id: i64) -> Result<PharmacyRecord, GatewayError> {
        self.get_json(&format!("pharmacies/{pharmacy_source_id}"))
    }
}
