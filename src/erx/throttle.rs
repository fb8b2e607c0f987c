//! Per-instance cap on concurrent gateway calls.

use std::sync::{Condvar, Mutex, MutexGuard};

use super::gateway::{ErxGateway, GatewayError};
use super::types::*;

/// Wraps a gateway so at most `max_in_flight` calls run at once from this
/// process. Callers over the cap block until a slot frees up.
pub struct ThrottledGateway<G> {
    inner: G,
    in_flight: Mutex<usize>,
    slot_freed: Condvar,
    max_in_flight: usize,
}

/// Held for the duration of one gateway call.
struct Permit<'a, G> {
    gateway: &'a ThrottledGateway<G>,
}

impl<G> Drop for Permit<'_, G> {
    fn drop(&mut self) {
        let mut in_flight = self.gateway.lock_counter();
        *in_flight = in_flight.saturating_sub(1);
        self.gateway.slot_freed.notify_one();
    }
}

impl<G> ThrottledGateway<G> {
    pub fn new(inner: G, max_in_flight: usize) -> Self {
        Self {
            inner,
            in_flight: Mutex::new(0),
            slot_freed: Condvar::new(),
            max_in_flight: max_in_flight.max(1),
        }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    pub fn in_flight(&self) -> usize {
        *self.lock_counter()
    }

    // A panic while holding the counter lock cannot leave the count
    // inconsistent, so poisoning is ignored.
    fn lock_counter(&self) -> MutexGuard<'_, usize> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn acquire(&self) -> Permit<'_, G> {
        let mut in_flight = self.lock_counter();
        while *in_flight >= self.max_in_flight {
            in_flight = self
                .slot_freed
                .wait(in_flight)
                .unwrap_or_else(|e| e.into_inner());
        }
        *in_flight += 1;
        Permit { gateway: self }
    }

    fn call<T>(&self, f: impl FnOnce(&G) -> Result<T, GatewayError>) -> Result<T, GatewayError> {
        let _permit = self.acquire();
        f(&self.inner)
    }
}

impl<G: ErxGateway> ErxGateway for ThrottledGateway<G> {
    fn send_prescriptions(
        &self,
        request: &SendPrescriptionsRequest,
    ) -> Result<SendPrescriptionsResponse, GatewayError> {
        self.call(|g| g.send_prescriptions(request))
    }

    fn get_prescription_status(
        &self,
        prescription_id: i64,
    ) -> Result<Vec<GatewayStatusEvent>, GatewayError> {
        self.call(|g| g.get_prescription_status(prescription_id))
    }

    fn get_transmission_errors(
        &self,
        clinician_id: i64,
    ) -> Result<Vec<TransmissionErrorReport>, GatewayError> {
        self.call(|g| g.get_transmission_errors(clinician_id))
    }

    fn get_refill_request_queue(
        &self,
        clinician_id: i64,
    ) -> Result<Vec<RefillRequestItem>, GatewayError> {
        self.call(|g| g.get_refill_request_queue(clinician_id))
    }

    fn approve_refill(
        &self,
        clinician_id: i64,
        approval: &RefillApproval,
    ) -> Result<i64, GatewayError> {
        self.call(|g| g.approve_refill(clinician_id, approval))
    }

    fn deny_refill(&self, clinician_id: i64, denial: &RefillDenial) -> Result<(), GatewayError> {
        self.call(|g| g.deny_refill(clinician_id, denial))
    }

    fn deny_refill_with_new_rx(
        &self,
        clinician_id: i64,
        request: &DntfRequest,
    ) -> Result<i64, GatewayError> {
        self.call(|g| g.deny_refill_with_new_rx(clinician_id, request))
    }

    fn ignore_alert(&self, clinician_id: i64, prescription_id: i64) -> Result<(), GatewayError> {
        self.call(|g| g.ignore_alert(clinician_id, prescription_id))
    }

    fn get_patient_details(&self, erx_patient_id: i64) -> Result<PatientDemographics, GatewayError> {
        self.call(|g| g.get_patient_details(erx_patient_id))
    }

    fn get_pharmacy_details(&self, pharmacy_source_id: i64) -> Result<PharmacyRecord, GatewayError> {
        self.call(|g| g.get_pharmacy_details(pharmacy_source_id))
    }
}
