use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::PatientStatus;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub line_1: Option<String>,
    pub line_2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Doctor {
    pub id: Uuid,
    pub first_name: String,
    pub last_name: String,
    /// Clinician identifier at the e-prescribing gateway.
    pub clinician_id: Option<i64>,
}

/// A patient as this subsystem sees them. `Unlinked` patients are shells
/// built from refill payloads and are never promoted automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    pub erx_patient_id: Option<i64>,
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<String>,
    pub phone: Option<String>,
    pub address: Address,
    pub status: PatientStatus,
    pub preferred_pharmacy_id: Option<Uuid>,
    pub created_at: NaiveDateTime,
}

impl Patient {
    pub fn is_registered(&self) -> bool {
        self.status == PatientStatus::Registered
    }
}
