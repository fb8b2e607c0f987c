use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::TreatmentPlanStatus;

/// Prescription content shared by treatments, unlinked DNTF treatments,
/// templates and refill snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RxDetails {
    /// Display name in `Name (route - form)` form.
    pub drug_internal_name: String,
    pub drug_name: String,
    pub drug_route: Option<String>,
    pub drug_form: Option<String>,
    pub dosage_strength: String,
    pub dispense_value: f64,
    pub dispense_unit_id: i64,
    pub dispense_unit_description: Option<String>,
    pub refills: i64,
    pub days_supply: Option<i64>,
    pub substitutions_allowed: bool,
    pub is_controlled_substance: bool,
    pub patient_instructions: String,
    pub pharmacy_notes: Option<String>,
    /// Vendor tag -> vendor identifier (NDC, LexiGenProductId, ...).
    #[serde(default)]
    pub drug_db_ids: BTreeMap<String, String>,
}

/// Components of a `Name (route - form)` internal drug name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrugNameComponents {
    pub name: String,
    pub route: Option<String>,
    pub form: Option<String>,
}

pub fn split_internal_drug_name(internal: &str) -> DrugNameComponents {
    let trimmed = internal.trim();
    let (Some(open), true) = (trimmed.find('('), trimmed.ends_with(')')) else {
        return DrugNameComponents {
            name: trimmed.to_string(),
            route: None,
            form: None,
        };
    };

    let name = trimmed[..open].trim().to_string();
    let inner = &trimmed[open + 1..trimmed.len() - 1];
    let mut parts = inner.splitn(2, " - ").map(str::trim).filter(|p| !p.is_empty());
    DrugNameComponents {
        name,
        route: parts.next().map(String::from),
        form: parts.next().map(String::from),
    }
}

impl RxDetails {
    /// Structural checks the gateway would otherwise reject. Clinical
    /// correctness is not assessed.
    pub fn validate(&self) -> Result<(), String> {
        if self.drug_internal_name.trim().is_empty() {
            return Err("drug name is required".into());
        }
        if self.dosage_strength.trim().is_empty() {
            return Err("dosage strength is required".into());
        }
        if !(self.dispense_value.is_finite() && self.dispense_value > 0.0) {
            return Err(format!("dispense value must be positive, got {}", self.dispense_value));
        }
        if self.dispense_unit_id <= 0 {
            return Err("dispense unit is required".into());
        }
        if self.refills < 0 {
            return Err(format!("refills cannot be negative, got {}", self.refills));
        }
        if self.days_supply.is_some_and(|d| d <= 0) {
            return Err("days supply must be positive when given".into());
        }
        if self.patient_instructions.trim().is_empty() {
            return Err("patient instructions are required".into());
        }
        Ok(())
    }

    /// Fill name, route and form from the internal drug name.
    pub fn with_name_components(mut self) -> Self {
        let parts = split_internal_drug_name(&self.drug_internal_name);
        self.drug_name = parts.name;
        if parts.route.is_some() {
            self.drug_route = parts.route;
        }
        if parts.form.is_some() {
            self.drug_form = parts.form;
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreatmentPlan {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub status: TreatmentPlanStatus,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Treatment {
    pub id: Uuid,
    pub treatment_plan_id: Uuid,
    pub rx: RxDetails,
    /// Prescription identifier assigned by the gateway once routed.
    pub erx_id: Option<i64>,
    pub pharmacy_id: Option<Uuid>,
    pub erx_sent_date: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

/// Replacement prescription issued through DNTF for a refill that has no
/// originating treatment in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlinkedDntfTreatment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub doctor_id: Uuid,
    pub rx: RxDetails,
    pub erx_id: Option<i64>,
    pub pharmacy_id: Option<Uuid>,
    pub erx_sent_date: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

/// A doctor's saved treatment, usable as a DNTF payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreatmentTemplate {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub name: String,
    pub rx: RxDetails,
    pub created_at: NaiveDateTime,
}
