//! Column block shared by every table that stores prescription content.

use std::collections::BTreeMap;

use crate::db::DatabaseError;
use crate::models::RxDetails;

/// Fifteen columns, in the order `read_rx_columns` expects.
pub(super) const RX_COLUMNS: &str = "drug_internal_name, drug_name, drug_route, drug_form,
     dosage_strength, dispense_value, dispense_unit_id, dispense_unit_description, refills,
     days_supply, substitutions_allowed, is_controlled_substance, patient_instructions,
     pharmacy_notes, drug_db_ids";

pub(super) struct RxColumns {
    drug_internal_name: String,
    drug_name: String,
    drug_route: Option<String>,
    drug_form: Option<String>,
    dosage_strength: String,
    dispense_value: f64,
    dispense_unit_id: i64,
    dispense_unit_description: Option<String>,
    refills: i64,
    days_supply: Option<i64>,
    substitutions_allowed: i32,
    is_controlled_substance: i32,
    patient_instructions: String,
    pharmacy_notes: Option<String>,
    drug_db_ids: String,
}

pub(super) fn read_rx_columns(
    row: &rusqlite::Row<'_>,
    offset: usize,
) -> Result<RxColumns, rusqlite::Error> {
    Ok(RxColumns {
        drug_internal_name: row.get(offset)?,
        drug_name: row.get(offset + 1)?,
        drug_route: row.get(offset + 2)?,
        drug_form: row.get(offset + 3)?,
        dosage_strength: row.get(offset + 4)?,
        dispense_value: row.get(offset + 5)?,
        dispense_unit_id: row.get(offset + 6)?,
        dispense_unit_description: row.get(offset + 7)?,
        refills: row.get(offset + 8)?,
        days_supply: row.get(offset + 9)?,
        substitutions_allowed: row.get(offset + 10)?,
        is_controlled_substance: row.get(offset + 11)?,
        patient_instructions: row.get(offset + 12)?,
        pharmacy_notes: row.get(offset + 13)?,
        drug_db_ids: row.get(offset + 14)?,
    })
}

pub(super) fn rx_from_columns(cols: RxColumns) -> Result<RxDetails, DatabaseError> {
    let drug_db_ids: BTreeMap<String, String> = serde_json::from_str(&cols.drug_db_ids)?;
    Ok(RxDetails {
        drug_internal_name: cols.drug_internal_name,
        drug_name: cols.drug_name,
        drug_route: cols.drug_route,
        drug_form: cols.drug_form,
        dosage_strength: cols.dosage_strength,
        dispense_value: cols.dispense_value,
        dispense_unit_id: cols.dispense_unit_id,
        dispense_unit_description: cols.dispense_unit_description,
        refills: cols.refills,
        days_supply: cols.days_supply,
        substitutions_allowed: cols.substitutions_allowed != 0,
        is_controlled_substance: cols.is_controlled_substance != 0,
        patient_instructions: cols.patient_instructions,
        pharmacy_notes: cols.pharmacy_notes,
        drug_db_ids,
    })
}

pub(super) fn drug_db_ids_json(rx: &RxDetails) -> Result<String, DatabaseError> {
    Ok(serde_json::to_string(&rx.drug_db_ids)?)
}
