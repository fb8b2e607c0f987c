use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::rx::{drug_db_ids_json, read_rx_columns, rx_from_columns, RxColumns, RX_COLUMNS};
use super::{parse_opt_uuid, parse_uuid};
use crate::db::{format_timestamp, parse_timestamp, DatabaseError};
use crate::models::UnlinkedDntfTreatment;

pub fn insert_unlinked_dntf_treatment(
    conn: &Connection,
    treatment: &UnlinkedDntfTreatment,
) -> Result<(), DatabaseError> {
    let rx = &treatment.rx;
    conn.execute(
        "INSERT INTO unlinked_dntf_treatments (id, patient_id, doctor_id, drug_internal_name,
         drug_name, drug_route, drug_form, dosage_strength, dispense_value, dispense_unit_id,
         dispense_unit_description, refills, days_supply, substitutions_allowed,
         is_controlled_substance, patient_instructions, pharmacy_notes, drug_db_ids, erx_id,
         pharmacy_id, erx_sent_date, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
         ?18, ?19, ?20, ?21, ?22)",
        params![
            treatment.id.to_string(),
            treatment.patient_id.to_string(),
            treatment.doctor_id.to_string(),
            rx.drug_internal_name,
            rx.drug_name,
            rx.drug_route,
            rx.drug_form,
            rx.dosage_strength,
            rx.dispense_value,
            rx.dispense_unit_id,
            rx.dispense_unit_description,
            rx.refills,
            rx.days_supply,
            rx.substitutions_allowed as i32,
            rx.is_controlled_substance as i32,
            rx.patient_instructions,
            rx.pharmacy_notes,
            drug_db_ids_json(rx)?,
            treatment.erx_id,
            treatment.pharmacy_id.map(|id| id.to_string()),
            treatment.erx_sent_date.as_ref().map(format_timestamp),
            format_timestamp(&treatment.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_unlinked_dntf_treatment(
    conn: &Connection,
    id: &Uuid,
) -> Result<UnlinkedDntfTreatment, DatabaseError> {
    let sql = format!(
        "SELECT id, patient_id, doctor_id, erx_id, pharmacy_id, erx_sent_date, created_at,
         {RX_COLUMNS} FROM unlinked_dntf_treatments WHERE id = ?1"
    );
    let row = conn
        .query_row(&sql, params![id.to_string()], unlinked_row_from_rusqlite)
        .optional()?
        .ok_or_else(|| DatabaseError::NotFound {
            entity_type: "UnlinkedDntfTreatment".into(),
            id: id.to_string(),
        })?;
    unlinked_from_row(row)
}

pub fn find_unlinked_dntf_treatment_by_erx_id(
    conn: &Connection,
    erx_id: i64,
) -> Result<Option<UnlinkedDntfTreatment>, DatabaseError> {
    let sql = format!(
        "SELECT id, patient_id, doctor_id, erx_id, pharmacy_id, erx_sent_date, created_at,
         {RX_COLUMNS} FROM unlinked_dntf_treatments WHERE erx_id = ?1"
    );
    conn.query_row(&sql, params![erx_id], unlinked_row_from_rusqlite)
        .optional()?
        .map(unlinked_from_row)
        .transpose()
}

struct UnlinkedRow {
    id: String,
    patient_id: String,
    doctor_id: String,
    erx_id: Option<i64>,
    pharmacy_id: Option<String>,
    erx_sent_date: Option<String>,
    created_at: String,
    rx: RxColumns,
}

fn unlinked_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<UnlinkedRow, rusqlite::Error> {
    Ok(UnlinkedRow {
        id: row.get(0)?,
        patient_id: row.get(1)?,
        doctor_id: row.get(2)?,
        erx_id: row.get(3)?,
        pharmacy_id: row.get(4)?,
        erx_sent_date: row.get(5)?,
        created_at: row.get(6)?,
        rx: read_rx_columns(row, 7)?,
    })
}

fn unlinked_from_row(row: UnlinkedRow) -> Result<UnlinkedDntfTreatment, DatabaseError> {
    Ok(UnlinkedDntfTreatment {
        id: parse_uuid(&row.id)?,
        patient_id: parse_uuid(&row.patient_id)?,
        doctor_id: parse_uuid(&row.doctor_id)?,
        rx: rx_from_columns(row.rx)?,
        erx_id: row.erx_id,
        pharmacy_id: parse_opt_uuid(row.pharmacy_id)?,
        erx_sent_date: row.erx_sent_date.as_deref().map(parse_timestamp).transpose()?,
        created_at: parse_timestamp(&row.created_at)?,
    })
}
