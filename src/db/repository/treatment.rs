use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::rx::{drug_db_ids_json, read_rx_columns, rx_from_columns, RxColumns, RX_COLUMNS};
use super::{parse_opt_uuid, parse_uuid};
use crate::db::{format_timestamp, parse_timestamp, DatabaseError};
use crate::models::{RxDetails, Treatment, TreatmentTemplate};

pub fn insert_treatment(conn: &Connection, treatment: &Treatment) -> Result<(), DatabaseError> {
    let rx = &treatment.rx;
    conn.execute(
        "INSERT INTO treatments (id, treatment_plan_id, drug_internal_name, drug_name, drug_route,
         drug_form, dosage_strength, dispense_value, dispense_unit_id, dispense_unit_description,
         refills, days_supply, substitutions_allowed, is_controlled_substance,
         patient_instructions, pharmacy_notes, drug_db_ids, erx_id, pharmacy_id, erx_sent_date,
         created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
         ?18, ?19, ?20, ?21)",
        params![
            treatment.id.to_string(),
            treatment.treatment_plan_id.to_string(),
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

pub fn get_treatment(conn: &Connection, id: &Uuid) -> Result<Treatment, DatabaseError> {
    let sql = format!(
        "SELECT id, treatment_plan_id, erx_id, pharmacy_id, erx_sent_date, created_at, {RX_COLUMNS}
         FROM treatments WHERE id = ?1"
    );
    let row = conn
        .query_row(&sql, params![id.to_string()], treatment_row_from_rusqlite)
        .optional()?
        .ok_or_else(|| DatabaseError::NotFound {
            entity_type: "Treatment".into(),
            id: id.to_string(),
        })?;
    treatment_from_row(row)
}

pub fn get_treatments_for_plan(
    conn: &Connection,
    plan_id: &Uuid,
) -> Result<Vec<Treatment>, DatabaseError> {
    let sql = format!(
        "SELECT id, treatment_plan_id, erx_id, pharmacy_id, erx_sent_date, created_at, {RX_COLUMNS}
         FROM treatments WHERE treatment_plan_id = ?1 ORDER BY created_at, id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![plan_id.to_string()], treatment_row_from_rusqlite)?;

    let mut treatments = Vec::new();
    for row in rows {
        treatments.push(treatment_from_row(row?)?);
    }
    Ok(treatments)
}

pub fn find_treatment_by_erx_id(
    conn: &Connection,
    erx_id: i64,
) -> Result<Option<Treatment>, DatabaseError> {
    let sql = format!(
        "SELECT id, treatment_plan_id, erx_id, pharmacy_id, erx_sent_date, created_at, {RX_COLUMNS}
         FROM treatments WHERE erx_id = ?1"
    );
    conn.query_row(&sql, params![erx_id], treatment_row_from_rusqlite)
        .optional()?
        .map(treatment_from_row)
        .transpose()
}

/// Attach the gateway's prescription id and the pharmacy it was routed to.
/// Refuses to overwrite an existing prescription id.
pub fn mark_treatment_routed(
    conn: &Connection,
    treatment_id: &Uuid,
    erx_id: i64,
    pharmacy_id: &Uuid,
    sent_at: &NaiveDateTime,
) -> Result<(), DatabaseError> {
    let updated = conn.execute(
        "UPDATE treatments SET erx_id = ?2, pharmacy_id = ?3, erx_sent_date = ?4
         WHERE id = ?1 AND erx_id IS NULL",
        params![
            treatment_id.to_string(),
            erx_id,
            pharmacy_id.to_string(),
            format_timestamp(sent_at),
        ],
    )?;
    if updated == 0 {
        return Err(DatabaseError::ConstraintViolation(format!(
            "treatment {treatment_id} is missing or already routed"
        )));
    }
    Ok(())
}

pub fn insert_treatment_template(
    conn: &Connection,
    template: &TreatmentTemplate,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO treatment_templates (id, doctor_id, name, rx_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            template.id.to_string(),
            template.doctor_id.to_string(),
            template.name,
            serde_json::to_string(&template.rx)?,
            format_timestamp(&template.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_treatment_template(
    conn: &Connection,
    id: &Uuid,
) -> Result<TreatmentTemplate, DatabaseError> {
    let (id_str, doctor_id, name, rx_json, created_at) = conn
        .query_row(
            "SELECT id, doctor_id, name, rx_json, created_at FROM treatment_templates WHERE id = ?1",
            params![id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| DatabaseError::NotFound {
            entity_type: "TreatmentTemplate".into(),
            id: id.to_string(),
        })?;

    let rx: RxDetails = serde_json::from_str(&rx_json)?;
    Ok(TreatmentTemplate {
        id: parse_uuid(&id_str)?,
        doctor_id: parse_uuid(&doctor_id)?,
        name,
        rx,
        created_at: parse_timestamp(&created_at)?,
    })
}

struct TreatmentRow {
    id: String,
    treatment_plan_id: String,
    erx_id: Option<i64>,
    pharmacy_id: Option<String>,
    erx_sent_date: Option<String>,
    created_at: String,
    rx: RxColumns,
}

fn treatment_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<TreatmentRow, rusqlite::Error> {
    Ok(TreatmentRow {
        id: row.get(0)?,
        treatment_plan_id: row.get(1)?,
        erx_id: row.get(2)?,
        pharmacy_id: row.get(3)?,
        erx_sent_date: row.get(4)?,
        created_at: row.get(5)?,
        rx: read_rx_columns(row, 6)?,
    })
}

fn treatment_from_row(row: TreatmentRow) -> Result<Treatment, DatabaseError> {
    Ok(Treatment {
        id: parse_uuid(&row.id)?,
        treatment_plan_id: parse_uuid(&row.treatment_plan_id)?,
        rx: rx_from_columns(row.rx)?,
        erx_id: row.erx_id,
        pharmacy_id: parse_opt_uuid(row.pharmacy_id)?,
        erx_sent_date: row.erx_sent_date.as_deref().map(parse_timestamp).transpose()?,
        created_at: parse_timestamp(&row.created_at)?,
    })
}
