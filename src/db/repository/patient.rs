use std::str::FromStr;

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{parse_opt_uuid, parse_uuid};
use crate::db::{format_timestamp, parse_timestamp, DatabaseError};
use crate::models::{Address, Patient, PatientStatus};

const PATIENT_COLUMNS: &str = "id, erx_patient_id, first_name, last_name, date_of_birth, gender,
     phone, address_line_1, address_line_2, city, state, postal_code, status,
     preferred_pharmacy_id, created_at";

pub fn insert_patient(conn: &Connection, patient: &Patient) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO patients (id, erx_patient_id, first_name, last_name, date_of_birth, gender,
         phone, address_line_1, address_line_2, city, state, postal_code, status,
         preferred_pharmacy_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            patient.id.to_string(),
            patient.erx_patient_id,
            patient.first_name,
            patient.last_name,
            patient.date_of_birth.map(|d| d.to_string()),
            patient.gender,
            patient.phone,
            patient.address.line_1,
            patient.address.line_2,
            patient.address.city,
            patient.address.state,
            patient.address.postal_code,
            patient.status.as_str(),
            patient.preferred_pharmacy_id.map(|id| id.to_string()),
            format_timestamp(&patient.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_patient(conn: &Connection, id: &Uuid) -> Result<Patient, DatabaseError> {
    let sql = format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE id = ?1");
    let row = conn
        .query_row(&sql, params![id.to_string()], patient_row_from_rusqlite)
        .optional()?
        .ok_or_else(|| DatabaseError::NotFound {
            entity_type: "Patient".into(),
            id: id.to_string(),
        })?;
    patient_from_row(row)
}

pub fn find_patient_by_erx_id(
    conn: &Connection,
    erx_patient_id: i64,
) -> Result<Option<Patient>, DatabaseError> {
    let sql = format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE erx_patient_id = ?1");
    conn.query_row(&sql, params![erx_patient_id], patient_row_from_rusqlite)
        .optional()?
        .map(patient_from_row)
        .transpose()
}

/// Record the gateway's patient id. An id already on file is left alone.
pub fn set_patient_erx_id(
    conn: &Connection,
    patient_id: &Uuid,
    erx_patient_id: i64,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE patients SET erx_patient_id = ?2 WHERE id = ?1 AND erx_patient_id IS NULL",
        params![patient_id.to_string(), erx_patient_id],
    )?;
    Ok(())
}

struct PatientRow {
    id: String,
    erx_patient_id: Option<i64>,
    first_name: String,
    last_name: String,
    date_of_birth: Option<String>,
    gender: Option<String>,
    phone: Option<String>,
    address_line_1: Option<String>,
    address_line_2: Option<String>,
    city: Option<String>,
    state: Option<String>,
    postal_code: Option<String>,
    status: String,
    preferred_pharmacy_id: Option<String>,
    created_at: String,
}

fn patient_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<PatientRow, rusqlite::Error> {
    Ok(PatientRow {
        id: row.get(0)?,
        erx_patient_id: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        date_of_birth: row.get(4)?,
        gender: row.get(5)?,
        phone: row.get(6)?,
        address_line_1: row.get(7)?,
        address_line_2: row.get(8)?,
        city: row.get(9)?,
        state: row.get(10)?,
        postal_code: row.get(11)?,
        status: row.get(12)?,
        preferred_pharmacy_id: row.get(13)?,
        created_at: row.get(14)?,
    })
}

fn patient_from_row(row: PatientRow) -> Result<Patient, DatabaseError> {
    Ok(Patient {
        id: parse_uuid(&row.id)?,
        erx_patient_id: row.erx_patient_id,
        first_name: row.first_name,
        last_name: row.last_name,
        date_of_birth: row
            .date_of_birth
            .and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        gender: row.gender,
        phone: row.phone,
        address: Address {
            line_1: row.address_line_1,
            line_2: row.address_line_2,
            city: row.city,
            state: row.state,
            postal_code: row.postal_code,
        },
        status: PatientStatus::from_str(&row.status)?,
        preferred_pharmacy_id: parse_opt_uuid(row.preferred_pharmacy_id)?,
        created_at: parse_timestamp(&row.created_at)?,
    })
}
