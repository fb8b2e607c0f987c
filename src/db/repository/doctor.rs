use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::parse_uuid;
use crate::db::DatabaseError;
use crate::models::Doctor;

pub fn insert_doctor(conn: &Connection, doctor: &Doctor) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO doctors (id, first_name, last_name, clinician_id) VALUES (?1, ?2, ?3, ?4)",
        params![
            doctor.id.to_string(),
            doctor.first_name,
            doctor.last_name,
            doctor.clinician_id,
        ],
    )?;
    Ok(())
}

pub fn get_doctor(conn: &Connection, id: &Uuid) -> Result<Doctor, DatabaseError> {
    conn.query_row(
        "SELECT id, first_name, last_name, clinician_id FROM doctors WHERE id = ?1",
        params![id.to_string()],
        doctor_row_from_rusqlite,
    )
    .optional()?
    .ok_or_else(|| DatabaseError::NotFound {
        entity_type: "Doctor".into(),
        id: id.to_string(),
    })?
    .try_into()
}

pub fn find_doctor_by_clinician_id(
    conn: &Connection,
    clinician_id: i64,
) -> Result<Option<Doctor>, DatabaseError> {
    conn.query_row(
        "SELECT id, first_name, last_name, clinician_id FROM doctors WHERE clinician_id = ?1",
        params![clinician_id],
        doctor_row_from_rusqlite,
    )
    .optional()?
    .map(Doctor::try_from)
    .transpose()
}

/// Doctors registered with the gateway, in a stable order.
pub fn list_doctors_with_clinician_id(conn: &Connection) -> Result<Vec<Doctor>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, first_name, last_name, clinician_id FROM doctors
         WHERE clinician_id IS NOT NULL ORDER BY clinician_id",
    )?;
    let rows = stmt.query_map([], doctor_row_from_rusqlite)?;

    let mut doctors = Vec::new();
    for row in rows {
        doctors.push(Doctor::try_from(row?)?);
    }
    Ok(doctors)
}

struct DoctorRow {
    id: String,
    first_name: String,
    last_name: String,
    clinician_id: Option<i64>,
}

fn doctor_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<DoctorRow, rusqlite::Error> {
    Ok(DoctorRow {
        id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        clinician_id: row.get(3)?,
    })
}

impl TryFrom<DoctorRow> for Doctor {
    type Error = DatabaseError;

    fn try_from(row: DoctorRow) -> Result<Self, Self::Error> {
        Ok(Doctor {
            id: parse_uuid(&row.id)?,
            first_name: row.first_name,
            last_name: row.last_name,
            clinician_id: row.clinician_id,
        })
    }
}
