use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::parse_uuid;
use crate::db::{format_timestamp, parse_timestamp, DatabaseError};
use crate::models::{TreatmentPlan, TreatmentPlanStatus};

pub fn insert_treatment_plan(conn: &Connection, plan: &TreatmentPlan) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO treatment_plans (id, patient_id, doctor_id, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            plan.id.to_string(),
            plan.patient_id.to_string(),
            plan.doctor_id.to_string(),
            plan.status.as_str(),
            format_timestamp(&plan.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_treatment_plan(conn: &Connection, id: &Uuid) -> Result<TreatmentPlan, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, patient_id, doctor_id, status, created_at
             FROM treatment_plans WHERE id = ?1",
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
            entity_type: "TreatmentPlan".into(),
            id: id.to_string(),
        })?;

    Ok(TreatmentPlan {
        id: parse_uuid(&row.0)?,
        patient_id: parse_uuid(&row.1)?,
        doctor_id: parse_uuid(&row.2)?,
        status: TreatmentPlanStatus::from_str(&row.3)?,
        created_at: parse_timestamp(&row.4)?,
    })
}

pub fn set_treatment_plan_status(
    conn: &Connection,
    id: &Uuid,
    status: TreatmentPlanStatus,
) -> Result<(), DatabaseError> {
    let updated = conn.execute(
        "UPDATE treatment_plans SET status = ?2 WHERE id = ?1",
        params![id.to_string(), status.as_str()],
    )?;
    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "TreatmentPlan".into(),
            id: id.to_string(),
        });
    }
    Ok(())
}
