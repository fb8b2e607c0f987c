use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::parse_uuid;
use crate::db::{format_timestamp, parse_timestamp, DatabaseError};
use crate::models::{DntfMapping, DntfTarget};

pub fn insert_dntf_mapping(conn: &Connection, mapping: &DntfMapping) -> Result<(), DatabaseError> {
    let (treatment_id, unlinked_id) = match mapping.target {
        DntfTarget::Treatment(id) => (Some(id.to_string()), None),
        DntfTarget::UnlinkedDntfTreatment(id) => (None, Some(id.to_string())),
    };
    conn.execute(
        "INSERT INTO dntf_mappings (id, refill_request_id, treatment_id,
         unlinked_dntf_treatment_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            mapping.id.to_string(),
            mapping.refill_request_id.to_string(),
            treatment_id,
            unlinked_id,
            format_timestamp(&mapping.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_dntf_mapping_for_refill(
    conn: &Connection,
    refill_request_id: &Uuid,
) -> Result<Option<DntfMapping>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT id, refill_request_id, treatment_id, unlinked_dntf_treatment_id, created_at
             FROM dntf_mappings WHERE refill_request_id = ?1",
            params![refill_request_id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;

    let Some((id, refill_id, treatment_id, unlinked_id, created_at)) = row else {
        return Ok(None);
    };

    let target = match (treatment_id, unlinked_id) {
        (Some(t), None) => DntfTarget::Treatment(parse_uuid(&t)?),
        (None, Some(u)) => DntfTarget::UnlinkedDntfTreatment(parse_uuid(&u)?),
        _ => {
            return Err(DatabaseError::ConstraintViolation(format!(
                "DNTF mapping {id} must reference exactly one treatment"
            )))
        }
    };

    Ok(Some(DntfMapping {
        id: parse_uuid(&id)?,
        refill_request_id: parse_uuid(&refill_id)?,
        target,
        created_at: parse_timestamp(&created_at)?,
    }))
}
