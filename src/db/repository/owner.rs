//! Resolution of a gateway prescription id to whatever owns it locally.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::parse_uuid;
use crate::db::DatabaseError;
use crate::models::OwnerKind;

/// The local owner of a prescription and the doctor responsible for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrescriptionOwner {
    pub kind: OwnerKind,
    pub id: Uuid,
    pub doctor_id: Uuid,
}

/// Treatments first, then unlinked DNTF treatments, then refill requests by
/// their approved prescription. A DNTF stores the new prescription id on the
/// refill too, and the new treatment must win.
pub fn find_owner_by_prescription_id(
    conn: &Connection,
    prescription_id: i64,
) -> Result<Option<PrescriptionOwner>, DatabaseError> {
    let lookups: [(OwnerKind, &str); 3] = [
        (
            OwnerKind::Treatment,
            "SELECT t.id, p.doctor_id FROM treatments t
             JOIN treatment_plans p ON p.id = t.treatment_plan_id
             WHERE t.erx_id = ?1",
        ),
        (
            OwnerKind::UnlinkedDntfTreatment,
            "SELECT id, doctor_id FROM unlinked_dntf_treatments WHERE erx_id = ?1",
        ),
        (
            OwnerKind::RefillRequest,
            "SELECT id, doctor_id FROM refill_requests WHERE approved_prescription_id = ?1",
        ),
    ];

    for (kind, sql) in lookups {
        let found = conn
            .query_row(sql, params![prescription_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .optional()?;
        if let Some((id, doctor_id)) = found {
            return Ok(Some(PrescriptionOwner {
                kind,
                id: parse_uuid(&id)?,
                doctor_id: parse_uuid(&doctor_id)?,
            }));
        }
    }
    Ok(None)
}

pub fn get_prescription_owner(
    conn: &Connection,
    kind: OwnerKind,
    id: &Uuid,
) -> Result<PrescriptionOwner, DatabaseError> {
    let sql = match kind {
        OwnerKind::Treatment => {
            "SELECT p.doctor_id FROM treatments t
             JOIN treatment_plans p ON p.id = t.treatment_plan_id WHERE t.id = ?1"
        }
        OwnerKind::RefillRequest => "SELECT doctor_id FROM refill_requests WHERE id = ?1",
        OwnerKind::UnlinkedDntfTreatment => {
            "SELECT doctor_id FROM unlinked_dntf_treatments WHERE id = ?1"
        }
    };
    let doctor_id: String = conn
        .query_row(sql, params![id.to_string()], |row| row.get(0))
        .optional()?
        .ok_or_else(|| DatabaseError::NotFound {
            entity_type: kind.as_str().into(),
            id: id.to_string(),
        })?;

    Ok(PrescriptionOwner {
        kind,
        id: *id,
        doctor_id: parse_uuid(&doctor_id)?,
    })
}
