use std::collections::HashSet;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{parse_opt_uuid, parse_uuid};
use crate::db::{format_timestamp, parse_timestamp, DatabaseError};
use crate::models::{DenialReason, PrescriptionSnapshot, RefillRequest};

const REFILL_COLUMNS: &str = "id, erx_queue_item_id, reference_number, pharmacy_rx_reference,
     patient_id, doctor_id, pharmacy_id, requested_prescription, dispensed_prescription,
     originating_treatment_id, approved_prescription_id, approved_refill_amount, comments,
     denial_reason_id, clinician_id, request_date, created_at";

/// Insert unless a request with the same gateway queue-item id exists.
/// Returns false when the row was already there.
pub fn insert_refill_request(conn: &Connection, refill: &RefillRequest) -> Result<bool, DatabaseError> {
    let inserted = conn.execute(
        "INSERT INTO refill_requests (id, erx_queue_item_id, reference_number,
         pharmacy_rx_reference, patient_id, doctor_id, pharmacy_id, requested_prescription,
         dispensed_prescription, requested_erx_id, originating_treatment_id,
         approved_prescription_id, approved_refill_amount, comments, denial_reason_id,
         clinician_id, request_date, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
         ON CONFLICT(erx_queue_item_id) DO NOTHING",
        params![
            refill.id.to_string(),
            refill.erx_queue_item_id,
            refill.reference_number,
            refill.pharmacy_rx_reference,
            refill.patient_id.to_string(),
            refill.doctor_id.to_string(),
            refill.pharmacy_id.map(|id| id.to_string()),
            serde_json::to_string(&refill.requested_prescription)?,
            refill
                .dispensed_prescription
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            refill.requested_erx_id(),
            refill.originating_treatment_id.map(|id| id.to_string()),
            refill.approved_prescription_id,
            refill.approved_refill_amount,
            refill.comments,
            refill.denial_reason_id,
            refill.clinician_id,
            format_timestamp(&refill.request_date),
            format_timestamp(&refill.created_at),
        ],
    )?;
    Ok(inserted > 0)
}

pub fn get_refill_request(conn: &Connection, id: &Uuid) -> Result<RefillRequest, DatabaseError> {
    let sql = format!("SELECT {REFILL_COLUMNS} FROM refill_requests WHERE id = ?1");
    let row = conn
        .query_row(&sql, params![id.to_string()], refill_row_from_rusqlite)
        .optional()?
        .ok_or_else(|| DatabaseError::NotFound {
            entity_type: "RefillRequest".into(),
            id: id.to_string(),
        })?;
    refill_from_row(row)
}

pub fn find_refill_request_by_queue_item_id(
    conn: &Connection,
    queue_item_id: i64,
) -> Result<Option<RefillRequest>, DatabaseError> {
    let sql = format!("SELECT {REFILL_COLUMNS} FROM refill_requests WHERE erx_queue_item_id = ?1");
    conn.query_row(&sql, params![queue_item_id], refill_row_from_rusqlite)
        .optional()?
        .map(refill_from_row)
        .transpose()
}

/// Which of the given gateway queue-item ids are already stored.
pub fn existing_queue_item_ids(
    conn: &Connection,
    queue_item_ids: &[i64],
) -> Result<HashSet<i64>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT 1 FROM refill_requests WHERE erx_queue_item_id = ?1")?;
    let mut existing = HashSet::new();
    for id in queue_item_ids {
        if stmt.exists(params![id])? {
            existing.insert(*id);
        }
    }
    Ok(existing)
}

pub fn list_refill_requests_for_patient(
    conn: &Connection,
    patient_id: &Uuid,
) -> Result<Vec<RefillRequest>, DatabaseError> {
    let sql = format!(
        "SELECT {REFILL_COLUMNS} FROM refill_requests WHERE patient_id = ?1 ORDER BY request_date"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![patient_id.to_string()], refill_row_from_rusqlite)?;

    let mut refills = Vec::new();
    for row in rows {
        refills.push(refill_from_row(row?)?);
    }
    Ok(refills)
}

pub fn count_refill_requests(conn: &Connection) -> Result<i64, DatabaseError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM refill_requests", [], |row| row.get(0))?)
}

pub fn record_refill_approval(
    conn: &Connection,
    refill_id: &Uuid,
    approved_prescription_id: i64,
    amount: i64,
    comments: Option<&str>,
) -> Result<(), DatabaseError> {
    let updated = conn.execute(
        "UPDATE refill_requests
         SET approved_prescription_id = ?2, approved_refill_amount = ?3, comments = ?4
         WHERE id = ?1",
        params![refill_id.to_string(), approved_prescription_id, amount, comments],
    )?;
    ensure_updated(updated, refill_id)
}

/// Record a denial. For a DNTF the new prescription's id is stored as the
/// approved prescription.
pub fn record_refill_denial(
    conn: &Connection,
    refill_id: &Uuid,
    denial_reason_id: i64,
    comments: Option<&str>,
    new_prescription_id: Option<i64>,
) -> Result<(), DatabaseError> {
    let updated = conn.execute(
        "UPDATE refill_requests
         SET denial_reason_id = ?2, comments = ?3,
             approved_prescription_id = COALESCE(?4, approved_prescription_id)
         WHERE id = ?1",
        params![refill_id.to_string(), denial_reason_id, comments, new_prescription_id],
    )?;
    ensure_updated(updated, refill_id)
}

pub fn get_denial_reason(conn: &Connection, id: i64) -> Result<DenialReason, DatabaseError> {
    conn.query_row(
        "SELECT id, reason_code, reason FROM refill_denial_reasons WHERE id = ?1",
        params![id],
        |row| {
            Ok(DenialReason {
                id: row.get(0)?,
                code: row.get(1)?,
                reason: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| DatabaseError::NotFound {
        entity_type: "DenialReason".into(),
        id: id.to_string(),
    })
}

pub fn list_denial_reasons(conn: &Connection) -> Result<Vec<DenialReason>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT id, reason_code, reason FROM refill_denial_reasons ORDER BY id")?;
    let rows = stmt.query_map([], |row| {
        Ok(DenialReason {
            id: row.get(0)?,
            code: row.get(1)?,
            reason: row.get(2)?,
        })
    })?;
    rows.map(|r| r.map_err(DatabaseError::from)).collect()
}

fn ensure_updated(updated: usize, refill_id: &Uuid) -> Result<(), DatabaseError> {
    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity_type: "RefillRequest".into(),
            id: refill_id.to_string(),
        });
    }
    Ok(())
}

struct RefillRow {
    id: String,
    erx_queue_item_id: i64,
    reference_number: Option<String>,
    pharmacy_rx_reference: Option<String>,
    patient_id: String,
    doctor_id: String,
    pharmacy_id: Option<String>,
    requested_prescription: String,
    dispensed_prescription: Option<String>,
    originating_treatment_id: Option<String>,
    approved_prescription_id: Option<i64>,
    approved_refill_amount: Option<i64>,
    comments: Option<String>,
    denial_reason_id: Option<i64>,
    clinician_id: i64,
    request_date: String,
    created_at: String,
}

fn refill_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<RefillRow, rusqlite::Error> {
    Ok(RefillRow {
        id: row.get(0)?,
        erx_queue_item_id: row.get(1)?,
        reference_number: row.get(2)?,
        pharmacy_rx_reference: row.get(3)?,
        patient_id: row.get(4)?,
        doctor_id: row.get(5)?,
        pharmacy_id: row.get(6)?,
        requested_prescription: row.get(7)?,
        dispensed_prescription: row.get(8)?,
        originating_treatment_id: row.get(9)?,
        approved_prescription_id: row.get(10)?,
        approved_refill_amount: row.get(11)?,
        comments: row.get(12)?,
        denial_reason_id: row.get(13)?,
        clinician_id: row.get(14)?,
        request_date: row.get(15)?,
        created_at: row.get(16)?,
    })
}

fn refill_from_row(row: RefillRow) -> Result<RefillRequest, DatabaseError> {
    let requested_prescription: PrescriptionSnapshot =
        serde_json::from_str(&row.requested_prescription)?;
    let dispensed_prescription: Option<PrescriptionSnapshot> = row
        .dispensed_prescription
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    Ok(RefillRequest {
        id: parse_uuid(&row.id)?,
        erx_queue_item_id: row.erx_queue_item_id,
        reference_number: row.reference_number,
        pharmacy_rx_reference: row.pharmacy_rx_reference,
        patient_id: parse_uuid(&row.patient_id)?,
        doctor_id: parse_uuid(&row.doctor_id)?,
        pharmacy_id: parse_opt_uuid(row.pharmacy_id)?,
        requested_prescription,
        dispensed_prescription,
        originating_treatment_id: parse_opt_uuid(row.originating_treatment_id)?,
        approved_prescription_id: row.approved_prescription_id,
        approved_refill_amount: row.approved_refill_amount,
        comments: row.comments,
        denial_reason_id: row.denial_reason_id,
        clinician_id: row.clinician_id,
        request_date: parse_timestamp(&row.request_date)?,
        created_at: parse_timestamp(&row.created_at)?,
    })
}
