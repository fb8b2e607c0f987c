//! Append-only status histories for the three prescription owner kinds.
//!
//! Every append checks the state machine, refuses to rewind the reported
//! timestamp, and flips the previous Active row to Inactive. Callers run it
//! inside their transaction so the flip and the insert land together.

use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::db::{format_timestamp, now, parse_timestamp, DatabaseError};
use crate::models::{
    check_transition, ErxStatus, EventState, NewStatusEvent, OwnerKind, StatusEvent,
};

pub(super) fn events_table(kind: OwnerKind) -> &'static str {
    match kind {
        OwnerKind::Treatment => "erx_status_events",
        OwnerKind::RefillRequest => "refill_request_status_events",
        OwnerKind::UnlinkedDntfTreatment => "unlinked_dntf_treatment_status_events",
    }
}

pub(super) fn owner_column(kind: OwnerKind) -> &'static str {
    match kind {
        OwnerKind::Treatment => "treatment_id",
        OwnerKind::RefillRequest => "refill_request_id",
        OwnerKind::UnlinkedDntfTreatment => "unlinked_dntf_treatment_id",
    }
}

pub(super) fn owner_table(kind: OwnerKind) -> &'static str {
    match kind {
        OwnerKind::Treatment => "treatments",
        OwnerKind::RefillRequest => "refill_requests",
        OwnerKind::UnlinkedDntfTreatment => "unlinked_dntf_treatments",
    }
}

/// Full history, oldest first (reported time, then insertion order).
pub fn get_status_history(
    conn: &Connection,
    kind: OwnerKind,
    owner_id: &Uuid,
) -> Result<Vec<StatusEvent>, DatabaseError> {
    let sql = format!(
        "SELECT id, erx_status, status_details, reported_timestamp, creation_date, status
         FROM {} WHERE {} = ?1 ORDER BY reported_timestamp, id",
        events_table(kind),
        owner_column(kind),
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![owner_id.to_string()], event_row_from_rusqlite)?;

    let mut events = Vec::new();
    for row in rows {
        events.push(event_from_row(row?, kind, *owner_id)?);
    }
    Ok(events)
}

pub fn get_active_status_event(
    conn: &Connection,
    kind: OwnerKind,
    owner_id: &Uuid,
) -> Result<Option<StatusEvent>, DatabaseError> {
    let sql = format!(
        "SELECT id, erx_status, status_details, reported_timestamp, creation_date, status
         FROM {} WHERE {} = ?1 AND status = 'ACTIVE'",
        events_table(kind),
        owner_column(kind),
    );
    conn.query_row(&sql, params![owner_id.to_string()], event_row_from_rusqlite)
        .optional()?
        .map(|row| event_from_row(row, kind, *owner_id))
        .transpose()
}

pub fn get_active_status(
    conn: &Connection,
    kind: OwnerKind,
    owner_id: &Uuid,
) -> Result<Option<ErxStatus>, DatabaseError> {
    Ok(get_active_status_event(conn, kind, owner_id)?.map(|e| e.status))
}

/// Append a transition and make it the Active event.
pub fn append_status_event(
    conn: &Connection,
    kind: OwnerKind,
    owner_id: &Uuid,
    event: &NewStatusEvent,
) -> Result<StatusEvent, DatabaseError> {
    let active = get_active_status_event(conn, kind, owner_id)?;
    check_transition(kind, active.as_ref().map(|e| e.status), event.status)?;

    if let Some(active) = &active {
        if event.reported_at < active.reported_at {
            return Err(DatabaseError::OutOfOrder {
                owner_id: owner_id.to_string(),
                reported: format_timestamp(&event.reported_at),
                active: format_timestamp(&active.reported_at),
            });
        }
    }

    if matches!(event.status, ErxStatus::Sending | ErxStatus::Sent)
        && is_controlled_substance(conn, kind, owner_id)?
    {
        return Err(DatabaseError::ControlledSubstance {
            treatment_id: owner_id.to_string(),
            status: event.status.as_str().into(),
        });
    }

    let table = events_table(kind);
    let column = owner_column(kind);
    conn.execute(
        &format!("UPDATE {table} SET status = 'INACTIVE' WHERE {column} = ?1 AND status = 'ACTIVE'"),
        params![owner_id.to_string()],
    )?;

    let created_at = now();
    conn.execute(
        &format!(
            "INSERT INTO {table} ({column}, erx_status, status_details, reported_timestamp,
             creation_date, status) VALUES (?1, ?2, ?3, ?4, ?5, 'ACTIVE')"
        ),
        params![
            owner_id.to_string(),
            event.status.as_str(),
            event.details,
            format_timestamp(&event.reported_at),
            format_timestamp(&created_at),
        ],
    )?;

    Ok(StatusEvent {
        id: conn.last_insert_rowid(),
        owner_kind: kind,
        owner_id: *owner_id,
        status: event.status,
        details: event.details.clone(),
        reported_at: event.reported_at,
        created_at,
        state: EventState::Active,
    })
}

/// Refill requests carry the flag inside their requested-prescription
/// snapshot and are guarded by the decision service instead.
fn is_controlled_substance(
    conn: &Connection,
    kind: OwnerKind,
    owner_id: &Uuid,
) -> Result<bool, DatabaseError> {
    if kind == OwnerKind::RefillRequest {
        return Ok(false);
    }
    let flag: Option<i32> = conn
        .query_row(
            &format!("SELECT is_controlled_substance FROM {} WHERE id = ?1", owner_table(kind)),
            params![owner_id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match flag {
        Some(flag) => Ok(flag != 0),
        None => Err(DatabaseError::NotFound {
            entity_type: kind.as_str().into(),
            id: owner_id.to_string(),
        }),
    }
}

struct EventRow {
    id: i64,
    erx_status: String,
    status_details: Option<String>,
    reported_timestamp: String,
    creation_date: String,
    status: String,
}

fn event_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<EventRow, rusqlite::Error> {
    Ok(EventRow {
        id: row.get(0)?,
        erx_status: row.get(1)?,
        status_details: row.get(2)?,
        reported_timestamp: row.get(3)?,
        creation_date: row.get(4)?,
        status: row.get(5)?,
    })
}

fn event_from_row(row: EventRow, kind: OwnerKind, owner_id: Uuid) -> Result<StatusEvent, DatabaseError> {
    Ok(StatusEvent {
        id: row.id,
        owner_kind: kind,
        owner_id,
        status: ErxStatus::from_str(&row.erx_status)?,
        details: row.status_details,
        reported_at: parse_timestamp(&row.reported_timestamp)?,
        created_at: parse_timestamp(&row.creation_date)?,
        state: EventState::from_str(&row.status)?,
    })
}
