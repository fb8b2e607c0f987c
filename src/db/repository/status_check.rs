//! Bookkeeping for scheduled status checks, so the sweeper can find owners
//! whose poll was lost between the status write and the enqueue.

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension};

use super::parse_uuid;
use super::status_event::{events_table, owner_column, owner_table};
use crate::db::{format_timestamp, parse_timestamp, DatabaseError};
use crate::models::{pending_statuses, OwnerKind, StatusTarget};

#[derive(Debug, Clone, PartialEq)]
pub struct StatusCheckTracking {
    pub target: StatusTarget,
    pub attempts: u32,
    pub last_enqueued_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
}

/// Note that a status check for `target` was enqueued as attempt `attempt`.
pub fn record_status_check_enqueued(
    conn: &Connection,
    target: &StatusTarget,
    attempt: u32,
    at: &NaiveDateTime,
) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO status_check_tracking (prescription_id, owner_kind, owner_id, attempts,
         last_enqueued_at, finished_at) VALUES (?1, ?2, ?3, ?4, ?5, NULL)
         ON CONFLICT (owner_kind, owner_id, prescription_id) DO UPDATE SET
             attempts = excluded.attempts,
             last_enqueued_at = excluded.last_enqueued_at,
             finished_at = NULL",
        params![
            target.prescription_id,
            target.owner_kind.as_str(),
            target.owner_id.to_string(),
            attempt,
            format_timestamp(at),
        ],
    )?;
    Ok(())
}

pub fn mark_status_check_finished(
    conn: &Connection,
    target: &StatusTarget,
    at: &NaiveDateTime,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE status_check_tracking SET finished_at = ?4
         WHERE prescription_id = ?1 AND owner_kind = ?2 AND owner_id = ?3",
        params![
            target.prescription_id,
            target.owner_kind.as_str(),
            target.owner_id.to_string(),
            format_timestamp(at),
        ],
    )?;
    Ok(())
}

pub fn get_status_check_tracking(
    conn: &Connection,
    target: &StatusTarget,
) -> Result<Option<StatusCheckTracking>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT attempts, last_enqueued_at, finished_at FROM status_check_tracking
             WHERE prescription_id = ?1 AND owner_kind = ?2 AND owner_id = ?3",
            params![
                target.prescription_id,
                target.owner_kind.as_str(),
                target.owner_id.to_string(),
            ],
            |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;

    row.map(|(attempts, last, finished)| {
        Ok(StatusCheckTracking {
            target: *target,
            attempts,
            last_enqueued_at: parse_timestamp(&last)?,
            finished_at: finished.as_deref().map(parse_timestamp).transpose()?,
        })
    })
    .transpose()
}

/// Owners whose active status still needs polling, whose status was written
/// before `cutoff`, and whose status check is either untracked or was last
/// enqueued before `cutoff` without finishing.
pub fn list_stale_status_targets(
    conn: &Connection,
    cutoff: &NaiveDateTime,
) -> Result<Vec<StatusTarget>, DatabaseError> {
    let mut targets = Vec::new();
    for kind in OwnerKind::ALL.iter().copied() {
        targets.extend(stale_targets_for_kind(conn, kind, cutoff)?);
    }
    Ok(targets)
}

fn stale_targets_for_kind(
    conn: &Connection,
    kind: OwnerKind,
    cutoff: &NaiveDateTime,
) -> Result<Vec<StatusTarget>, DatabaseError> {
    let statuses = pending_statuses(kind)
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ");

    let prescription_expr = match kind {
        OwnerKind::RefillRequest => {
            "CASE WHEN e.erx_status = 'Approved' THEN o.approved_prescription_id
             ELSE COALESCE(o.requested_erx_id, o.approved_prescription_id) END"
        }
        _ => "o.erx_id",
    };

    // A DNTF leaves the refill Denied for good; the new prescription is
    // polled under its own owner.
    let extra_filter = match kind {
        OwnerKind::RefillRequest => {
            "AND NOT EXISTS (SELECT 1 FROM dntf_mappings m WHERE m.refill_request_id = o.id)"
        }
        _ => "",
    };

    let sql = format!(
        "SELECT o.id, {prescription_expr} AS prescription_id
         FROM {owners} o
         JOIN {events} e ON e.{column} = o.id AND e.status = 'ACTIVE'
         LEFT JOIN status_check_tracking sc
             ON sc.owner_kind = ?2 AND sc.owner_id = o.id
             AND sc.prescription_id = {prescription_expr}
         WHERE e.erx_status IN ({statuses})
           AND e.creation_date < ?1
           AND (sc.owner_id IS NULL OR (sc.finished_at IS NULL AND sc.last_enqueued_at < ?1))
           {extra_filter}",
        owners = owner_table(kind),
        events = events_table(kind),
        column = owner_column(kind),
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![format_timestamp(cutoff), kind.as_str()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?))
    })?;

    let mut targets = Vec::new();
    for row in rows {
        let (owner_id, prescription_id) = row?;
        // Entered treatments have not been routed yet; nothing to poll.
        let Some(prescription_id) = prescription_id else {
            continue;
        };
        targets.push(StatusTarget {
            prescription_id,
            owner_kind: kind,
            owner_id: parse_uuid(&owner_id)?,
        });
    }
    Ok(targets)
}
