use std::str::FromStr;

use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::parse_uuid;
use crate::db::{format_timestamp, parse_timestamp, DatabaseError};
use crate::models::{DoctorQueueItem, QueueEventType, QueueItemKind, QueueItemStatus};

const QUEUE_COLUMNS: &str =
    "id, doctor_id, event_type, item_id, item_kind, status, description, enqueue_date, dequeue_date";

/// Insert a work item. A Pending item for the same (doctor, type, item) is
/// unique, so re-emission is a no-op; returns false in that case.
pub fn insert_doctor_queue_item(
    conn: &Connection,
    item: &DoctorQueueItem,
) -> Result<bool, DatabaseError> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO doctor_queue (id, doctor_id, event_type, item_id, item_kind,
         status, description, enqueue_date, dequeue_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            item.id.to_string(),
            item.doctor_id.to_string(),
            item.event_type.as_str(),
            item.item_id.to_string(),
            item.item_kind.as_str(),
            item.status.as_str(),
            item.description,
            format_timestamp(&item.enqueue_date),
            item.dequeue_date.as_ref().map(format_timestamp),
        ],
    )?;
    Ok(inserted > 0)
}

/// Move the Pending item for (type, item) to a completed status. The row is
/// updated in place so exactly one copy survives. Returns false when there
/// was no Pending item.
pub fn complete_pending_queue_item(
    conn: &Connection,
    event_type: QueueEventType,
    item_id: &Uuid,
    new_status: QueueItemStatus,
    at: &NaiveDateTime,
) -> Result<bool, DatabaseError> {
    let updated = conn.execute(
        "UPDATE doctor_queue SET status = ?3, dequeue_date = ?4
         WHERE event_type = ?1 AND item_id = ?2 AND status = 'PENDING'",
        params![
            event_type.as_str(),
            item_id.to_string(),
            new_status.as_str(),
            format_timestamp(at),
        ],
    )?;
    Ok(updated > 0)
}

pub fn get_pending_queue_items(
    conn: &Connection,
    doctor_id: &Uuid,
) -> Result<Vec<DoctorQueueItem>, DatabaseError> {
    let sql = format!(
        "SELECT {QUEUE_COLUMNS} FROM doctor_queue
         WHERE doctor_id = ?1 AND status = 'PENDING' ORDER BY enqueue_date, id"
    );
    query_items(conn, &sql, &doctor_id.to_string())
}

/// Every queue row, pending or not, that refers to the given item.
pub fn get_queue_items_for_item(
    conn: &Connection,
    item_id: &Uuid,
) -> Result<Vec<DoctorQueueItem>, DatabaseError> {
    let sql = format!(
        "SELECT {QUEUE_COLUMNS} FROM doctor_queue WHERE item_id = ?1 ORDER BY enqueue_date, id"
    );
    query_items(conn, &sql, &item_id.to_string())
}

fn query_items(
    conn: &Connection,
    sql: &str,
    key: &str,
) -> Result<Vec<DoctorQueueItem>, DatabaseError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![key], queue_row_from_rusqlite)?;

    let mut items = Vec::new();
    for row in rows {
        items.push(queue_item_from_row(row?)?);
    }
    Ok(items)
}

struct QueueRow {
    id: String,
    doctor_id: String,
    event_type: String,
    item_id: String,
    item_kind: String,
    status: String,
    description: Option<String>,
    enqueue_date: String,
    dequeue_date: Option<String>,
}

fn queue_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<QueueRow, rusqlite::Error> {
    Ok(QueueRow {
        id: row.get(0)?,
        doctor_id: row.get(1)?,
        event_type: row.get(2)?,
        item_id: row.get(3)?,
        item_kind: row.get(4)?,
        status: row.get(5)?,
        description: row.get(6)?,
        enqueue_date: row.get(7)?,
        dequeue_date: row.get(8)?,
    })
}

fn queue_item_from_row(row: QueueRow) -> Result<DoctorQueueItem, DatabaseError> {
    Ok(DoctorQueueItem {
        id: parse_uuid(&row.id)?,
        doctor_id: parse_uuid(&row.doctor_id)?,
        event_type: QueueEventType::from_str(&row.event_type)?,
        item_id: parse_uuid(&row.item_id)?,
        item_kind: QueueItemKind::from_str(&row.item_kind)?,
        status: QueueItemStatus::from_str(&row.status)?,
        description: row.description,
        enqueue_date: parse_timestamp(&row.enqueue_date)?,
        dequeue_date: row.dequeue_date.as_deref().map(parse_timestamp).transpose()?,
    })
}
