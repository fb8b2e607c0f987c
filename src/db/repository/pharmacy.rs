use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::parse_uuid;
use crate::db::DatabaseError;
use crate::models::{Address, Pharmacy};

const PHARMACY_COLUMNS: &str = "id, source, source_id, name, address_line_1, address_line_2,
     city, state, postal_code, phone";

pub fn insert_pharmacy(conn: &Connection, pharmacy: &Pharmacy) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO pharmacies (id, source, source_id, name, address_line_1, address_line_2,
         city, state, postal_code, phone)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            pharmacy.id.to_string(),
            pharmacy.source,
            pharmacy.source_id,
            pharmacy.name,
            pharmacy.address.line_1,
            pharmacy.address.line_2,
            pharmacy.address.city,
            pharmacy.address.state,
            pharmacy.address.postal_code,
            pharmacy.phone,
        ],
    )?;
    Ok(())
}

/// Insert unless (source, source_id) already exists; returns the stored row
/// either way. Concurrent first sightings converge on one row.
pub fn upsert_pharmacy(conn: &Connection, pharmacy: &Pharmacy) -> Result<Pharmacy, DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO pharmacies (id, source, source_id, name, address_line_1,
         address_line_2, city, state, postal_code, phone)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            pharmacy.id.to_string(),
            pharmacy.source,
            pharmacy.source_id,
            pharmacy.name,
            pharmacy.address.line_1,
            pharmacy.address.line_2,
            pharmacy.address.city,
            pharmacy.address.state,
            pharmacy.address.postal_code,
            pharmacy.phone,
        ],
    )?;
    find_pharmacy_by_source(conn, &pharmacy.source, pharmacy.source_id)?.ok_or_else(|| {
        DatabaseError::NotFound {
            entity_type: "Pharmacy".into(),
            id: format!("{}:{}", pharmacy.source, pharmacy.source_id),
        }
    })
}

pub fn get_pharmacy(conn: &Connection, id: &Uuid) -> Result<Pharmacy, DatabaseError> {
    let sql = format!("SELECT {PHARMACY_COLUMNS} FROM pharmacies WHERE id = ?1");
    let row = conn
        .query_row(&sql, params![id.to_string()], pharmacy_row_from_rusqlite)
        .optional()?
        .ok_or_else(|| DatabaseError::NotFound {
            entity_type: "Pharmacy".into(),
            id: id.to_string(),
        })?;
    pharmacy_from_row(row)
}

pub fn find_pharmacy_by_source(
    conn: &Connection,
    source: &str,
    source_id: i64,
) -> Result<Option<Pharmacy>, DatabaseError> {
    let sql = format!("SELECT {PHARMACY_COLUMNS} FROM pharmacies WHERE source = ?1 AND source_id = ?2");
    conn.query_row(&sql, params![source, source_id], pharmacy_row_from_rusqlite)
        .optional()?
        .map(pharmacy_from_row)
        .transpose()
}

struct PharmacyRow {
    id: String,
    source: String,
    source_id: i64,
    name: String,
    address_line_1: Option<String>,
    address_line_2: Option<String>,
    city: Option<String>,
    state: Option<String>,
    postal_code: Option<String>,
    phone: Option<String>,
}

fn pharmacy_row_from_rusqlite(row: &rusqlite::Row<'_>) -> Result<PharmacyRow, rusqlite::Error> {
    Ok(PharmacyRow {
        id: row.get(0)?,
        source: row.get(1)?,
        source_id: row.get(2)?,
        name: row.get(3)?,
        address_line_1: row.get(4)?,
        address_line_2: row.get(5)?,
        city: row.get(6)?,
        state: row.get(7)?,
        postal_code: row.get(8)?,
        phone: row.get(9)?,
    })
}

fn pharmacy_from_row(row: PharmacyRow) -> Result<Pharmacy, DatabaseError> {
    Ok(Pharmacy {
        id: parse_uuid(&row.id)?,
        source: row.source,
        source_id: row.source_id,
        name: row.name,
        address: Address {
            line_1: row.address_line_1,
            line_2: row.address_line_2,
            city: row.city,
            state: row.state,
            postal_code: row.postal_code,
        },
        phone: row.phone,
    })
}
