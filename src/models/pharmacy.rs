use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::patient::Address;

/// Shared, never owned. Unique on (source, source_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pharmacy {
    pub id: Uuid,
    /// Directory the source id belongs to, e.g. "surescripts".
    pub source: String,
    pub source_id: i64,
    pub name: String,
    pub address: Address,
    pub phone: Option<String>,
}
