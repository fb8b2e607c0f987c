//! At-least-once work queue carrying routing and status-check jobs.

pub mod sqlite;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::models::StatusTarget;

pub use sqlite::{QueueStore, SqliteWorkQueue};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Cannot encode queue message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Malformed queue message: {0}")]
    Malformed(String),

    #[error("Internal lock error")]
    LockPoisoned,
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(DatabaseError::from(e))
    }
}

/// Jobs exchanged between workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueMessage {
    /// Send every treatment of a submitted plan to the gateway.
    RouteTreatmentPlan {
        treatment_plan_id: Uuid,
        doctor_id: Uuid,
        patient_id: Uuid,
    },
    /// Reconcile one or more prescriptions against the gateway.
    StatusCheck {
        targets: Vec<StatusTarget>,
        /// 1 for the first check; incremented on every requeue.
        attempt: u32,
    },
}

/// Opaque token proving the holder received a particular delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

/// One delivery of a message. The body is decoded lazily so a malformed
/// message can still be acknowledged.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub receipt: ReceiptHandle,
    pub body: String,
    /// How many times the message has been delivered, this one included.
    pub receive_count: u32,
}

impl ReceivedMessage {
    pub fn decode(&self) -> Result<QueueMessage, QueueError> {
        serde_json::from_str(&self.body).map_err(|e| QueueError::Malformed(e.to_string()))
    }
}

pub trait WorkQueue: Send + Sync {
    /// Enqueue a message, invisible to receivers for `delay`.
    fn send(&self, message: &QueueMessage, delay: Duration) -> Result<(), QueueError>;

    /// Take up to `max` visible messages, hiding them for `visibility`.
    fn receive(&self, max: usize, visibility: Duration) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Acknowledge a delivery. Returns false if the receipt is no longer
    /// current (the message was redelivered or already deleted).
    fn delete(&self, receipt: &ReceiptHandle) -> Result<bool, QueueError>;

    /// Hand a delivery back to the queue, visible again after `delay`.
    fn release(&self, receipt: &ReceiptHandle, delay: Duration) -> Result<bool, QueueError>;
}
