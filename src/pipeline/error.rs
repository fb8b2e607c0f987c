use thiserror::Error;
use uuid::Uuid;

use crate::db::DatabaseError;
use crate::erx::GatewayError;
use crate::queue::QueueError;

/// Error kinds surfaced by the routing, polling and decision operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Gateway temporarily unavailable: {0}")]
    GatewayTransient(GatewayError),

    #[error("Gateway rejected the request: {0}")]
    GatewayRejected(String),

    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("Controlled substance blocked: {0}")]
    ControlledSubstanceBlocked(String),

    #[error("Deny with new prescription requires a treatment")]
    MissingTreatment,

    #[error("Invalid treatment: {0}")]
    InvalidTreatment(String),

    #[error("Refill queue item {0} already stored")]
    DuplicateIntake(i64),

    #[error("Doctor {doctor_id} does not own {item}")]
    NotOwned { doctor_id: Uuid, item: String },

    #[error("Out-of-order status event: {0}")]
    OrderingViolation(String),

    #[error("Patient {0} has no preferred pharmacy")]
    PatientHasNoPharmacy(Uuid),

    #[error("Not found: {entity_type} {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Persistence error: {0}")]
    Persistence(DatabaseError),

    #[error("Work queue error: {0}")]
    Queue(#[from] QueueError),
}

impl From<DatabaseError> for PipelineError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::InvalidTransition { .. } => Self::InvalidTransition(e.to_string()),
            DatabaseError::ControlledSubstance { .. } => {
                Self::ControlledSubstanceBlocked(e.to_string())
            }
            DatabaseError::OutOfOrder { .. } => Self::OrderingViolation(e.to_string()),
            DatabaseError::NotFound { entity_type, id } => Self::NotFound { entity_type, id },
            other => Self::Persistence(other),
        }
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(DatabaseError::from(e))
    }
}

impl From<GatewayError> for PipelineError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Rejected(reason) => Self::GatewayRejected(reason),
            GatewayError::NotFound(what) => Self::NotFound {
                entity_type: "gateway record".into(),
                id: what,
            },
            transient => Self::GatewayTransient(transient),
        }
    }
}

impl PipelineError {
    /// Status an HTTP caller of a synchronous operation would see.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::DuplicateIntake(_) => 200,
            Self::MissingTreatment | Self::InvalidTreatment(_) | Self::Validation(_) => 400,
            Self::NotOwned { .. } => 403,
            Self::NotFound { .. } => 404,
            Self::InvalidTransition(_) | Self::OrderingViolation(_) => 409,
            Self::ControlledSubstanceBlocked(_)
            | Self::PatientHasNoPharmacy(_)
            | Self::GatewayRejected(_) => 422,
            Self::GatewayTransient(_) => 503,
            Self::Persistence(_) | Self::Queue(_) => 500,
        }
    }

    /// Whether a worker should hand the work back for a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::GatewayTransient(_) | Self::Queue(_))
    }
}
