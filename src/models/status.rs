//! Prescription status state machine shared by treatments, refill requests
//! and unlinked DNTF treatments.
//!
//! Transitions are checked on every append to a status history, so a caller
//! can never persist a move the machine does not allow.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{ErxStatus, EventState, OwnerKind};
use crate::db::DatabaseError;

/// One row of an owner's status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub id: i64,
    pub owner_kind: OwnerKind,
    pub owner_id: Uuid,
    pub status: ErxStatus,
    pub details: Option<String>,
    /// When the status took effect, as reported by the gateway (or local
    /// time for locally originated transitions).
    pub reported_at: NaiveDateTime,
    /// When the row was written.
    pub created_at: NaiveDateTime,
    pub state: EventState,
}

/// A status transition waiting to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStatusEvent {
    pub status: ErxStatus,
    pub details: Option<String>,
    pub reported_at: NaiveDateTime,
}

impl NewStatusEvent {
    pub fn new(status: ErxStatus, reported_at: NaiveDateTime) -> Self {
        Self {
            status,
            details: None,
            reported_at,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// One prescription to reconcile against the gateway, and whose history it
/// belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusTarget {
    pub prescription_id: i64,
    pub owner_kind: OwnerKind,
    pub owner_id: Uuid,
}

impl ErxStatus {
    /// No further transitions are expected without outside intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::ErrorResolved | Self::Deleted)
    }

    /// Intermediate markers the gateway may echo back while a prescription
    /// is in flight. Seeing one out of sequence is not worth a warning.
    pub fn is_in_flight_marker(&self) -> bool {
        matches!(self, Self::Entered | Self::Sending | Self::NewRxFromDntf)
    }

    /// Whether an owner whose active status is `self` still needs polling.
    pub fn is_pending_for(&self, kind: OwnerKind) -> bool {
        match kind {
            OwnerKind::Treatment | OwnerKind::UnlinkedDntfTreatment => {
                matches!(self, Self::Entered | Self::NewRxFromDntf | Self::Sending)
            }
            OwnerKind::RefillRequest => matches!(self, Self::Approved | Self::Denied),
        }
    }
}

/// Statuses that mean "keep polling" for the given owner kind.
pub fn pending_statuses(kind: OwnerKind) -> Vec<ErxStatus> {
    ErxStatus::ALL
        .iter()
        .copied()
        .filter(|s| s.is_pending_for(kind))
        .collect()
}

/// Whether `to` may follow `from` (or start a history when `from` is None).
pub fn can_transition(kind: OwnerKind, from: Option<ErxStatus>, to: ErxStatus) -> bool {
    use ErxStatus::*;

    if to == Deleted {
        return from.is_some_and(|f| f != Deleted);
    }

    match kind {
        OwnerKind::Treatment | OwnerKind::UnlinkedDntfTreatment => matches!(
            (from, to),
            (None, Entered)
                | (None, NewRxFromDntf)
                | (Some(Entered), Sending)
                | (Some(Entered), NewRxFromDntf)
                | (Some(NewRxFromDntf), Sending)
                | (Some(Sending), Sent)
                | (Some(Sending), Error)
                | (Some(Sent), Error)
                | (Some(Error), ErrorResolved)
        ),
        OwnerKind::RefillRequest => matches!(
            (from, to),
            (None, Requested)
                | (Some(Requested), Approved)
                | (Some(Requested), Denied)
                | (Some(Approved), Sent)
                | (Some(Approved), Error)
                | (Some(Denied), Sent)
                | (Some(Denied), Error)
                | (Some(Sent), Error)
                | (Some(Error), ErrorResolved)
        ),
    }
}

pub fn check_transition(
    kind: OwnerKind,
    from: Option<ErxStatus>,
    to: ErxStatus,
) -> Result<(), DatabaseError> {
    if can_transition(kind, from, to) {
        Ok(())
    } else {
        Err(DatabaseError::InvalidTransition {
            owner_kind: kind.as_str().into(),
            from: from.map_or("(none)", |s| s.as_str()).into(),
            to: to.as_str().into(),
        })
    }
}
