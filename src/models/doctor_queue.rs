use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::enums::{QueueEventType, QueueItemKind, QueueItemStatus};

/// A row in a doctor's work list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoctorQueueItem {
    pub id: Uuid,
    pub doctor_id: Uuid,
    pub event_type: QueueEventType,
    pub item_id: Uuid,
    pub item_kind: QueueItemKind,
    pub status: QueueItemStatus,
    pub description: Option<String>,
    pub enqueue_date: NaiveDateTime,
    pub dequeue_date: Option<NaiveDateTime>,
}

impl DoctorQueueItem {
    pub fn pending(
        doctor_id: Uuid,
        event_type: QueueEventType,
        item_id: Uuid,
        item_kind: QueueItemKind,
        enqueue_date: NaiveDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            doctor_id,
            event_type,
            item_id,
            item_kind,
            status: QueueItemStatus::Pending,
            description: None,
            enqueue_date,
            dequeue_date: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}
