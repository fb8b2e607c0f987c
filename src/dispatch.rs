//! In-process event dispatcher.
//!
//! Subscribers register during startup through [`DispatcherBuilder`]; the
//! built [`Dispatcher`] is immutable and shared as `Arc<Dispatcher>`.
//! Events are published after the triggering transaction commits.

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use crate::models::{OwnerKind, QueueEventType};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    TreatmentPlanRouted {
        treatment_plan_id: Uuid,
        routed: usize,
        rejected: usize,
    },
    RefillRequestCreated {
        refill_request_id: Uuid,
        doctor_id: Uuid,
    },
    RefillRequestResolved {
        refill_request_id: Uuid,
        approved: bool,
    },
    TransmissionError {
        owner_kind: OwnerKind,
        owner_id: Uuid,
        event_type: QueueEventType,
    },
    TransmissionErrorResolved {
        owner_kind: OwnerKind,
        owner_id: Uuid,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TreatmentPlanRouted,
    RefillRequestCreated,
    RefillRequestResolved,
    TransmissionError,
    TransmissionErrorResolved,
}

impl PipelineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::TreatmentPlanRouted { .. } => EventKind::TreatmentPlanRouted,
            Self::RefillRequestCreated { .. } => EventKind::RefillRequestCreated,
            Self::RefillRequestResolved { .. } => EventKind::RefillRequestResolved,
            Self::TransmissionError { .. } => EventKind::TransmissionError,
            Self::TransmissionErrorResolved { .. } => EventKind::TransmissionErrorResolved,
        }
    }
}

type Subscriber = Box<dyn Fn(&PipelineEvent) -> Result<(), String> + Send + Sync>;

#[derive(Default)]
pub struct DispatcherBuilder {
    subscribers: HashMap<EventKind, Vec<Subscriber>>,
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(mut self, kind: EventKind, subscriber: F) -> Self
    where
        F: Fn(&PipelineEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        self.subscribers
            .entry(kind)
            .or_default()
            .push(Box::new(subscriber));
        self
    }

    /// Subscribe the same handler to every event kind.
    pub fn subscribe_all<F>(mut self, subscriber: F) -> Self
    where
        F: Fn(&PipelineEvent) -> Result<(), String> + Send + Sync + Clone + 'static,
    {
        for kind in [
            EventKind::TreatmentPlanRouted,
            EventKind::RefillRequestCreated,
            EventKind::RefillRequestResolved,
            EventKind::TransmissionError,
            EventKind::TransmissionErrorResolved,
        ] {
            self = self.subscribe(kind, subscriber.clone());
        }
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            subscribers: self.subscribers,
        }
    }
}

pub struct Dispatcher {
    subscribers: HashMap<EventKind, Vec<Subscriber>>,
}

impl Dispatcher {
    /// A dispatcher with no subscribers.
    pub fn empty() -> Self {
        DispatcherBuilder::new().build()
    }

    /// Dispatcher used by the binary: every event is logged.
    pub fn with_logging() -> Self {
        DispatcherBuilder::new()
            .subscribe_all(|event| {
                let payload = serde_json::to_string(event).map_err(|e| e.to_string())?;
                tracing::info!(kind = ?event.kind(), %payload, "Pipeline event");
                Ok(())
            })
            .build()
    }

    pub fn publish(&self, event: &PipelineEvent) {
        let Some(subscribers) = self.subscribers.get(&event.kind()) else {
            return;
        };
        for subscriber in subscribers {
            if let Err(e) = subscriber(event) {
                tracing::warn!(kind = ?event.kind(), error = %e, "Event subscriber failed");
            }
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.get(&kind).map_or(0, Vec::len)
    }
}
