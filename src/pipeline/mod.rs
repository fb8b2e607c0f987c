//! Prescription lifecycle pipeline: routing, status polling, refill intake,
//! transmission-error reconciliation and the doctor-facing decisions, plus
//! the worker runtime that drives them.

pub mod background;
pub mod context;
pub mod error;
pub mod error_resolution;
pub mod refill_decision;
pub mod refill_intake;
pub mod router;
pub mod status;
pub mod sweeper;
pub mod transmission_errors;

#[cfg(test)]
mod scenario_tests;

pub use background::{start_workers, WorkerHandle};
pub use context::PipelineContext;
pub use error::PipelineError;
pub use error_resolution::resolve_transmission_error;
pub use refill_decision::{
    approve_refill, deny_refill, deny_refill_with_new_rx, denial_reasons, DntfTreatment,
    RefillDecision,
};
pub use refill_intake::{intake_refill_item, run_refill_intake, IntakeSummary};
pub use router::{process_routing_batch, route_treatment_plan, RoutingOutcome};
pub use status::{enqueue_status_check, process_status_batch, reconcile_target, ReconcileOutcome};
pub use sweeper::{run_status_sweep, SweepSummary};
pub use transmission_errors::{run_transmission_error_cycle, TransmissionErrorSummary};
