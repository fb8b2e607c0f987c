//! End-to-end flows across the router, workers and doctor services, driven
//! through the queues the way the worker runtime drives them.

use std::time::Duration;

use uuid::Uuid;

use super::*;
use crate::db::{
    find_patient_by_erx_id, find_pharmacy_by_source, find_refill_request_by_queue_item_id,
    get_pending_queue_items, get_queue_items_for_item, get_status_history, get_treatment,
    list_denial_reasons,
};
use crate::erx::RefillRequestItem;
use crate::models::{
    DntfTarget, ErxStatus, EventState, OwnerKind, PatientStatus, QueueEventType, QueueItemStatus,
};
use crate::queue::{QueueMessage, WorkQueue};
use crate::test_support::*;

fn submit(h: &Harness, plan_id: Uuid) {
    h.routing
        .send(
            &QueueMessage::RouteTreatmentPlan {
                treatment_plan_id: plan_id,
                doctor_id: h.fx.doctor.id,
                patient_id: h.fx.patient.id,
            },
            Duration::ZERO,
        )
        .unwrap();
    process_routing_batch(&h.conn, &h.ctx).unwrap();
}

/// Make every scheduled check due and run the status worker once.
fn poll(h: &Harness) -> usize {
    h.status.expedite_all().unwrap();
    process_status_batch(&h.conn, &h.ctx).unwrap()
}

fn history(h: &Harness, kind: OwnerKind, id: &Uuid) -> Vec<(ErxStatus, EventState)> {
    get_status_history(&h.conn, kind, id)
        .unwrap()
        .into_iter()
        .map(|e| (e.status, e.state))
        .collect()
}

fn routed_treatment(h: &Harness) -> Uuid {
    let (plan, treatments) = h.fx.plan(&h.conn, vec![sample_rx("Tretinoin")]);
    submit(h, plan.id);
    treatments[0].id
}

fn unlinked_refill(h: &Harness, queue_item_id: i64) -> RefillRequestItem {
    h.gateway.add_pharmacy(pharmacy_record(4321));
    h.gateway.add_patient(demographics(555, Some(4321)));
    let item = refill_item(queue_item_id, 555, Some(9999));
    h.gateway.add_refill_item(item.clone());
    run_refill_intake(&h.conn, &h.ctx).unwrap();
    item
}

#[test]
fn happy_path_treatment_reaches_sent() {
    let h = Harness::new();
    let treatment_id = routed_treatment(&h);

    assert_eq!(get_treatment(&h.conn, &treatment_id).unwrap().erx_id, Some(100));
    assert_eq!(
        h.statuses(OwnerKind::Treatment, &treatment_id),
        vec![ErxStatus::Entered, ErxStatus::Sending]
    );
    assert_eq!(h.status.len().unwrap(), 1);

    h.gateway.push_status(100, ErxStatus::Sending, None);
    h.gateway.push_status(100, ErxStatus::Sent, None);
    assert_eq!(poll(&h), 1);

    assert_eq!(
        h.statuses(OwnerKind::Treatment, &treatment_id).last(),
        Some(&ErxStatus::Sent)
    );
    assert!(get_pending_queue_items(&h.conn, &h.fx.doctor.id).unwrap().is_empty());
    assert!(h.status.is_empty().unwrap());
}

#[test]
fn sending_then_error_lands_on_doctor_queue() {
    let h = Harness::new();
    let treatment_id = routed_treatment(&h);
    h.gateway.push_status(100, ErxStatus::Error, Some("invalid NDC"));
    poll(&h);

    assert_eq!(
        history(&h, OwnerKind::Treatment, &treatment_id),
        vec![
            (ErxStatus::Entered, EventState::Inactive),
            (ErxStatus::Sending, EventState::Inactive),
            (ErxStatus::Error, EventState::Active),
        ]
    );
    let items = get_pending_queue_items(&h.conn, &h.fx.doctor.id).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].event_type, QueueEventType::TransmissionError);
    assert_eq!(items[0].description.as_deref(), Some("invalid NDC"));
}

#[test]
fn error_worker_catches_missed_transition() {
    let h = Harness::new();
    let treatment_id = routed_treatment(&h);
    h.gateway.push_status(100, ErxStatus::Sending, None);
    h.gateway.push_status(100, ErxStatus::Sent, None);
    poll(&h);
    h.gateway.add_transmission_error(CLINICIAN_ID, 100, "pharmacy rejected");

    run_transmission_error_cycle(&h.conn, &h.ctx).unwrap();
    assert_eq!(
        h.statuses(OwnerKind::Treatment, &treatment_id),
        vec![ErxStatus::Entered, ErxStatus::Sending, ErxStatus::Sent, ErxStatus::Error]
    );
    let items = get_pending_queue_items(&h.conn, &h.fx.doctor.id).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, QueueItemStatus::Pending);

    // polling the same prescription again changes nothing
    enqueue_status_check(
        &h.conn,
        h.status.as_ref(),
        &[crate::models::StatusTarget {
            prescription_id: 100,
            owner_kind: OwnerKind::Treatment,
            owner_id: treatment_id,
        }],
        1,
        Duration::ZERO,
    )
    .unwrap();
    poll(&h);
    assert_eq!(h.statuses(OwnerKind::Treatment, &treatment_id).len(), 4);
}

#[test]
fn refill_for_registered_patient_links_treatment() {
    let h = Harness::new();
    let treatment = h.fx.sending_treatment(&h.conn, "Tretinoin", 5504);
    h.gateway.add_refill_item(refill_item(1, PATIENT_ERX_ID, Some(5504)));

    let summary = run_refill_intake(&h.conn, &h.ctx).unwrap();
    assert_eq!(summary.created, 1);

    let refill = find_refill_request_by_queue_item_id(&h.conn, 1).unwrap().unwrap();
    assert_eq!(refill.originating_treatment_id, Some(treatment.id));
    assert_eq!(refill.patient_id, h.fx.patient.id);
    let items = get_pending_queue_items(&h.conn, &h.fx.doctor.id).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].event_type, QueueEventType::RefillRequest);
    assert_eq!(
        find_patient_by_erx_id(&h.conn, PATIENT_ERX_ID).unwrap().unwrap().status,
        PatientStatus::Registered
    );
}

#[test]
fn refill_for_unknown_patient_creates_unlinked_shell() {
    let h = Harness::new();
    unlinked_refill(&h, 2);

    let shell = find_patient_by_erx_id(&h.conn, 555).unwrap().unwrap();
    assert_eq!(shell.status, PatientStatus::Unlinked);
    assert_eq!(shell.last_name, "Patient555");
    let pharmacy = find_pharmacy_by_source(&h.conn, "surescripts", 4321).unwrap().unwrap();
    assert_eq!(shell.preferred_pharmacy_id, Some(pharmacy.id));

    let refill = find_refill_request_by_queue_item_id(&h.conn, 2).unwrap().unwrap();
    assert_eq!(refill.patient_id, shell.id);
    assert!(refill.originating_treatment_id.is_none());
    assert_eq!(refill.doctor_id, h.fx.doctor.id);
    let items = get_pending_queue_items(&h.conn, &h.fx.doctor.id).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].item_id, refill.id);
}

#[test]
fn dntf_for_unlinked_patient_through_error_and_resolution() {
    let h = Harness::new();
    unlinked_refill(&h, 3);
    let refill = find_refill_request_by_queue_item_id(&h.conn, 3).unwrap().unwrap();
    let reason = list_denial_reasons(&h.conn)
        .unwrap()
        .into_iter()
        .find(|r| r.is_dntf())
        .unwrap();
    h.gateway.set_next_prescription_id(77);

    let decision = deny_refill_with_new_rx(
        &h.conn,
        &h.ctx,
        &h.fx.doctor.id,
        &refill.id,
        reason.id,
        Some("new strength"),
        Some(DntfTreatment::Freeform {
            rx: sample_rx("Tretinoin 0.05%"),
        }),
    )
    .unwrap();
    assert_eq!(decision.prescription_id, Some(77));
    let Some(DntfTarget::UnlinkedDntfTreatment(unlinked_id)) = decision.dntf_target else {
        panic!("expected an unlinked treatment, got {:?}", decision.dntf_target);
    };

    h.gateway.push_status(77, ErxStatus::Error, Some("pharmacy closed"));
    poll(&h);
    assert_eq!(
        history(&h, OwnerKind::UnlinkedDntfTreatment, &unlinked_id),
        vec![
            (ErxStatus::NewRxFromDntf, EventState::Inactive),
            (ErxStatus::Sending, EventState::Inactive),
            (ErxStatus::Error, EventState::Active),
        ]
    );
    let pending: Vec<_> = get_pending_queue_items(&h.conn, &h.fx.doctor.id)
        .unwrap()
        .into_iter()
        .filter(|i| i.event_type == QueueEventType::UnlinkedDntfTransmissionError)
        .collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].item_id, unlinked_id);

    resolve_transmission_error(&h.conn, &h.ctx, OwnerKind::UnlinkedDntfTreatment, &unlinked_id)
        .unwrap();
    assert_eq!(
        h.statuses(OwnerKind::UnlinkedDntfTreatment, &unlinked_id).last(),
        Some(&ErxStatus::ErrorResolved)
    );
    let items = get_queue_items_for_item(&h.conn, &unlinked_id).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, QueueItemStatus::ErrorResolved);
    assert!(h.gateway.calls().contains(&"ignore_alert:77".to_string()));

    // the refill stays Denied
    assert_eq!(
        h.statuses(OwnerKind::RefillRequest, &refill.id).last(),
        Some(&ErxStatus::Denied)
    );
}

// ═══════════════════════════════════════════════════════════
// Idempotence
// ═══════════════════════════════════════════════════════════

#[test]
fn intake_twice_yields_same_refills() {
    let h = Harness::new();
    h.gateway.add_refill_item(refill_item(1, PATIENT_ERX_ID, None));
    h.gateway.add_refill_item(refill_item(2, PATIENT_ERX_ID, None));

    run_refill_intake(&h.conn, &h.ctx).unwrap();
    let first: Vec<_> = [1, 2]
        .iter()
        .map(|id| find_refill_request_by_queue_item_id(&h.conn, *id).unwrap().unwrap().id)
        .collect();
    run_refill_intake(&h.conn, &h.ctx).unwrap();
    let second: Vec<_> = [1, 2]
        .iter()
        .map(|id| find_refill_request_by_queue_item_id(&h.conn, *id).unwrap().unwrap().id)
        .collect();

    assert_eq!(first, second);
    assert_eq!(get_pending_queue_items(&h.conn, &h.fx.doctor.id).unwrap().len(), 2);
}

#[test]
fn status_worker_is_stable_after_terminal_event() {
    let h = Harness::new();
    let treatment_id = routed_treatment(&h);
    h.gateway.push_status(100, ErxStatus::Sent, None);
    poll(&h);
    let settled = h.statuses(OwnerKind::Treatment, &treatment_id);

    let target = crate::models::StatusTarget {
        prescription_id: 100,
        owner_kind: OwnerKind::Treatment,
        owner_id: treatment_id,
    };
    for _ in 0..4 {
        let outcome = reconcile_target(&h.conn, &h.ctx, &target).unwrap();
        assert!(outcome.appended.is_empty());
    }
    assert_eq!(h.statuses(OwnerKind::Treatment, &treatment_id), settled);
}

#[test]
fn transmission_error_worker_is_a_fixed_point() {
    let h = Harness::new();
    h.fx.sending_treatment(&h.conn, "Tretinoin", 5504);
    h.gateway.add_transmission_error(CLINICIAN_ID, 5504, "invalid NDC");

    run_transmission_error_cycle(&h.conn, &h.ctx).unwrap();
    let published = h.published().len();
    let again = run_transmission_error_cycle(&h.conn, &h.ctx).unwrap();

    assert_eq!(again.recorded, 0);
    assert_eq!(h.published().len(), published);
    assert_eq!(get_pending_queue_items(&h.conn, &h.fx.doctor.id).unwrap().len(), 1);
}
