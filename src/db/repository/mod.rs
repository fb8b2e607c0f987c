//! Repository layer: entity-scoped database operations.
//!
//! Free functions over a borrowed `Connection`; callers own transaction
//! boundaries. All public functions are re-exported here.

mod doctor;
mod doctor_queue;
mod dntf_mapping;
mod owner;
mod patient;
mod pharmacy;
mod refill_request;
mod rx;
mod status_check;
mod status_event;
mod treatment;
mod treatment_plan;
mod unlinked_dntf;

use uuid::Uuid;

use super::DatabaseError;

pub use doctor::*;
pub use doctor_queue::*;
pub use dntf_mapping::*;
pub use owner::*;
pub use patient::*;
pub use pharmacy::*;
pub use refill_request::*;
pub use status_check::*;
pub use status_event::{
    append_status_event, get_active_status, get_active_status_event, get_status_history,
};
pub use treatment::*;
pub use treatment_plan::*;
pub use unlinked_dntf::*;

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::ConstraintViolation(e.to_string()))
}

pub(crate) fn parse_opt_uuid(s: Option<String>) -> Result<Option<Uuid>, DatabaseError> {
    s.as_deref().map(parse_uuid).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::open_memory_database;
    use crate::models::*;
    use crate::test_support::*;
    use chrono::Duration;
    use rusqlite::Connection;

    fn test_db() -> Connection {
        open_memory_database().unwrap()
    }

    // ── Status events ───────────────────────────────────────

    #[test]
    fn append_flips_previous_active() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let treatment = fx.entered_treatment(&conn, "Tretinoin");

        append_status_event(
            &conn,
            OwnerKind::Treatment,
            &treatment.id,
            &NewStatusEvent::new(ErxStatus::Sending, ts("2024-01-02 10:00:00")),
        )
        .unwrap();

        let history = get_status_history(&conn, OwnerKind::Treatment, &treatment.id).unwrap();
        let statuses: Vec<_> = history.iter().map(|e| (e.status, e.state)).collect();
        assert_eq!(
            statuses,
            vec![
                (ErxStatus::Entered, EventState::Inactive),
                (ErxStatus::Sending, EventState::Active),
            ]
        );
    }

    #[test]
    fn append_rejects_illegal_transition() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let treatment = fx.entered_treatment(&conn, "Tretinoin");

        let err = append_status_event(
            &conn,
            OwnerKind::Treatment,
            &treatment.id,
            &NewStatusEvent::new(ErxStatus::Sent, ts("2024-01-02 10:00:00")),
        )
        .unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidTransition { .. }));
        assert_eq!(
            get_active_status(&conn, OwnerKind::Treatment, &treatment.id).unwrap(),
            Some(ErxStatus::Entered)
        );
    }

    #[test]
    fn append_refuses_to_rewind() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let treatment = fx.sending_treatment(&conn, "Tretinoin", 100);

        let err = append_status_event(
            &conn,
            OwnerKind::Treatment,
            &treatment.id,
            &NewStatusEvent::new(ErxStatus::Sent, ts("2023-12-31 23:59:59")),
        )
        .unwrap_err();
        assert!(matches!(err, DatabaseError::OutOfOrder { .. }));
    }

    #[test]
    fn equal_timestamps_keep_insertion_order() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let treatment = fx.sending_treatment(&conn, "Tretinoin", 100);
        let active = get_active_status_event(&conn, OwnerKind::Treatment, &treatment.id)
            .unwrap()
            .unwrap();

        append_status_event(
            &conn,
            OwnerKind::Treatment,
            &treatment.id,
            &NewStatusEvent::new(ErxStatus::Sent, active.reported_at),
        )
        .unwrap();

        let history = get_status_history(&conn, OwnerKind::Treatment, &treatment.id).unwrap();
        assert_eq!(history.last().unwrap().status, ErxStatus::Sent);
    }

    #[test]
    fn controlled_substance_never_sending() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let mut rx = sample_rx("Oxycodone");
        rx.is_controlled_substance = true;
        let (_, treatments) = fx.plan(&conn, vec![rx]);

        let err = append_status_event(
            &conn,
            OwnerKind::Treatment,
            &treatments[0].id,
            &NewStatusEvent::new(ErxStatus::Sending, ts("2024-01-02 10:00:00")),
        )
        .unwrap_err();
        assert!(matches!(err, DatabaseError::ControlledSubstance { .. }));
    }

    #[test]
    fn one_active_event_enforced_by_index() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let treatment = fx.entered_treatment(&conn, "Tretinoin");

        let result = conn.execute(
            "INSERT INTO erx_status_events (treatment_id, erx_status, reported_timestamp,
             creation_date, status) VALUES (?1, 'Sending', '2024-01-02 00:00:00.000',
             '2024-01-02 00:00:00.000', 'ACTIVE')",
            rusqlite::params![treatment.id.to_string()],
        );
        assert!(result.is_err());
    }

    // ── Doctor queue ────────────────────────────────────────

    #[test]
    fn pending_queue_item_is_unique() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let item_id = Uuid::new_v4();
        let make = || {
            DoctorQueueItem::pending(
                fx.doctor.id,
                QueueEventType::TransmissionError,
                item_id,
                QueueItemKind::Treatment,
                ts("2024-01-02 10:00:00"),
            )
        };

        assert!(insert_doctor_queue_item(&conn, &make()).unwrap());
        assert!(!insert_doctor_queue_item(&conn, &make()).unwrap());
        assert_eq!(get_pending_queue_items(&conn, &fx.doctor.id).unwrap().len(), 1);
    }

    #[test]
    fn completing_updates_in_place() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let item_id = Uuid::new_v4();
        let item = DoctorQueueItem::pending(
            fx.doctor.id,
            QueueEventType::RefillRequest,
            item_id,
            QueueItemKind::RefillRequest,
            ts("2024-01-02 10:00:00"),
        );
        insert_doctor_queue_item(&conn, &item).unwrap();

        let done = complete_pending_queue_item(
            &conn,
            QueueEventType::RefillRequest,
            &item_id,
            QueueItemStatus::RefillApproved,
            &ts("2024-01-03 10:00:00"),
        )
        .unwrap();
        assert!(done);

        let items = get_queue_items_for_item(&conn, &item_id).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, QueueItemStatus::RefillApproved);
        assert_eq!(items[0].dequeue_date, Some(ts("2024-01-03 10:00:00")));

        // nothing left pending
        assert!(!complete_pending_queue_item(
            &conn,
            QueueEventType::RefillRequest,
            &item_id,
            QueueItemStatus::RefillDenied,
            &ts("2024-01-04 10:00:00"),
        )
        .unwrap());
    }

    // ── Refill requests ─────────────────────────────────────

    #[test]
    fn refill_insert_is_idempotent_on_queue_item() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let first = fx.refill_request(&conn, 9001, None);
        let mut dup = first.clone();
        dup.id = Uuid::new_v4();

        assert!(!insert_refill_request(&conn, &dup).unwrap());
        assert_eq!(count_refill_requests(&conn).unwrap(), 1);
        let stored = find_refill_request_by_queue_item_id(&conn, 9001).unwrap().unwrap();
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.requested_prescription, first.requested_prescription);
    }

    #[test]
    fn refill_insert_surfaces_other_constraint_failures() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let first = fx.refill_request(&conn, 9001, None);
        record_refill_denial(&conn, &first.id, 1, None, Some(77)).unwrap();

        let mut clash = first.clone();
        clash.id = Uuid::new_v4();
        clash.erx_queue_item_id = 9002;
        clash.approved_prescription_id = Some(77);
        assert!(matches!(
            insert_refill_request(&conn, &clash),
            Err(DatabaseError::Sqlite(_))
        ));
        assert_eq!(count_refill_requests(&conn).unwrap(), 1);
    }

    #[test]
    fn existing_queue_items_filtered() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        fx.refill_request(&conn, 1, None);
        fx.refill_request(&conn, 3, None);

        let existing = existing_queue_item_ids(&conn, &[1, 2, 3]).unwrap();
        assert!(existing.contains(&1));
        assert!(!existing.contains(&2));
        assert!(existing.contains(&3));
    }

    #[test]
    fn denial_keeps_approved_id_unless_given() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let refill = fx.refill_request(&conn, 7, None);

        record_refill_denial(&conn, &refill.id, 1, Some("too soon"), None).unwrap();
        let stored = get_refill_request(&conn, &refill.id).unwrap();
        assert_eq!(stored.denial_reason_id, Some(1));
        assert_eq!(stored.approved_prescription_id, None);

        record_refill_denial(&conn, &refill.id, 8, None, Some(77)).unwrap();
        let stored = get_refill_request(&conn, &refill.id).unwrap();
        assert_eq!(stored.approved_prescription_id, Some(77));
    }

    #[test]
    fn denial_reasons_include_dntf_sentinel() {
        let conn = test_db();
        let reasons = list_denial_reasons(&conn).unwrap();
        assert!(reasons.iter().any(|r| r.is_dntf()));
        assert_eq!(reasons.iter().filter(|r| r.is_dntf()).count(), 1);
    }

    // ── DNTF mappings ───────────────────────────────────────

    #[test]
    fn dntf_mapping_round_trip_and_uniqueness() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let refill = fx.refill_request(&conn, 5, None);
        let treatment = fx.entered_treatment(&conn, "Tretinoin");

        let mapping = DntfMapping {
            id: Uuid::new_v4(),
            refill_request_id: refill.id,
            target: DntfTarget::Treatment(treatment.id),
            created_at: ts("2024-01-05 00:00:00"),
        };
        insert_dntf_mapping(&conn, &mapping).unwrap();
        assert_eq!(get_dntf_mapping_for_refill(&conn, &refill.id).unwrap(), Some(mapping.clone()));

        let second = DntfMapping {
            id: Uuid::new_v4(),
            ..mapping
        };
        assert!(insert_dntf_mapping(&conn, &second).is_err());
    }

    #[test]
    fn dntf_mapping_requires_a_target() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let refill = fx.refill_request(&conn, 5, None);

        let result = conn.execute(
            "INSERT INTO dntf_mappings (id, refill_request_id, treatment_id,
             unlinked_dntf_treatment_id, created_at) VALUES (?1, ?2, NULL, NULL, '2024')",
            rusqlite::params![Uuid::new_v4().to_string(), refill.id.to_string()],
        );
        assert!(result.is_err());
    }

    // ── Owners ──────────────────────────────────────────────

    #[test]
    fn owner_lookup_prefers_treatments() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let treatment = fx.sending_treatment(&conn, "Tretinoin", 5504);

        let owner = find_owner_by_prescription_id(&conn, 5504).unwrap().unwrap();
        assert_eq!(owner.kind, OwnerKind::Treatment);
        assert_eq!(owner.id, treatment.id);
        assert_eq!(owner.doctor_id, fx.doctor.id);
        assert!(find_owner_by_prescription_id(&conn, 1).unwrap().is_none());
    }

    #[test]
    fn owner_lookup_finds_approved_refill() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let refill = fx.refill_request(&conn, 11, None);
        record_refill_approval(&conn, &refill.id, 600, 2, None).unwrap();

        let owner = find_owner_by_prescription_id(&conn, 600).unwrap().unwrap();
        assert_eq!(owner.kind, OwnerKind::RefillRequest);
        assert_eq!(owner.id, refill.id);
    }

    // ── Pharmacies ──────────────────────────────────────────

    #[test]
    fn pharmacy_upsert_converges() {
        let conn = test_db();
        let first = seed_pharmacy(&conn, 4321);
        let mut again = first.clone();
        again.id = Uuid::new_v4();
        again.name = "Renamed".into();

        let stored = upsert_pharmacy(&conn, &again).unwrap();
        assert_eq!(stored.id, first.id);
        assert_eq!(stored.name, first.name);
    }

    // ── Status check tracking ───────────────────────────────

    #[test]
    fn untracked_sending_owner_is_stale() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let treatment = fx.sending_treatment(&conn, "Tretinoin", 100);
        let cutoff = crate::db::now() + Duration::minutes(1);

        let targets = list_stale_status_targets(&conn, &cutoff).unwrap();
        assert_eq!(
            targets,
            vec![StatusTarget {
                prescription_id: 100,
                owner_kind: OwnerKind::Treatment,
                owner_id: treatment.id,
            }]
        );
    }

    #[test]
    fn recently_tracked_owner_is_not_stale() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let treatment = fx.sending_treatment(&conn, "Tretinoin", 100);
        let target = StatusTarget {
            prescription_id: 100,
            owner_kind: OwnerKind::Treatment,
            owner_id: treatment.id,
        };
        let later = crate::db::now() + Duration::minutes(10);
        record_status_check_enqueued(&conn, &target, 1, &later).unwrap();

        let cutoff = crate::db::now() + Duration::minutes(1);
        assert!(list_stale_status_targets(&conn, &cutoff).unwrap().is_empty());

        let tracking = get_status_check_tracking(&conn, &target).unwrap().unwrap();
        assert_eq!(tracking.attempts, 1);
        assert!(tracking.finished_at.is_none());
    }

    #[test]
    fn finished_tracking_is_not_swept() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        let treatment = fx.sending_treatment(&conn, "Tretinoin", 100);
        let target = StatusTarget {
            prescription_id: 100,
            owner_kind: OwnerKind::Treatment,
            owner_id: treatment.id,
        };
        let long_ago = ts("2020-01-01 00:00:00");
        record_status_check_enqueued(&conn, &target, 30, &long_ago).unwrap();
        mark_status_check_finished(&conn, &target, &long_ago).unwrap();

        let cutoff = crate::db::now() + Duration::minutes(1);
        assert!(list_stale_status_targets(&conn, &cutoff).unwrap().is_empty());
    }

    #[test]
    fn entered_treatments_are_never_swept() {
        let conn = test_db();
        let fx = Fixture::registered(&conn);
        fx.entered_treatment(&conn, "Tretinoin");
        let cutoff = crate::db::now() + Duration::minutes(1);
        assert!(list_stale_status_targets(&conn, &cutoff).unwrap().is_empty());
    }
}
