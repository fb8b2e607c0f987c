//! Fixtures, a scriptable in-memory gateway and a wired-up harness shared by
//! the unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::Connection;
use uuid::Uuid;

use crate::config::{PipelineConfig, ROUTING_QUEUE, STATUS_QUEUE};
use crate::db::{
    self, append_status_event, get_status_history, get_treatment, insert_doctor,
    insert_doctor_queue_item, insert_patient, insert_pharmacy, insert_refill_request,
    insert_treatment, insert_treatment_plan, mark_treatment_routed, open_database,
    open_memory_database,
};
use crate::dispatch::{DispatcherBuilder, PipelineEvent};
use crate::erx::*;
use crate::lock::SqliteLease;
use crate::models::*;
use crate::pipeline::PipelineContext;
use crate::queue::{QueueStore, SqliteWorkQueue};

pub const CLINICIAN_ID: i64 = 1001;
pub const PATIENT_ERX_ID: i64 = 60;
const FIXTURE_PHARMACY_SOURCE_ID: i64 = 1234;
const FIRST_PRESCRIPTION_ID: i64 = 100;

pub fn ts(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
}

pub fn sample_rx(name: &str) -> RxDetails {
    RxDetails {
        drug_internal_name: format!("{name} (topical - cream)"),
        drug_name: name.to_string(),
        drug_route: Some("topical".into()),
        drug_form: Some("cream".into()),
        dosage_strength: "0.025%".into(),
        dispense_value: 30.0,
        dispense_unit_id: 26,
        dispense_unit_description: Some("Gram".into()),
        refills: 1,
        days_supply: Some(30),
        substitutions_allowed: true,
        is_controlled_substance: false,
        patient_instructions: "Apply a thin layer twice daily".into(),
        pharmacy_notes: None,
        drug_db_ids: BTreeMap::from([("NDC".to_string(), "00062-0190-20".to_string())]),
    }
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        gateway_base_url: "http://gateway.test".into(),
        instance_id: "test-instance".into(),
        ..PipelineConfig::default()
    }
}

pub fn seed_pharmacy(conn: &Connection, source_id: i64) -> Pharmacy {
    let pharmacy = Pharmacy {
        id: Uuid::new_v4(),
        source: "surescripts".into(),
        source_id,
        name: format!("Corner Pharmacy #{source_id}"),
        address: Address {
            line_1: Some("12 Main St".into()),
            city: Some("Springfield".into()),
            state: Some("IL".into()),
            postal_code: Some("62701".into()),
            ..Address::default()
        },
        phone: Some("555-0100".into()),
    };
    insert_pharmacy(conn, &pharmacy).unwrap();
    pharmacy
}

pub fn pharmacy_record(source_id: i64) -> PharmacyRecord {
    PharmacyRecord {
        source_id,
        name: format!("Pharmacy {source_id}"),
        address: Address {
            city: Some("Shelbyville".into()),
            ..Address::default()
        },
        phone: Some("555-0199".into()),
    }
}

pub fn demographics(erx_patient_id: i64, preferred_pharmacy_source_id: Option<i64>) -> PatientDemographics {
    PatientDemographics {
        erx_patient_id: Some(erx_patient_id),
        first_name: "Sam".into(),
        last_name: format!("Patient{erx_patient_id}"),
        date_of_birth: NaiveDate::from_ymd_opt(1988, 4, 12),
        gender: None,
        phone: Some("555-0142".into()),
        address: Address {
            line_1: Some("8 Elm St".into()),
            city: Some("Springfield".into()),
            ..Address::default()
        },
        preferred_pharmacy_source_id,
    }
}

/// A gateway refill item from the fixture clinician.
pub fn refill_item(
    queue_item_id: i64,
    erx_patient_id: i64,
    requested_prescription_id: Option<i64>,
) -> RefillRequestItem {
    RefillRequestItem {
        queue_item_id,
        reference_number: Some(format!("REF-{queue_item_id}")),
        pharmacy_rx_reference: Some(format!("RX-{queue_item_id}")),
        erx_patient_id,
        clinician_id: CLINICIAN_ID,
        pharmacy_source_id: None,
        requested_prescription: Some(PrescriptionSnapshot {
            prescription_id: requested_prescription_id,
            rx: sample_rx("Tretinoin"),
        }),
        dispensed_prescription: None,
        request_date: ts("2024-02-01 08:00:00"),
    }
}

// ═══════════════════════════════════════════════════════════
// Fixture
// ═══════════════════════════════════════════════════════════

/// A doctor with a clinician id and a registered patient whose preferred
/// pharmacy is on file.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub doctor: Doctor,
    pub pharmacy: Pharmacy,
    pub patient: Patient,
}

impl Fixture {
    pub fn registered(conn: &Connection) -> Self {
        let doctor = Doctor {
            id: Uuid::new_v4(),
            first_name: "Avery".into(),
            last_name: "Lindqvist".into(),
            clinician_id: Some(CLINICIAN_ID),
        };
        insert_doctor(conn, &doctor).unwrap();
        let pharmacy = seed_pharmacy(conn, FIXTURE_PHARMACY_SOURCE_ID);
        let patient = registered_patient(conn, PATIENT_ERX_ID, &pharmacy);
        Self {
            doctor,
            pharmacy,
            patient,
        }
    }

    pub fn other_registered_patient(&self, conn: &Connection, erx_patient_id: i64) -> Patient {
        registered_patient(conn, erx_patient_id, &self.pharmacy)
    }

    /// A submitted plan whose treatments are all Entered.
    pub fn plan(&self, conn: &Connection, rxs: Vec<RxDetails>) -> (TreatmentPlan, Vec<Treatment>) {
        let plan = TreatmentPlan {
            id: Uuid::new_v4(),
            patient_id: self.patient.id,
            doctor_id: self.doctor.id,
            status: TreatmentPlanStatus::Submitted,
            created_at: ts("2024-01-01 09:00:00"),
        };
        insert_treatment_plan(conn, &plan).unwrap();

        let treatments = rxs
            .into_iter()
            .map(|rx| {
                let treatment = Treatment {
                    id: Uuid::new_v4(),
                    treatment_plan_id: plan.id,
                    rx,
                    erx_id: None,
                    pharmacy_id: None,
                    erx_sent_date: None,
                    created_at: ts("2024-01-01 09:00:00"),
                };
                insert_treatment(conn, &treatment).unwrap();
                append_status_event(
                    conn,
                    OwnerKind::Treatment,
                    &treatment.id,
                    &NewStatusEvent::new(ErxStatus::Entered, ts("2024-01-01 09:00:00")),
                )
                .unwrap();
                treatment
            })
            .collect();
        (plan, treatments)
    }

    pub fn entered_treatment(&self, conn: &Connection, name: &str) -> Treatment {
        let (_, mut treatments) = self.plan(conn, vec![sample_rx(name)]);
        treatments.remove(0)
    }

    /// A treatment routed as `erx_id` and Sending since 2024-01-01 10:00.
    pub fn sending_treatment(&self, conn: &Connection, name: &str, erx_id: i64) -> Treatment {
        let treatment = self.entered_treatment(conn, name);
        let at = ts("2024-01-01 10:00:00");
        mark_treatment_routed(conn, &treatment.id, erx_id, &self.pharmacy.id, &at).unwrap();
        append_status_event(
            conn,
            OwnerKind::Treatment,
            &treatment.id,
            &NewStatusEvent::new(ErxStatus::Sending, at),
        )
        .unwrap();
        get_treatment(conn, &treatment.id).unwrap()
    }

    /// A Requested refill with its pending doctor-queue item, optionally
    /// linked to the treatment it refills.
    pub fn refill_request(
        &self,
        conn: &Connection,
        queue_item_id: i64,
        originating: Option<&Treatment>,
    ) -> RefillRequest {
        self.insert_refill(conn, queue_item_id, originating, sample_rx("Tretinoin"))
    }

    pub fn controlled_refill_request(&self, conn: &Connection, queue_item_id: i64) -> RefillRequest {
        let mut rx = sample_rx("Oxycodone");
        rx.is_controlled_substance = true;
        self.insert_refill(conn, queue_item_id, None, rx)
    }

    fn insert_refill(
        &self,
        conn: &Connection,
        queue_item_id: i64,
        originating: Option<&Treatment>,
        rx: RxDetails,
    ) -> RefillRequest {
        let requested_id = originating
            .and_then(|t| t.erx_id)
            .unwrap_or(7000 + queue_item_id);
        let refill = RefillRequest {
            id: Uuid::new_v4(),
            erx_queue_item_id: queue_item_id,
            reference_number: Some(format!("REF-{queue_item_id}")),
            pharmacy_rx_reference: Some(format!("RX-{queue_item_id}")),
            patient_id: self.patient.id,
            doctor_id: self.doctor.id,
            pharmacy_id: Some(self.pharmacy.id),
            requested_prescription: PrescriptionSnapshot {
                prescription_id: Some(requested_id),
                rx,
            },
            dispensed_prescription: None,
            originating_treatment_id: originating.map(|t| t.id),
            approved_prescription_id: None,
            approved_refill_amount: None,
            comments: None,
            denial_reason_id: None,
            clinician_id: CLINICIAN_ID,
            request_date: ts("2024-02-01 08:00:00"),
            created_at: ts("2024-02-01 08:00:00"),
        };
        assert!(insert_refill_request(conn, &refill).unwrap());
        append_status_event(
            conn,
            OwnerKind::RefillRequest,
            &refill.id,
            &NewStatusEvent::new(ErxStatus::Requested, refill.request_date),
        )
        .unwrap();
        insert_doctor_queue_item(
            conn,
            &DoctorQueueItem::pending(
                self.doctor.id,
                QueueEventType::RefillRequest,
                refill.id,
                QueueItemKind::RefillRequest,
                refill.request_date,
            ),
        )
        .unwrap();
        refill
    }
}

fn registered_patient(conn: &Connection, erx_patient_id: i64, pharmacy: &Pharmacy) -> Patient {
    let patient = Patient {
        id: Uuid::new_v4(),
        erx_patient_id: Some(erx_patient_id),
        first_name: "Riley".into(),
        last_name: format!("Okafor{erx_patient_id}"),
        date_of_birth: NaiveDate::from_ymd_opt(1991, 7, 3),
        gender: None,
        phone: Some("555-0123".into()),
        address: Address {
            line_1: Some("41 Oak Ave".into()),
            city: Some("Springfield".into()),
            state: Some("IL".into()),
            postal_code: Some("62704".into()),
            ..Address::default()
        },
        status: PatientStatus::Registered,
        preferred_pharmacy_id: Some(pharmacy.id),
        created_at: ts("2023-12-01 12:00:00"),
    };
    insert_patient(conn, &patient).unwrap();
    patient
}

// ═══════════════════════════════════════════════════════════
// Fake gateway
// ═══════════════════════════════════════════════════════════

type StatusHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct FakeState {
    next_prescription_id: i64,
    assigned_patient_id: Option<i64>,
    statuses: HashMap<i64, Vec<GatewayStatusEvent>>,
    transmission_errors: HashMap<i64, Vec<TransmissionErrorReport>>,
    refill_items: HashMap<i64, Vec<RefillRequestItem>>,
    patients: HashMap<i64, PatientDemographics>,
    pharmacies: HashMap<i64, PharmacyRecord>,
    rejections: HashMap<Uuid, String>,
    send_failures: VecDeque<GatewayError>,
    status_failures: VecDeque<GatewayError>,
    decision_failures: VecDeque<GatewayError>,
    transmission_error_failures: VecDeque<GatewayError>,
    refill_queue_failures: VecDeque<GatewayError>,
    send_count: usize,
    decision_count: usize,
    pharmacy_lookups: usize,
    calls: Vec<String>,
}

impl FakeState {
    fn next_id(&mut self) -> i64 {
        let id = self.next_prescription_id;
        self.next_prescription_id += 1;
        id
    }
}

/// Scriptable gateway. Prescription ids are handed out from 100 upward.
pub struct FakeGateway {
    state: Mutex<FakeState>,
    status_hook: Mutex<Option<StatusHook>>,
}

impl Default for FakeGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_prescription_id: FIRST_PRESCRIPTION_ID,
                ..FakeState::default()
            }),
            status_hook: Mutex::new(None),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_next_prescription_id(&self, id: i64) {
        self.with_state(|s| s.next_prescription_id = id);
    }

    /// Patient id returned by the next sends for a patient the gateway
    /// has not seen.
    pub fn assign_patient_id(&self, erx_patient_id: i64) {
        self.with_state(|s| s.assigned_patient_id = Some(erx_patient_id));
    }

    /// Report `status` for a prescription as of now.
    pub fn push_status(&self, prescription_id: i64, status: ErxStatus, details: Option<&str>) {
        self.push_status_at(prescription_id, status, details, db::now());
    }

    pub fn push_status_at(
        &self,
        prescription_id: i64,
        status: ErxStatus,
        details: Option<&str>,
        reported_at: NaiveDateTime,
    ) {
        self.with_state(|s| {
            s.statuses.entry(prescription_id).or_default().push(GatewayStatusEvent {
                status,
                details: details.map(String::from),
                reported_at,
            })
        });
    }

    pub fn add_transmission_error(&self, clinician_id: i64, prescription_id: i64, details: &str) {
        self.add_transmission_error_at(clinician_id, prescription_id, details, db::now());
    }

    pub fn add_transmission_error_at(
        &self,
        clinician_id: i64,
        prescription_id: i64,
        details: &str,
        error_date: NaiveDateTime,
    ) {
        self.with_state(|s| {
            s.transmission_errors
                .entry(clinician_id)
                .or_default()
                .push(TransmissionErrorReport {
                    prescription_id,
                    details: details.to_string(),
                    error_date,
                })
        });
    }

    /// Queue a refill item under the clinician it names.
    pub fn add_refill_item(&self, item: RefillRequestItem) {
        self.add_refill_item_for(item.clinician_id, item);
    }

    pub fn add_refill_item_for(&self, clinician_id: i64, item: RefillRequestItem) {
        self.with_state(|s| s.refill_items.entry(clinician_id).or_default().push(item));
    }

    pub fn add_patient(&self, patient: PatientDemographics) {
        self.with_state(|s| {
            if let Some(id) = patient.erx_patient_id {
                s.patients.insert(id, patient);
            }
        });
    }

    pub fn add_pharmacy(&self, pharmacy: PharmacyRecord) {
        self.with_state(|s| {
            s.pharmacies.insert(pharmacy.source_id, pharmacy);
        });
    }

    /// Refuse to transmit one treatment of the next sends.
    pub fn reject_treatment(&self, treatment_id: Uuid, reason: &str) {
        self.with_state(|s| {
            s.rejections.insert(treatment_id, reason.to_string());
        });
    }

    pub fn fail_next_send(&self, error: GatewayError) {
        self.with_state(|s| s.send_failures.push_back(error));
    }

    pub fn fail_next_status(&self, error: GatewayError) {
        self.with_state(|s| s.status_failures.push_back(error));
    }

    /// Fail the next approve, deny, DNTF or alert dismissal.
    pub fn fail_next_decision(&self, error: GatewayError) {
        self.with_state(|s| s.decision_failures.push_back(error));
    }

    pub fn fail_next_transmission_errors(&self, error: GatewayError) {
        self.with_state(|s| s.transmission_error_failures.push_back(error));
    }

    pub fn fail_next_refill_queue(&self, error: GatewayError) {
        self.with_state(|s| s.refill_queue_failures.push_back(error));
    }

    /// Run `hook` on every status call, outside the state lock.
    pub fn on_status_call(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.status_hook.lock().unwrap() = Some(Arc::new(hook));
    }

    pub fn send_count(&self) -> usize {
        self.with_state(|s| s.send_count)
    }

    /// Approve, deny and DNTF calls, failed ones included.
    pub fn decision_count(&self) -> usize {
        self.with_state(|s| s.decision_count)
    }

    pub fn pharmacy_lookups(&self) -> usize {
        self.with_state(|s| s.pharmacy_lookups)
    }

    /// Successful write calls in order, e.g. `ignore_alert:100`.
    pub fn calls(&self) -> Vec<String> {
        self.with_state(|s| s.calls.clone())
    }

    fn decide<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> Result<T, GatewayError> {
        self.with_state(|s| {
            s.decision_count += 1;
            match s.decision_failures.pop_front() {
                Some(e) => Err(e),
                None => Ok(f(s)),
            }
        })
    }
}

impl ErxGateway for FakeGateway {
    fn send_prescriptions(
        &self,
        request: &SendPrescriptionsRequest,
    ) -> Result<SendPrescriptionsResponse, GatewayError> {
        self.with_state(|s| {
            s.send_count += 1;
            if let Some(e) = s.send_failures.pop_front() {
                return Err(e);
            }
            let mut response = SendPrescriptionsResponse {
                erx_patient_id: request.patient.erx_patient_id.or(s.assigned_patient_id),
                ..Default::default()
            };
            for outbound in &request.prescriptions {
                let prescription_id = s.next_id();
                match s.rejections.get(&outbound.treatment_id) {
                    Some(reason) => response.rejected.push(RejectedPrescription {
                        treatment_id: outbound.treatment_id,
                        prescription_id: Some(prescription_id),
                        reason: reason.clone(),
                    }),
                    None => response.assigned.push(AssignedPrescription {
                        treatment_id: outbound.treatment_id,
                        prescription_id,
                    }),
                }
            }
            s.calls.push(format!("send:{}", request.prescriptions.len()));
            Ok(response)
        })
    }

    fn get_prescription_status(
        &self,
        prescription_id: i64,
    ) -> Result<Vec<GatewayStatusEvent>, GatewayError> {
        let hook = self.status_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }
        self.with_state(|s| match s.status_failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(s.statuses.get(&prescription_id).cloned().unwrap_or_default()),
        })
    }

    fn get_transmission_errors(
        &self,
        clinician_id: i64,
    ) -> Result<Vec<TransmissionErrorReport>, GatewayError> {
        self.with_state(|s| match s.transmission_error_failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(s
                .transmission_errors
                .get(&clinician_id)
                .cloned()
                .unwrap_or_default()),
        })
    }

    fn get_refill_request_queue(
        &self,
        clinician_id: i64,
    ) -> Result<Vec<RefillRequestItem>, GatewayError> {
        self.with_state(|s| match s.refill_queue_failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(s.refill_items.get(&clinician_id).cloned().unwrap_or_default()),
        })
    }

    fn approve_refill(&self, _clinician_id: i64, approval: &RefillApproval) -> Result<i64, GatewayError> {
        self.decide(|s| {
            let id = s.next_id();
            s.calls.push(format!("approve:{}", approval.queue_item_id));
            id
        })
    }

    fn deny_refill(&self, _clinician_id: i64, denial: &RefillDenial) -> Result<(), GatewayError> {
        self.decide(|s| {
            s.calls
                .push(format!("deny:{}:{}", denial.queue_item_id, denial.denial_reason_code));
        })
    }

    fn deny_refill_with_new_rx(
        &self,
        _clinician_id: i64,
        request: &DntfRequest,
    ) -> Result<i64, GatewayError> {
        self.decide(|s| {
            let id = s.next_id();
            s.calls.push(format!("dntf:{}", request.queue_item_id));
            id
        })
    }

    fn ignore_alert(&self, _clinician_id: i64, prescription_id: i64) -> Result<(), GatewayError> {
        self.with_state(|s| match s.decision_failures.pop_front() {
            Some(e) => Err(e),
            None => {
                s.calls.push(format!("ignore_alert:{prescription_id}"));
                Ok(())
            }
        })
    }

    fn get_patient_details(&self, erx_patient_id: i64) -> Result<PatientDemographics, GatewayError> {
        self.with_state(|s| {
            s.patients
                .get(&erx_patient_id)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(format!("patient {erx_patient_id}")))
        })
    }

    fn get_pharmacy_details(&self, pharmacy_source_id: i64) -> Result<PharmacyRecord, GatewayError> {
        self.with_state(|s| {
            s.pharmacy_lookups += 1;
            s.pharmacies
                .get(&pharmacy_source_id)
                .cloned()
                .ok_or_else(|| GatewayError::NotFound(format!("pharmacy {pharmacy_source_id}")))
        })
    }
}

// ═══════════════════════════════════════════════════════════
// Harness
// ═══════════════════════════════════════════════════════════

/// A database with the registered fixture, a fake gateway and SQLite
/// queues wired into a pipeline context. Published events are recorded.
pub struct Harness {
    pub conn: Connection,
    pub fx: Fixture,
    pub gateway: Arc<FakeGateway>,
    pub routing: Arc<SqliteWorkQueue>,
    pub status: Arc<SqliteWorkQueue>,
    pub ctx: PipelineContext,
    published: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        let conn = open_memory_database().unwrap();
        let store = QueueStore::open_in_memory().unwrap();
        let lease = SqliteLease::open_in_memory(&config.instance_id).unwrap();
        Self::assemble(conn, store, lease, config)
    }

    /// File-backed, so worker threads can open their own connections.
    pub fn on_disk(path: &Path, config: PipelineConfig) -> Self {
        let conn = open_database(path).unwrap();
        let store = QueueStore::open(path).unwrap();
        let lease = SqliteLease::open(path, &config.instance_id).unwrap();
        Self::assemble(conn, store, lease, config)
    }

    /// The fixture patient has never been sent to the gateway.
    pub fn without_patient_erx_id() -> Self {
        let mut h = Self::new();
        h.conn
            .execute(
                "UPDATE patients SET erx_patient_id = NULL WHERE id = ?1",
                [h.fx.patient.id.to_string()],
            )
            .unwrap();
        h.fx.patient.erx_patient_id = None;
        h
    }

    fn assemble(conn: Connection, store: QueueStore, lease: SqliteLease, config: PipelineConfig) -> Self {
        let fx = Fixture::registered(&conn);
        let gateway = Arc::new(FakeGateway::new());
        let routing = Arc::new(store.queue(ROUTING_QUEUE));
        let status = Arc::new(store.queue(STATUS_QUEUE));

        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = published.clone();
        let dispatcher = DispatcherBuilder::new()
            .subscribe_all(move |event: &PipelineEvent| {
                sink.lock().map_err(|e| e.to_string())?.push(event.clone());
                Ok(())
            })
            .build();

        let ctx = PipelineContext {
            config,
            gateway: gateway.clone(),
            routing_queue: routing.clone(),
            status_queue: status.clone(),
            lease: Arc::new(lease),
            dispatcher: Arc::new(dispatcher),
        };
        Self {
            conn,
            fx,
            gateway,
            routing,
            status,
            ctx,
            published,
        }
    }

    pub fn statuses(&self, kind: OwnerKind, id: &Uuid) -> Vec<ErxStatus> {
        get_status_history(&self.conn, kind, id)
            .unwrap()
            .into_iter()
            .map(|e| e.status)
            .collect()
    }

    pub fn published(&self) -> Vec<PipelineEvent> {
        self.published.lock().unwrap().clone()
    }
}
