use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use axum::http::StatusCode;
use axum::response::Response;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use crate::workflows::loans::clock::ManualClock;
use crate::workflows::loans::domain::{GroupId, LoanGroup, OfficerCard, ParticipantIntent};
use crate::workflows::loans::intake::{ApplicantForm, EnrollmentForm, FieldMap};
use crate::workflows::loans::notifications::{DeliveryError, MailDelivery, OutboundMessage};
use crate::workflows::loans::officers::{OfficerPool, OfficerSelector};
use crate::workflows::loans::repository::{
    ArchivedGroup, DeliveryEntry, DeliveryKey, DeliveryLedger, LoanGroupRepository,
    RepositoryError, VersionedGroup,
};
use crate::workflows::loans::service::{LoanWorkflowService, WorkflowSettings};
use crate::workflows::loans::store::InMemoryLoanStore;

pub(super) const APPLICANT_EMAIL: &str = "ada@example.org";
pub(super) const GUARANTOR1_EMAIL: &str = "bola@example.org";
pub(super) const GUARANTOR2_EMAIL: &str = "chike@example.org";
pub(super) const OFFICER_EMAIL: &str = "grace@coop.example.org";

pub(super) fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0)
        .single()
        .expect("valid start instant")
}

pub(super) fn fields(pairs: &[(&str, &str)]) -> FieldMap {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

pub(super) fn enrollment_fields(applicant: &str, guarantor1: &str, guarantor2: &str) -> FieldMap {
    let email = |id: &str, default: &str| {
        if id == "A1" || id == "B1" || id == "B2" {
            default.to_string()
        } else {
            format!("{}@example.org", id.to_ascii_lowercase())
        }
    };
    let applicant_email = email(applicant, APPLICANT_EMAIL);
    let guarantor1_email = email(guarantor1, GUARANTOR1_EMAIL);
    let guarantor2_email = email(guarantor2, GUARANTOR2_EMAIL);
    fields(&[
        ("Applicant Cooperator ID", applicant),
        ("Applicant Name", "Ada Obi"),
        ("Applicant Phone", "+234 801 234 5678"),
        ("Applicant Email", &applicant_email),
        ("Guarantor 1 Cooperator ID", guarantor1),
        ("Guarantor 1 Name", "Bola Ade"),
        ("Guarantor 1 Phone", "0802 345 6789"),
        ("Guarantor 1 Email", &guarantor1_email),
        ("Guarantor 2 Cooperator ID", guarantor2),
        ("Guarantor 2 Name", "Chike Eze"),
        ("Guarantor 2 Phone", "0803 456 7890"),
        ("Guarantor 2 Email", &guarantor2_email),
    ])
}

pub(super) fn enrollment(applicant: &str, guarantor1: &str, guarantor2: &str) -> EnrollmentForm {
    EnrollmentForm::from_fields(&enrollment_fields(applicant, guarantor1, guarantor2))
        .expect("valid enrollment")
}

pub(super) fn applicant_fields(group_id: Option<&GroupId>, cooperator: &str) -> FieldMap {
    let mut map = fields(&[
        ("Cooperator ID", cooperator),
        ("Name", "Ada Obi"),
        ("Phone", "+234 801 234 5678"),
        ("Email", APPLICANT_EMAIL),
        ("Loan Amount", "150,000"),
        ("Loan Purpose", "Tailoring equipment"),
        ("Repayment Months", "10"),
        ("Monthly Income", "90000"),
        ("Business Address", "12 Market Road"),
    ]);
    if let Some(group_id) = group_id {
        map.insert("Group ID".to_string(), group_id.0.clone());
    }
    map
}

pub(super) fn application(group_id: Option<&GroupId>, cooperator: &str) -> ApplicantForm {
    ApplicantForm::from_fields(&applicant_fields(group_id, cooperator))
        .expect("valid application")
}

pub(super) fn guarantor_fields(group_id: &GroupId, cooperator: &str, email: &str) -> FieldMap {
    fields(&[
        ("Group ID", group_id.0.as_str()),
        ("Cooperator ID", cooperator),
        ("Name", "Bola Ade"),
        ("Phone", "0802 345 6789"),
        ("Email", email),
        ("Comments", "Happy to stand for the applicant"),
    ])
}

pub(super) fn review_fields(group_id: &GroupId, decision: &str) -> FieldMap {
    fields(&[
        ("Group ID", group_id.0.as_str()),
        ("Decision", decision),
        ("Comments", "Cash flow supports repayment"),
    ])
}

pub(super) fn officer() -> OfficerCard {
    OfficerCard {
        officer_id: "OF-7".to_string(),
        name: "Grace Officer".to_string(),
        phone: "08011111111".to_string(),
        email: OFFICER_EMAIL.to_string(),
    }
}

pub(super) fn officer_fields() -> FieldMap {
    fields(&[
        ("Officer ID", "OF-7"),
        ("Officer Name", "Grace Officer"),
        ("Officer Phone", "08011111111"),
        ("Officer Email", OFFICER_EMAIL),
    ])
}

pub(super) fn single_officer_pool() -> OfficerPool {
    OfficerPool::new(vec![officer()])
}

pub(super) type TestService = LoanWorkflowService<InMemoryLoanStore, RecordingMailer>;

pub(super) struct Harness<M> {
    pub(super) service: LoanWorkflowService<InMemoryLoanStore, M>,
    pub(super) store: Arc<InMemoryLoanStore>,
    pub(super) mailer: Arc<M>,
    pub(super) clock: Arc<ManualClock>,
}

pub(super) fn harness_with<M>(mailer: M, settings: WorkflowSettings) -> Harness<M>
where
    M: MailDelivery + 'static,
{
    let store = Arc::new(InMemoryLoanStore::default());
    harness_on(store, mailer, settings)
}

pub(super) fn harness_on<M>(
    store: Arc<InMemoryLoanStore>,
    mailer: M,
    settings: WorkflowSettings,
) -> Harness<M>
where
    M: MailDelivery + 'static,
{
    let mailer = Arc::new(mailer);
    let clock = Arc::new(ManualClock::starting_at(start()));
    let service = LoanWorkflowService::new(store.clone(), mailer.clone(), settings)
        .expect("service builds")
        .with_clock(clock.clone())
        .with_selector(Box::new(FirstOfficerSelector));
    Harness {
        service,
        store,
        mailer,
        clock,
    }
}

pub(super) fn harness() -> Harness<RecordingMailer> {
    harness_with(RecordingMailer::default(), WorkflowSettings::default())
}

impl<M> Harness<M>
where
    M: MailDelivery + 'static,
{
    /// Enroll A1/B1/B2, bind and announce the officer.
    pub(super) fn notified_group(&self) -> GroupId {
        let group = self
            .service
            .enroll(enrollment("A1", "B1", "B2"))
            .expect("enrollment succeeds");
        self.service
            .assign_officer(&group.group_id, officer())
            .expect("officer assigned");
        self.service
            .notify_assignment(&group.group_id)
            .expect("notification succeeds");
        group.group_id
    }

    /// A notified group whose applicant has submitted at the current instant.
    pub(super) fn submitted_group(&self) -> GroupId {
        let group_id = self.notified_group();
        self.service
            .submit_application(application(Some(&group_id), "A1"))
            .expect("application accepted");
        group_id
    }
}

#[derive(Default)]
pub(super) struct RecordingMailer {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl RecordingMailer {
    pub(super) fn messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().expect("mailer mutex poisoned").clone()
    }

    pub(super) fn sent_to(&self, address: &str) -> Vec<OutboundMessage> {
        self.messages()
            .into_iter()
            .filter(|message| message.to == address)
            .collect()
    }

    pub(super) fn clear(&self) {
        self.sent.lock().expect("mailer mutex poisoned").clear();
    }
}

impl MailDelivery for RecordingMailer {
    fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .expect("mailer mutex poisoned")
            .push(message.clone());
        Ok(())
    }
}

/// Fails for a configurable set of addresses until healed.
#[derive(Default)]
pub(super) struct FlakyMailer {
    pub(super) inner: RecordingMailer,
    failing: Mutex<HashSet<String>>,
}

impl FlakyMailer {
    pub(super) fn failing_for(address: &str) -> Self {
        let mailer = Self::default();
        mailer
            .failing
            .lock()
            .expect("mailer mutex poisoned")
            .insert(address.to_string());
        mailer
    }

    pub(super) fn heal(&self) {
        self.failing.lock().expect("mailer mutex poisoned").clear();
    }
}

impl MailDelivery for FlakyMailer {
    fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        if self
            .failing
            .lock()
            .expect("mailer mutex poisoned")
            .contains(&message.to)
        {
            return Err(DeliveryError::Transport("smtp relay refused".to_string()));
        }
        self.inner.send(message)
    }
}

pub(super) struct FirstOfficerSelector;

impl OfficerSelector for FirstOfficerSelector {
    fn pick<'a>(&self, pool: &'a OfficerPool) -> Option<&'a OfficerCard> {
        pool.officers().first()
    }
}

/// Store whose reads work but whose writes always lose the version race.
#[derive(Default)]
pub(super) struct ContendedStore {
    pub(super) inner: InMemoryLoanStore,
}

impl LoanGroupRepository for ContendedStore {
    fn insert_group(&self, group: LoanGroup) -> Result<VersionedGroup, RepositoryError> {
        self.inner.insert_group(group)
    }

    fn fetch_group(&self, id: &GroupId) -> Result<Option<VersionedGroup>, RepositoryError> {
        self.inner.fetch_group(id)
    }

    fn compare_and_set(
        &self,
        expected_version: u64,
        _group: LoanGroup,
    ) -> Result<VersionedGroup, RepositoryError> {
        Err(RepositoryError::VersionMismatch {
            expected: expected_version,
            found: expected_version + 1,
        })
    }

    fn live_groups(&self) -> Result<Vec<VersionedGroup>, RepositoryError> {
        self.inner.live_groups()
    }

    fn group_ids(&self) -> Result<Vec<GroupId>, RepositoryError> {
        self.inner.group_ids()
    }

    fn insert_intents(&self, intents: &[ParticipantIntent]) -> Result<(), RepositoryError> {
        self.inner.insert_intents(intents)
    }

    fn intents_for(&self, id: &GroupId) -> Result<Vec<ParticipantIntent>, RepositoryError> {
        self.inner.intents_for(id)
    }

    fn archive(
        &self,
        id: &GroupId,
        expected_version: u64,
        archived_at: DateTime<Utc>,
    ) -> Result<ArchivedGroup, RepositoryError> {
        self.inner.archive(id, expected_version, archived_at)
    }

    fn fetch_archived(&self, id: &GroupId) -> Result<Option<ArchivedGroup>, RepositoryError> {
        self.inner.fetch_archived(id)
    }

    fn archived(&self) -> Result<Vec<ArchivedGroup>, RepositoryError> {
        self.inner.archived()
    }
}

impl DeliveryLedger for ContendedStore {
    fn has_delivered(&self, key: &DeliveryKey) -> Result<bool, RepositoryError> {
        self.inner.has_delivered(key)
    }

    fn record_delivery(&self, entry: DeliveryEntry) -> Result<(), RepositoryError> {
        self.inner.record_delivery(entry)
    }

    fn deliveries_for(&self, id: &GroupId) -> Result<Vec<DeliveryEntry>, RepositoryError> {
        self.inner.deliveries_for(id)
    }
}

pub(super) struct UnavailableStore;

impl LoanGroupRepository for UnavailableStore {
    fn insert_group(&self, _group: LoanGroup) -> Result<VersionedGroup, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn fetch_group(&self, _id: &GroupId) -> Result<Option<VersionedGroup>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn compare_and_set(
        &self,
        _expected_version: u64,
        _group: LoanGroup,
    ) -> Result<VersionedGroup, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn live_groups(&self) -> Result<Vec<VersionedGroup>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn group_ids(&self) -> Result<Vec<GroupId>, RepositoryError> {
        Ok(Vec::new())
    }

    fn insert_intents(&self, _intents: &[ParticipantIntent]) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn intents_for(&self, _id: &GroupId) -> Result<Vec<ParticipantIntent>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn archive(
        &self,
        _id: &GroupId,
        _expected_version: u64,
        _archived_at: DateTime<Utc>,
    ) -> Result<ArchivedGroup, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn fetch_archived(&self, _id: &GroupId) -> Result<Option<ArchivedGroup>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn archived(&self) -> Result<Vec<ArchivedGroup>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }
}

impl DeliveryLedger for UnavailableStore {
    fn has_delivered(&self, _key: &DeliveryKey) -> Result<bool, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn record_delivery(&self, _entry: DeliveryEntry) -> Result<(), RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }

    fn deliveries_for(&self, _id: &GroupId) -> Result<Vec<DeliveryEntry>, RepositoryError> {
        Err(RepositoryError::Unavailable("database offline".to_string()))
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}

pub(super) fn assert_conflict_response(response: Response) {
    assert_eq!(response.status(), StatusCode::CONFLICT);
}
