use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, error, info, warn};

use super::allocator::GroupIdAllocator;
use super::clock::{Clock, SystemClock};
use super::domain::{
    CooperatorId, GroupId, GroupStatus, GuarantorSlot, LoanGroup, OfficerCard,
    ParticipantIntent, PartyRole,
};
use super::intake::{
    ApplicantForm, EnrollmentForm, GuarantorForm, IntakeError, OfficerReviewForm,
};
use super::machine::{ResponseWindow, Step, Transition, TransitionError};
use super::notifications::{
    FanOutReport, FormLinkTemplate, IntakeLinks, MailDelivery, NotificationOrchestrator,
    RejectionReason, WorkflowEvent,
};
use super::officers::{AssignmentMode, OfficerPool, OfficerSelector, RandomOfficerSelector};
use super::repository::{
    ArchivedGroup, GroupStatusView, LoanStore, RepositoryError, VersionedGroup,
};

/// Attempts a compare-and-set write gets before the operation reports a conflict.
const MAX_WRITE_ATTEMPTS: usize = 5;

/// Values the workflow is constructed with. Nothing is read from the environment later.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub id_prefix: String,
    pub id_width: usize,
    pub window: ResponseWindow,
    pub assignment: AssignmentMode,
    pub officer_pool: OfficerPool,
    pub links: FormLinkTemplate,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            id_prefix: "LC".to_string(),
            id_width: 4,
            window: ResponseWindow::default(),
            assignment: AssignmentMode::Manual,
            officer_pool: OfficerPool::default(),
            links: FormLinkTemplate::default(),
        }
    }
}

/// Result of a write through the state machine.
#[derive(Debug, Clone)]
struct Mutation {
    current: VersionedGroup,
    changed: bool,
}

/// Outcome of `notify_assignment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyOutcome {
    pub group: LoanGroup,
    /// False when the group had already been notified and only a replay ran.
    pub transitioned: bool,
    pub fan_out: FanOutReport,
}

/// Outcome of an operation that ends a group's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosureOutcome {
    Archived(ArchivedGroup),
    /// The transition committed but the archive move did not; the group stays live and locked.
    Pending(LoanGroup),
}

impl ClosureOutcome {
    pub fn group(&self) -> &LoanGroup {
        match self {
            ClosureOutcome::Archived(record) => &record.group,
            ClosureOutcome::Pending(group) => group,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Archived(ArchivedGroup),
    AlreadyArchived(ArchivedGroup),
}

/// Service composing the state machine, record store, officer policy, and notifier.
pub struct LoanWorkflowService<R, M> {
    store: Arc<R>,
    notifier: NotificationOrchestrator<M>,
    allocator: GroupIdAllocator,
    pool: OfficerPool,
    assignment: AssignmentMode,
    selector: Box<dyn OfficerSelector>,
    clock: Arc<dyn Clock>,
    window: ResponseWindow,
    /// Held across the one-open-application check and the write it guards.
    applicant_gate: Mutex<()>,
}

impl<R, M> LoanWorkflowService<R, M>
where
    R: LoanStore + 'static,
    M: MailDelivery + 'static,
{
    pub fn new(
        store: Arc<R>,
        mailer: Arc<M>,
        settings: WorkflowSettings,
    ) -> Result<Self, WorkflowError> {
        let WorkflowSettings {
            id_prefix,
            id_width,
            window,
            assignment,
            officer_pool,
            links,
        } = settings;

        let existing = store.group_ids()?;
        let allocator = GroupIdAllocator::seeded(id_prefix, id_width, existing.iter());

        Ok(Self {
            store,
            notifier: NotificationOrchestrator::new(mailer, Box::new(links)),
            allocator,
            pool: officer_pool,
            assignment,
            selector: Box::new(RandomOfficerSelector),
            clock: Arc::new(SystemClock),
            window,
            applicant_gate: Mutex::new(()),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_selector(mut self, selector: Box<dyn OfficerSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_links(self, links: Box<dyn IntakeLinks>) -> Self {
        let LoanWorkflowService {
            store,
            notifier,
            allocator,
            pool,
            assignment,
            selector,
            clock,
            window,
            applicant_gate,
        } = self;
        Self {
            store,
            notifier: notifier.with_links(links),
            allocator,
            pool,
            assignment,
            selector,
            clock,
            window,
            applicant_gate,
        }
    }

    pub fn window(&self) -> ResponseWindow {
        self.window
    }

    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub(crate) fn store(&self) -> &R {
        &self.store
    }

    pub(crate) fn notifier(&self) -> &NotificationOrchestrator<M> {
        &self.notifier
    }

    /// Enroll an applicant with two guarantors as a new group in `PendingOfficer`.
    pub fn enroll(&self, form: EnrollmentForm) -> Result<LoanGroup, WorkflowError> {
        form.validate()?;
        let now = self.clock.now();

        let mut stored = None;
        let mut group_id = self.allocator.next();
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            if attempt > 1 {
                group_id = self.allocator.next();
            }
            let mut group = LoanGroup::enrolled(
                group_id.clone(),
                form.applicant.clone(),
                form.guarantor1.clone(),
                form.guarantor2.clone(),
                now,
            );
            if self.assignment == AssignmentMode::Automatic {
                group = self.auto_assign(group, now);
            }

            match self.store.insert_group(group) {
                Ok(row) => {
                    stored = Some(row);
                    break;
                }
                Err(RepositoryError::Conflict) => {
                    warn!(%group_id, operation = "enroll", "identifier already used; allocating another");
                    if let Some(sequence) = self.allocator.sequence_of(&group_id) {
                        self.allocator.observe(sequence);
                    }
                }
                Err(other) => return Err(other.into()),
            }
        }
        let row = stored.ok_or(WorkflowError::Conflict {
            group_id,
            attempts: MAX_WRITE_ATTEMPTS,
        })?;

        let group = row.group;
        if let Err(err) = self
            .store
            .insert_intents(&ParticipantIntent::for_group(&group))
        {
            error!(group_id = %group.group_id, operation = "enroll", error = %err, "participant intent rows rejected");
            return Err(err.into());
        }

        info!(
            group_id = %group.group_id,
            applicant = %group.applicant.cooperator_id,
            officer_assigned = group.officer.is_some(),
            "loan group enrolled"
        );
        self.notifier
            .dispatch(self.store.as_ref(), &group, &WorkflowEvent::Enrolled, now);
        Ok(group)
    }

    fn auto_assign(&self, group: LoanGroup, now: chrono::DateTime<chrono::Utc>) -> LoanGroup {
        let Some(officer) = self.selector.pick(&self.pool) else {
            info!(group_id = %group.group_id, "officer pool empty; group awaits manual assignment");
            return group;
        };
        match Transition::AssignOfficer(officer.clone()).apply(&group, now) {
            Ok(Step::Apply(next)) => *next,
            Ok(Step::Unchanged) => group,
            Err(err) => {
                warn!(group_id = %group.group_id, error = %err, "automatic officer assignment skipped");
                group
            }
        }
    }

    /// Bind an officer written by an administrator. Status is unchanged until notification.
    pub fn assign_officer(
        &self,
        group_id: &GroupId,
        officer: OfficerCard,
    ) -> Result<LoanGroup, WorkflowError> {
        let mutation = self.mutate(group_id, &Transition::AssignOfficer(officer))?;
        Ok(mutation.current.group)
    }

    /// Mark the group notified and send the officer-assigned fan-out.
    ///
    /// On an already-notified group nothing changes; the fan-out is replayed against the
    /// delivery ledger so only recipients that were never reached get a message.
    pub fn notify_assignment(&self, group_id: &GroupId) -> Result<NotifyOutcome, WorkflowError> {
        let mutation = self.mutate(group_id, &Transition::NotifyAssignment)?;
        let group = mutation.current.group;
        let fan_out = self.notifier.dispatch(
            self.store.as_ref(),
            &group,
            &WorkflowEvent::OfficerAssigned,
            self.clock.now(),
        );
        Ok(NotifyOutcome {
            group,
            transitioned: mutation.changed,
            fan_out,
        })
    }

    /// Administrative trigger: notify every group whose officer is bound but not yet announced.
    ///
    /// Only groups still waiting in `PendingOfficer` qualify. A group whose applicant already
    /// submitted through the bypass has had its officer told by the submission fan-out.
    pub fn notify_newly_assigned(&self) -> Result<Vec<GroupId>, WorkflowError> {
        let candidates: Vec<GroupId> = self
            .store
            .live_groups()?
            .into_iter()
            .filter(|row| {
                row.group.status == GroupStatus::PendingOfficer
                    && row.group.officer.is_some()
                    && !row.group.notified
                    && !row.group.locked
            })
            .map(|row| row.group.group_id)
            .collect();

        let mut notified = Vec::new();
        for group_id in candidates {
            match self.notify_assignment(&group_id) {
                Ok(outcome) if outcome.transitioned => notified.push(group_id),
                Ok(_) => {}
                Err(err) => {
                    warn!(%group_id, operation = "notify_assignment", error = %err, "skipping group");
                }
            }
        }
        Ok(notified)
    }

    /// Record the applicant's loan application.
    pub fn submit_application(&self, form: ApplicantForm) -> Result<LoanGroup, WorkflowError> {
        let group_id = match &form.group_id {
            Some(group_id) => group_id.clone(),
            None => self.open_group_for(&form.applicant.cooperator_id)?,
        };

        let result = self.apply_applicant_submission(&group_id, &form);
        match &result {
            Ok(group) => {
                self.notifier.dispatch(
                    self.store.as_ref(),
                    group,
                    &WorkflowEvent::ApplicantSubmitted,
                    self.clock.now(),
                );
            }
            Err(err) => {
                if let Some(reason) = err.rejection_reason() {
                    self.send_rejection(
                        PartyRole::Applicant,
                        &form.applicant.email,
                        &form.applicant.name,
                        &group_id,
                        &reason,
                    );
                }
            }
        }
        result
    }

    fn apply_applicant_submission(
        &self,
        group_id: &GroupId,
        form: &ApplicantForm,
    ) -> Result<LoanGroup, WorkflowError> {
        let transition = Transition::ApplicantSubmission {
            applicant: form.applicant.clone(),
            loan: form.loan.clone(),
        };

        let _gate = self
            .applicant_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        // Surface per-group preconditions before the cross-group check.
        let row = self.load_live(group_id)?;
        transition.apply(&row.group, self.clock.now()).map_err(|err| {
            warn!(%group_id, operation = transition.name(), error = %err, "transition rejected");
            WorkflowError::from(err)
        })?;

        let cooperator = &form.applicant.cooperator_id;
        if let Some(existing) = self
            .store
            .live_groups()?
            .into_iter()
            .find(|other| {
                other.group.group_id != *group_id
                    && other.group.applicant.cooperator_id == *cooperator
                    && other.group.status == GroupStatus::ApplicantSubmitted
            })
        {
            warn!(%group_id, existing = %existing.group.group_id, %cooperator, "applicant already has an open application");
            return Err(WorkflowError::ActiveApplicationExists {
                cooperator: cooperator.clone(),
                existing: existing.group.group_id,
            });
        }

        Ok(self.mutate(group_id, &transition)?.current.group)
    }

    /// The live, non-terminal group where `cooperator` is the applicant (lowest id first).
    fn open_group_for(&self, cooperator: &CooperatorId) -> Result<GroupId, WorkflowError> {
        self.store
            .live_groups()?
            .into_iter()
            .filter(|row| row.group.is_open() && row.group.applicant.cooperator_id == *cooperator)
            .map(|row| row.group.group_id)
            .min()
            .ok_or_else(|| WorkflowError::NoOpenGroup(cooperator.clone()))
    }

    /// Merge a guarantor's form into the group. Status is unchanged.
    pub fn submit_guarantor(
        &self,
        slot: GuarantorSlot,
        form: GuarantorForm,
    ) -> Result<LoanGroup, WorkflowError> {
        let now = self.clock.now();
        let transition = Transition::GuarantorSubmission {
            slot,
            contact: form.contact.clone(),
            statement: form.statement(now),
        };

        match self.mutate(&form.group_id, &transition) {
            Ok(mutation) => {
                let group = mutation.current.group;
                self.notifier.dispatch(
                    self.store.as_ref(),
                    &group,
                    &WorkflowEvent::GuarantorSubmitted(slot),
                    now,
                );
                Ok(group)
            }
            Err(err) => {
                if let Some(reason) = err.rejection_reason() {
                    self.send_rejection(
                        PartyRole::Guarantor(slot),
                        &form.contact.email,
                        &form.contact.name,
                        &form.group_id,
                        &reason,
                    );
                }
                Err(err)
            }
        }
    }

    /// Record the officer's finance review, lock the group, notify, and archive it.
    pub fn record_review(&self, form: OfficerReviewForm) -> Result<ClosureOutcome, WorkflowError> {
        let now = self.clock.now();
        let review = form.review(now);
        let decision = review.decision;

        let mutation = match self.mutate(&form.group_id, &Transition::OfficerReview(review)) {
            Ok(mutation) => mutation,
            Err(err) => {
                if matches!(err, WorkflowError::Transition(TransitionError::Locked(_))) {
                    self.notify_officer_locked(&form.group_id);
                }
                return Err(err);
            }
        };

        let group = mutation.current.group.clone();
        self.notifier.dispatch(
            self.store.as_ref(),
            &group,
            &WorkflowEvent::OfficerReviewed(decision),
            now,
        );
        Ok(self.close(mutation.current))
    }

    fn notify_officer_locked(&self, group_id: &GroupId) {
        let officer = match self.store.fetch_group(group_id) {
            Ok(Some(row)) => row.group.officer,
            _ => match self.store.fetch_archived(group_id) {
                Ok(Some(record)) => record.group.officer,
                _ => None,
            },
        };
        if let Some(officer) = officer {
            self.send_rejection(
                PartyRole::Officer,
                &officer.email,
                &officer.name,
                group_id,
                &RejectionReason::Locked,
            );
        }
    }

    /// Expire a group whose response window has run out, notify the applicant, and archive it.
    pub fn expire(&self, group_id: &GroupId) -> Result<ClosureOutcome, WorkflowError> {
        let mutation = self.mutate(group_id, &Transition::Expire(self.window))?;
        if mutation.changed {
            self.notifier.dispatch(
                self.store.as_ref(),
                &mutation.current.group,
                &WorkflowEvent::Expired,
                self.clock.now(),
            );
        }
        Ok(self.close(mutation.current))
    }

    /// Administrative reset back to `PendingOfficer`, including locked groups that are
    /// still live. Replays the officer-assignment cycle when an officer is still bound.
    ///
    /// `from_cycle` is the cycle the administrator saw. Repeating a reset that already
    /// moved the group to `from_cycle + 1` changes nothing and only resumes the ledgered
    /// fan-out, so no party is notified twice. Older cycles are left alone.
    pub fn reset(&self, group_id: &GroupId, from_cycle: u32) -> Result<LoanGroup, WorkflowError> {
        let mutation = self.mutate(group_id, &Transition::Reset { from_cycle })?;
        let group = mutation.current.group;
        if mutation.changed {
            info!(%group_id, cycle = group.cycle, "loan group reset");
        } else if group.cycle == from_cycle.saturating_add(1) {
            debug!(%group_id, cycle = group.cycle, "reset already applied; resuming fan-out");
        } else {
            debug!(%group_id, cycle = group.cycle, from_cycle, "reset superseded by a later cycle");
            return Ok(group);
        }

        self.notifier.dispatch(
            self.store.as_ref(),
            &group,
            &WorkflowEvent::Reset,
            self.clock.now(),
        );

        if group.officer.is_some() {
            return Ok(self.notify_assignment(group_id)?.group);
        }
        Ok(group)
    }

    /// Move a terminal group to cold storage. A second call reports the existing archive row.
    pub fn archive(&self, group_id: &GroupId) -> Result<ArchiveOutcome, WorkflowError> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let Some(row) = self.store.fetch_group(group_id)? else {
                return match self.store.fetch_archived(group_id)? {
                    Some(record) => Ok(ArchiveOutcome::AlreadyArchived(record)),
                    None => Err(WorkflowError::NotFound(group_id.clone())),
                };
            };

            if !row.group.status.is_terminal() {
                return Err(WorkflowError::NotArchivable {
                    group_id: group_id.clone(),
                    status: row.group.status,
                });
            }

            match self.store.archive(group_id, row.version, self.clock.now()) {
                Ok(record) => {
                    info!(%group_id, status = %record.group.status, "loan group archived");
                    return Ok(ArchiveOutcome::Archived(record));
                }
                Err(RepositoryError::VersionMismatch { .. }) | Err(RepositoryError::NotFound) => {
                    debug!(%group_id, attempt, operation = "archive", "store changed underneath; retrying");
                }
                Err(other) => return Err(other.into()),
            }
        }
        Err(WorkflowError::Conflict {
            group_id: group_id.clone(),
            attempts: MAX_WRITE_ATTEMPTS,
        })
    }

    fn close(&self, row: VersionedGroup) -> ClosureOutcome {
        let group_id = row.group.group_id.clone();
        match self.archive(&group_id) {
            Ok(ArchiveOutcome::Archived(record)) | Ok(ArchiveOutcome::AlreadyArchived(record)) => {
                ClosureOutcome::Archived(record)
            }
            Err(err) => {
                error!(%group_id, operation = "archive", error = %err, "terminal group left in live store");
                ClosureOutcome::Pending(row.group)
            }
        }
    }

    /// Fetch a live group. Archived groups are not found here.
    pub fn get(&self, group_id: &GroupId) -> Result<LoanGroup, WorkflowError> {
        self.store
            .fetch_group(group_id)?
            .map(|row| row.group)
            .ok_or_else(|| WorkflowError::NotFound(group_id.clone()))
    }

    /// Status view of a group, live or archived.
    pub fn status(&self, group_id: &GroupId) -> Result<GroupStatusView, WorkflowError> {
        if let Some(row) = self.store.fetch_group(group_id)? {
            return Ok(GroupStatusView::live(&row.group));
        }
        self.store
            .fetch_archived(group_id)?
            .map(|record| GroupStatusView::archived(&record))
            .ok_or_else(|| WorkflowError::NotFound(group_id.clone()))
    }

    pub fn archived(&self) -> Result<Vec<ArchivedGroup>, WorkflowError> {
        Ok(self.store.archived()?)
    }

    fn load_live(&self, group_id: &GroupId) -> Result<VersionedGroup, WorkflowError> {
        match self.store.fetch_group(group_id)? {
            Some(row) => Ok(row),
            // Archived groups are terminal and locked; report them as such to submitters.
            None if self.store.fetch_archived(group_id)?.is_some() => {
                Err(TransitionError::Locked(group_id.clone()).into())
            }
            None => Err(WorkflowError::NotFound(group_id.clone())),
        }
    }

    /// Read, validate, and conditionally write one transition, retrying on version conflicts.
    fn mutate(
        &self,
        group_id: &GroupId,
        transition: &Transition,
    ) -> Result<Mutation, WorkflowError> {
        let operation = transition.name();
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let row = self.load_live(group_id).map_err(|err| {
                warn!(%group_id, operation, error = %err, "transition aborted");
                err
            })?;

            let next = match transition.apply(&row.group, self.clock.now()) {
                Ok(Step::Apply(next)) => next,
                Ok(Step::Unchanged) => {
                    debug!(%group_id, operation, "transition already applied");
                    return Ok(Mutation {
                        current: row,
                        changed: false,
                    });
                }
                Err(err) => {
                    warn!(%group_id, operation, error = %err, "transition rejected");
                    return Err(err.into());
                }
            };

            let from = row.group.status;
            match self.store.compare_and_set(row.version, *next) {
                Ok(current) => {
                    info!(%group_id, operation, %from, to = %current.group.status, version = current.version, "transition applied");
                    return Ok(Mutation {
                        current,
                        changed: true,
                    });
                }
                Err(RepositoryError::VersionMismatch { expected, found }) => {
                    debug!(%group_id, operation, attempt, expected, found, "write conflict; re-reading");
                }
                Err(RepositoryError::NotFound) => {
                    debug!(%group_id, operation, attempt, "group moved during write; re-reading");
                }
                Err(other) => {
                    error!(%group_id, operation, error = %other, "store write failed");
                    return Err(other.into());
                }
            }
        }

        warn!(%group_id, operation, attempts = MAX_WRITE_ATTEMPTS, "giving up after repeated write conflicts");
        Err(WorkflowError::Conflict {
            group_id: group_id.clone(),
            attempts: MAX_WRITE_ATTEMPTS,
        })
    }

    fn send_rejection(
        &self,
        role: PartyRole,
        to: &str,
        name: &str,
        group_id: &GroupId,
        reason: &RejectionReason,
    ) {
        if let Err(err) = self
            .notifier
            .notify_rejection(role, to, name, Some(group_id), reason)
        {
            warn!(%group_id, recipient = %role, error = %err, "rejection notice not delivered");
        }
    }
}

/// Error raised by the loan workflow service.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Validation(#[from] IntakeError),
    #[error("loan group {0} not found")]
    NotFound(GroupId),
    #[error("cooperator {0} has no open loan group")]
    NoOpenGroup(CooperatorId),
    #[error("cooperator {cooperator} already has an open application in group {existing}")]
    ActiveApplicationExists {
        cooperator: CooperatorId,
        existing: GroupId,
    },
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("loan group {group_id} is {status} and cannot be archived")]
    NotArchivable {
        group_id: GroupId,
        status: GroupStatus,
    },
    #[error("loan group {group_id} kept changing; gave up after {attempts} attempts")]
    Conflict { group_id: GroupId, attempts: usize },
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl WorkflowError {
    /// Blocking conditions the submitter is told about by e-mail.
    pub fn rejection_reason(&self) -> Option<RejectionReason> {
        match self {
            WorkflowError::Transition(TransitionError::OfficerNotAssigned(_)) => {
                Some(RejectionReason::OfficerNotAssigned)
            }
            WorkflowError::Transition(TransitionError::Locked(_)) => Some(RejectionReason::Locked),
            WorkflowError::ActiveApplicationExists { existing, .. } => {
                Some(RejectionReason::ActiveApplicationExists {
                    existing: existing.clone(),
                })
            }
            _ => None,
        }
    }
}
