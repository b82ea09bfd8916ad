use super::common::*;
use crate::workflows::loans::domain::{
    GroupId, GroupStatus, GuarantorSlot, LoanGroup, OfficerCard, ReviewDecision,
};
use crate::workflows::loans::intake::{
    EnrollmentForm, GuarantorForm, IntakeError, OfficerReviewForm,
};
use crate::workflows::loans::machine::TransitionError;
use crate::workflows::loans::notifications::FormLinkTemplate;
use crate::workflows::loans::officers::AssignmentMode;
use crate::workflows::loans::repository::{LoanGroupRepository, RepositoryError};
use crate::workflows::loans::service::{
    ArchiveOutcome, ClosureOutcome, LoanWorkflowService, WorkflowError, WorkflowSettings,
};
use crate::workflows::loans::store::InMemoryLoanStore;
use chrono::Duration;
use std::sync::Arc;

fn review(group_id: &GroupId, decision: &str) -> OfficerReviewForm {
    OfficerReviewForm::from_fields(&review_fields(group_id, decision)).expect("valid review")
}

fn automatic() -> WorkflowSettings {
    WorkflowSettings {
        assignment: AssignmentMode::Automatic,
        officer_pool: single_officer_pool(),
        ..WorkflowSettings::default()
    }
}

#[test]
fn enroll_allocates_first_identifier_and_emails_applicant() {
    let h = harness();

    let group = h
        .service
        .enroll(enrollment("A1", "B1", "B2"))
        .expect("enrollment succeeds");

    assert_eq!(group.group_id, GroupId("LC0001".to_string()));
    assert_eq!(group.status, GroupStatus::PendingOfficer);
    assert!(group.officer.is_none());
    assert!(!group.locked && !group.notified);

    let sent = h.mailer.messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, APPLICANT_EMAIL);
    assert!(sent[0].subject.contains("LC0001"));
    assert!(sent[0].body.contains("LC0001"));

    let intents = h.store.intents_for(&group.group_id).expect("intents readable");
    assert_eq!(intents.len(), 3);
}

#[test]
fn enroll_continues_after_highest_stored_identifier() {
    let store = Arc::new(InMemoryLoanStore::default());
    let form = enrollment("A9", "B8", "B7");
    store
        .insert_group(LoanGroup::enrolled(
            GroupId("LC0041".to_string()),
            form.applicant,
            form.guarantor1,
            form.guarantor2,
            start(),
        ))
        .expect("seed row");

    let h = harness_on(store, RecordingMailer::default(), WorkflowSettings::default());
    let group = h
        .service
        .enroll(enrollment("A1", "B1", "B2"))
        .expect("enrollment succeeds");

    assert_eq!(group.group_id, GroupId("LC0042".to_string()));
}

#[test]
fn enroll_rejects_repeated_participant() {
    let h = harness();
    let base = enrollment("A1", "B1", "B2");
    let form = EnrollmentForm {
        guarantor2: base.applicant.clone(),
        ..base
    };

    match h.service.enroll(form) {
        Err(WorkflowError::Validation(IntakeError::DuplicateParticipant(id))) => {
            assert_eq!(id.0, "A1");
        }
        other => panic!("expected duplicate participant, got {other:?}"),
    }
    assert!(h.mailer.messages().is_empty());
    assert!(h.store.live_groups().expect("readable").is_empty());
}

#[test]
fn automatic_assignment_binds_pool_officer_without_notifying() {
    let h = harness_with(RecordingMailer::default(), automatic());

    let group = h
        .service
        .enroll(enrollment("A1", "B1", "B2"))
        .expect("enrollment succeeds");

    assert_eq!(group.officer, Some(officer()));
    assert_eq!(group.status, GroupStatus::PendingOfficer);
    assert!(!group.notified);
    assert!(h.mailer.sent_to(OFFICER_EMAIL).is_empty());

    let notified = h.service.notify_newly_assigned().expect("trigger runs");
    assert_eq!(notified, vec![group.group_id.clone()]);
    let current = h.service.get(&group.group_id).expect("group live");
    assert_eq!(current.status, GroupStatus::Notified);
    assert_eq!(h.mailer.sent_to(OFFICER_EMAIL).len(), 1);
}

#[test]
fn automatic_assignment_with_empty_pool_leaves_group_unassigned() {
    let settings = WorkflowSettings {
        assignment: AssignmentMode::Automatic,
        ..WorkflowSettings::default()
    };
    let h = harness_with(RecordingMailer::default(), settings);

    let group = h
        .service
        .enroll(enrollment("A1", "B1", "B2"))
        .expect("enrollment is never blocked");

    assert!(group.officer.is_none());
    assert_eq!(group.status, GroupStatus::PendingOfficer);
}

#[test]
fn notify_assignment_twice_has_single_side_effect() {
    let h = harness();
    let group = h
        .service
        .enroll(enrollment("A1", "B1", "B2"))
        .expect("enrollment succeeds");
    h.service
        .assign_officer(&group.group_id, officer())
        .expect("officer assigned");
    h.mailer.clear();

    let first = h
        .service
        .notify_assignment(&group.group_id)
        .expect("first notification");
    assert!(first.transitioned);
    assert_eq!(first.group.status, GroupStatus::Notified);
    assert_eq!(first.fan_out.delivered, 4);

    let second = h
        .service
        .notify_assignment(&group.group_id)
        .expect("second notification");
    assert!(!second.transitioned);
    assert_eq!(second.fan_out.delivered, 0);
    assert_eq!(second.fan_out.already_delivered, 4);

    assert_eq!(h.mailer.messages().len(), 4);
}

#[test]
fn partially_failed_fan_out_resumes_on_replay() {
    let h = harness_with(
        FlakyMailer::failing_for(GUARANTOR2_EMAIL),
        WorkflowSettings::default(),
    );
    let group = h
        .service
        .enroll(enrollment("A1", "B1", "B2"))
        .expect("enrollment succeeds");
    h.service
        .assign_officer(&group.group_id, officer())
        .expect("officer assigned");

    let first = h
        .service
        .notify_assignment(&group.group_id)
        .expect("transition commits despite delivery failure");
    assert!(first.transitioned);
    assert_eq!(first.fan_out.delivered, 3);
    assert_eq!(first.fan_out.failed, 1);

    h.mailer.heal();
    let replay = h
        .service
        .notify_assignment(&group.group_id)
        .expect("replay succeeds");
    assert!(!replay.transitioned);
    assert_eq!(replay.fan_out.delivered, 1);
    assert_eq!(replay.fan_out.already_delivered, 3);

    assert_eq!(h.mailer.inner.sent_to(GUARANTOR2_EMAIL).len(), 1);
    assert_eq!(h.mailer.inner.sent_to(GUARANTOR1_EMAIL).len(), 1);
}

#[test]
fn assignment_notice_carries_configured_form_link() {
    let settings = WorkflowSettings {
        links: FormLinkTemplate::from_urls(
            Some("https://forms.example.org/applicant"),
            Some("https://forms.example.org/guarantor"),
            None,
        )
        .expect("valid urls"),
        ..WorkflowSettings::default()
    };
    let h = harness_with(RecordingMailer::default(), settings);
    h.notified_group();

    let applicant = h.mailer.sent_to(APPLICANT_EMAIL);
    let notice = applicant.last().expect("assignment notice");
    assert!(notice
        .body
        .contains("https://forms.example.org/applicant?group=LC0001&role=Applicant&email=ada%40example.org"));

    let officer_notice = h.mailer.sent_to(OFFICER_EMAIL);
    assert!(!officer_notice[0].body.contains("Form:"));
}

#[test]
fn notify_without_officer_is_rejected() {
    let h = harness();
    let group = h
        .service
        .enroll(enrollment("A1", "B1", "B2"))
        .expect("enrollment succeeds");

    match h.service.notify_assignment(&group.group_id) {
        Err(WorkflowError::Transition(TransitionError::OfficerNotAssigned(id))) => {
            assert_eq!(id, group.group_id);
        }
        other => panic!("expected officer not assigned, got {other:?}"),
    }
}

#[test]
fn assign_officer_rejects_incomplete_fields() {
    let h = harness();
    let group = h
        .service
        .enroll(enrollment("A1", "B1", "B2"))
        .expect("enrollment succeeds");
    let incomplete = OfficerCard {
        email: String::new(),
        ..officer()
    };

    match h.service.assign_officer(&group.group_id, incomplete) {
        Err(WorkflowError::Transition(TransitionError::InvalidOfficer { missing, .. })) => {
            assert_eq!(missing, vec!["Officer Email"]);
        }
        other => panic!("expected invalid officer, got {other:?}"),
    }
}

#[test]
fn applicant_before_officer_is_rejected_and_told_to_wait() {
    let h = harness();
    let group = h
        .service
        .enroll(enrollment("A1", "B1", "B2"))
        .expect("enrollment succeeds");
    h.mailer.clear();

    let result = h
        .service
        .submit_application(application(Some(&group.group_id), "A1"));

    assert!(matches!(
        result,
        Err(WorkflowError::Transition(TransitionError::OfficerNotAssigned(_)))
    ));
    let current = h.service.get(&group.group_id).expect("group live");
    assert_eq!(current.status, GroupStatus::PendingOfficer);
    assert!(current.loan.is_none());

    let notices = h.mailer.sent_to(APPLICANT_EMAIL);
    assert_eq!(notices.len(), 1);
    assert!(notices[0].subject.contains("wait"));
}

#[test]
fn applicant_submission_records_loan_and_fans_out() {
    let h = harness();
    let group_id = h.notified_group();
    h.mailer.clear();

    let group = h
        .service
        .submit_application(application(Some(&group_id), "A1"))
        .expect("application accepted");

    assert_eq!(group.status, GroupStatus::ApplicantSubmitted);
    assert_eq!(group.submitted_at, Some(start()));
    let loan = group.loan.expect("loan recorded");
    assert_eq!(loan.loan_amount, 150_000);
    assert_eq!(
        loan.extra.get("Business Address").map(String::as_str),
        Some("12 Market Road")
    );

    let recipients: Vec<String> = h.mailer.messages().into_iter().map(|m| m.to).collect();
    assert_eq!(
        recipients,
        vec![
            APPLICANT_EMAIL.to_string(),
            GUARANTOR1_EMAIL.to_string(),
            GUARANTOR2_EMAIL.to_string(),
            OFFICER_EMAIL.to_string(),
        ]
    );
}

#[test]
fn applicant_without_group_id_targets_open_group() {
    let h = harness();
    let group_id = h.notified_group();

    let group = h
        .service
        .submit_application(application(None, "A1"))
        .expect("application accepted");

    assert_eq!(group.group_id, group_id);
}

#[test]
fn applicant_without_any_group_is_not_found() {
    let h = harness();
    h.notified_group();

    match h.service.submit_application(application(None, "Z9")) {
        Err(WorkflowError::NoOpenGroup(cooperator)) => assert_eq!(cooperator.0, "Z9"),
        other => panic!("expected no open group, got {other:?}"),
    }
}

#[test]
fn applicant_must_be_the_enrolled_applicant() {
    let h = harness();
    let group_id = h.notified_group();

    let result = h
        .service
        .submit_application(application(Some(&group_id), "B1"));

    assert!(matches!(
        result,
        Err(WorkflowError::Transition(TransitionError::PartyMismatch { .. }))
    ));
}

#[test]
fn second_application_blocked_until_first_is_terminal() {
    let h = harness();
    let first = h.submitted_group();

    let second = h
        .service
        .enroll(enrollment("A1", "B3", "B4"))
        .expect("second enrollment succeeds");
    h.service
        .assign_officer(&second.group_id, officer())
        .expect("officer assigned");
    h.service
        .notify_assignment(&second.group_id)
        .expect("notified");
    h.mailer.clear();

    match h
        .service
        .submit_application(application(Some(&second.group_id), "A1"))
    {
        Err(WorkflowError::ActiveApplicationExists { existing, .. }) => assert_eq!(existing, first),
        other => panic!("expected active application, got {other:?}"),
    }
    let untouched = h.service.get(&second.group_id).expect("group live");
    assert_eq!(untouched.status, GroupStatus::Notified);
    let notices = h.mailer.sent_to(APPLICANT_EMAIL);
    assert_eq!(notices.len(), 1);
    assert!(notices[0].body.contains(&first.0));

    h.service
        .record_review(review(&first, "Approved"))
        .expect("first group reviewed");

    let accepted = h
        .service
        .submit_application(application(Some(&second.group_id), "A1"))
        .expect("second application accepted once the first is terminal");
    assert_eq!(accepted.status, GroupStatus::ApplicantSubmitted);
}

#[test]
fn guarantor_submission_merges_contact_and_statement() {
    let h = harness();
    let group_id = h.submitted_group();
    h.mailer.clear();

    let form = GuarantorForm::from_fields(&guarantor_fields(
        &group_id,
        "B1",
        "bola.new@example.org",
    ))
    .expect("valid guarantor form");
    let group = h
        .service
        .submit_guarantor(GuarantorSlot::First, form)
        .expect("guarantor accepted");

    assert_eq!(group.status, GroupStatus::ApplicantSubmitted);
    assert_eq!(group.guarantor1.email, "bola.new@example.org");
    let statement = group
        .guarantor_statement(GuarantorSlot::First)
        .expect("statement stored");
    assert_eq!(
        statement.comments.as_deref(),
        Some("Happy to stand for the applicant")
    );

    let recipients: Vec<String> = h.mailer.messages().into_iter().map(|m| m.to).collect();
    assert_eq!(
        recipients,
        vec![
            "bola.new@example.org".to_string(),
            APPLICANT_EMAIL.to_string(),
            OFFICER_EMAIL.to_string(),
        ]
    );
}

#[test]
fn guarantor_on_closed_group_is_told_it_is_locked() {
    let h = harness();
    let group_id = h.submitted_group();
    h.service
        .record_review(review(&group_id, "Rejected"))
        .expect("reviewed");
    h.mailer.clear();

    let form = GuarantorForm::from_fields(&guarantor_fields(&group_id, "B1", GUARANTOR1_EMAIL))
        .expect("valid guarantor form");
    let result = h.service.submit_guarantor(GuarantorSlot::First, form);

    assert!(matches!(
        result,
        Err(WorkflowError::Transition(TransitionError::Locked(_)))
    ));
    let notices = h.mailer.sent_to(GUARANTOR1_EMAIL);
    assert_eq!(notices.len(), 1);
    assert!(notices[0].subject.contains("locked"));
}

#[test]
fn approved_review_locks_notifies_and_archives() {
    let h = harness();
    let group_id = h.submitted_group();
    h.mailer.clear();

    let outcome = h
        .service
        .record_review(review(&group_id, "Approved"))
        .expect("review recorded");

    let record = match outcome {
        ClosureOutcome::Archived(record) => record,
        ClosureOutcome::Pending(group) => panic!("expected archive, group left live: {group:?}"),
    };
    assert_eq!(record.group.status, GroupStatus::FinanceReviewed);
    assert!(record.group.locked);
    assert_eq!(
        record.group.review.as_ref().map(|review| review.decision),
        Some(ReviewDecision::Approved)
    );
    assert_eq!(h.mailer.messages().len(), 3);
    assert!(h.mailer.sent_to(OFFICER_EMAIL).is_empty());

    assert!(matches!(
        h.service.get(&group_id),
        Err(WorkflowError::NotFound(_))
    ));
    let view = h.service.status(&group_id).expect("status from archive");
    assert!(view.archived);
    assert_eq!(view.status, "finance_reviewed");
}

#[test]
fn review_before_submission_is_invalid() {
    let h = harness();
    let group_id = h.notified_group();

    let result = h.service.record_review(review(&group_id, "Approved"));

    assert!(matches!(
        result,
        Err(WorkflowError::Transition(TransitionError::InvalidTransition { .. }))
    ));
}

#[test]
fn second_review_tells_officer_the_group_is_locked() {
    let h = harness();
    let group_id = h.submitted_group();
    h.service
        .record_review(review(&group_id, "Approved"))
        .expect("first review");
    h.mailer.clear();

    let result = h.service.record_review(review(&group_id, "Rejected"));

    assert!(matches!(
        result,
        Err(WorkflowError::Transition(TransitionError::Locked(_)))
    ));
    let notices = h.mailer.sent_to(OFFICER_EMAIL);
    assert_eq!(notices.len(), 1);
    assert!(notices[0].subject.contains("locked"));
}

#[test]
fn expire_waits_for_the_response_window() {
    let h = harness();
    let group_id = h.submitted_group();
    h.clock.advance(Duration::days(6));

    match h.service.expire(&group_id) {
        Err(WorkflowError::Transition(TransitionError::NotDue { remaining, .. })) => {
            assert_eq!(remaining, 1)
        }
        other => panic!("expected not due, got {other:?}"),
    }

    h.clock.advance(Duration::days(1));
    h.mailer.clear();
    let outcome = h.service.expire(&group_id).expect("window elapsed");

    assert_eq!(outcome.group().status, GroupStatus::Expired);
    assert!(outcome.group().locked);
    assert!(matches!(outcome, ClosureOutcome::Archived(_)));
    let sent = h.mailer.messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, APPLICANT_EMAIL);
}

#[test]
fn reset_returns_to_pending_and_replays_assignment() {
    let h = harness();
    let group_id = h.submitted_group();
    h.mailer.clear();

    let group = h.service.reset(&group_id, 0).expect("reset succeeds");

    assert_eq!(group.cycle, 1);
    assert_eq!(group.status, GroupStatus::Notified);
    assert!(group.notified);
    assert!(!group.locked);
    assert!(group.submitted_at.is_none());
    // Reset notice plus a fresh assignment notice for all four parties.
    assert_eq!(h.mailer.messages().len(), 8);
    assert_eq!(h.mailer.sent_to(OFFICER_EMAIL).len(), 2);
}

#[test]
fn repeated_reset_of_the_same_cycle_sends_nothing() {
    let h = harness();
    let group_id = h.submitted_group();
    h.service.reset(&group_id, 0).expect("reset succeeds");
    h.mailer.clear();

    let again = h.service.reset(&group_id, 0).expect("repeat is accepted");

    assert_eq!(again.cycle, 1);
    assert_eq!(again.status, GroupStatus::Notified);
    assert!(h.mailer.messages().is_empty());
}

#[test]
fn repeated_reset_resumes_a_partial_fan_out() {
    let h = harness_with(
        FlakyMailer::failing_for(GUARANTOR2_EMAIL),
        WorkflowSettings::default(),
    );
    let group_id = h.submitted_group();
    h.service.reset(&group_id, 0).expect("reset succeeds");
    h.mailer.heal();
    h.mailer.inner.clear();

    h.service.reset(&group_id, 0).expect("repeat is accepted");

    // Only the guarantor who missed the reset and assignment notices hears from us.
    let sent = h.mailer.inner.messages();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|message| message.to == GUARANTOR2_EMAIL));
}

#[test]
fn reset_naming_a_future_cycle_is_rejected() {
    let h = harness();
    let group_id = h.submitted_group();

    assert!(matches!(
        h.service.reset(&group_id, 1),
        Err(WorkflowError::Transition(TransitionError::UnknownCycle {
            requested: 1,
            current: 0,
            ..
        }))
    ));
    assert_eq!(
        h.service.get(&group_id).expect("live").status,
        GroupStatus::ApplicantSubmitted
    );
}

#[test]
fn concurrent_applications_by_one_cooperator_admit_only_one() {
    let h = harness();
    let first = h.notified_group();
    let second = h.notified_group();
    let barrier = std::sync::Barrier::new(2);

    let results: Vec<Result<LoanGroup, WorkflowError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = [&first, &second]
            .into_iter()
            .map(|group_id| {
                let service = &h.service;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    service.submit_application(application(Some(group_id), "A1"))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("submission thread"))
            .collect()
    });

    let accepted = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(accepted, 1);
    assert!(results
        .iter()
        .any(|result| matches!(result, Err(WorkflowError::ActiveApplicationExists { .. }))));
}

#[test]
fn reset_without_officer_stays_pending() {
    let h = harness();
    let group = h
        .service
        .enroll(enrollment("A1", "B1", "B2"))
        .expect("enrollment succeeds");
    h.mailer.clear();

    let reset = h.service.reset(&group.group_id, 0).expect("reset succeeds");

    assert_eq!(reset.status, GroupStatus::PendingOfficer);
    assert_eq!(reset.cycle, 1);
    assert_eq!(h.mailer.messages().len(), 3);
}

#[test]
fn archived_group_cannot_be_reset() {
    let h = harness();
    let group_id = h.submitted_group();
    h.service
        .record_review(review(&group_id, "Approved"))
        .expect("reviewed");

    assert!(matches!(
        h.service.reset(&group_id, 0),
        Err(WorkflowError::Transition(TransitionError::Locked(_)))
    ));
}

#[test]
fn archive_moves_exact_last_state_and_is_idempotent() {
    let h = harness();
    let form = enrollment("A1", "B1", "B2");
    let mut group = LoanGroup::enrolled(
        GroupId("LC0005".to_string()),
        form.applicant,
        form.guarantor1,
        form.guarantor2,
        start(),
    );
    group.officer = Some(officer());
    group.status = GroupStatus::Expired;
    group.locked = true;
    group.submitted_at = Some(start());
    let live = h.store.insert_group(group).expect("seed row");

    let first = h.service.archive(&live.group.group_id).expect("archives");
    match first {
        ArchiveOutcome::Archived(record) => {
            assert_eq!(record.group, live.group);
            assert_eq!(record.version, live.version);
        }
        other => panic!("expected a fresh archive, got {other:?}"),
    }

    assert!(matches!(
        h.service.archive(&live.group.group_id),
        Ok(ArchiveOutcome::AlreadyArchived(_))
    ));
    assert!(matches!(
        h.service.get(&live.group.group_id),
        Err(WorkflowError::NotFound(_))
    ));
}

#[test]
fn archive_rejects_open_group() {
    let h = harness();
    let group_id = h.notified_group();

    match h.service.archive(&group_id) {
        Err(WorkflowError::NotArchivable { status, .. }) => {
            assert_eq!(status, GroupStatus::Notified)
        }
        other => panic!("expected not archivable, got {other:?}"),
    }
}

#[test]
fn archive_of_unknown_group_is_not_found() {
    let h = harness();

    assert!(matches!(
        h.service.archive(&GroupId("LC9999".to_string())),
        Err(WorkflowError::NotFound(_))
    ));
}

#[test]
fn contended_writes_give_up_with_conflict() {
    let store = Arc::new(ContendedStore::default());
    let service = LoanWorkflowService::new(
        store,
        Arc::new(RecordingMailer::default()),
        WorkflowSettings::default(),
    )
    .expect("service builds");
    let group = service
        .enroll(enrollment("A1", "B1", "B2"))
        .expect("inserts are not contended");

    match service.assign_officer(&group.group_id, officer()) {
        Err(WorkflowError::Conflict { attempts, .. }) => assert_eq!(attempts, 5),
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[test]
fn unavailable_store_surfaces_repository_error() {
    let service = LoanWorkflowService::new(
        Arc::new(UnavailableStore),
        Arc::new(RecordingMailer::default()),
        WorkflowSettings::default(),
    )
    .expect("service builds");

    assert!(matches!(
        service.enroll(enrollment("A1", "B1", "B2")),
        Err(WorkflowError::Repository(RepositoryError::Unavailable(_)))
    ));
}
