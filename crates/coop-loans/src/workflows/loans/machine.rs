//! Pure transition rules for a loan group.
//!
//! [`Transition::apply`] takes the current record and returns the record it should become,
//! or [`Step::Unchanged`] when the transition already happened. It never touches storage;
//! the service persists the result with a compare-and-set and re-runs the rule on conflict.

use chrono::{DateTime, Duration, Utc};

use super::domain::{
    ContactCard, CooperatorId, GroupId, GroupStatus, GuarantorSlot, GuarantorStatement,
    LoanDetails, LoanGroup, OfficerCard, OfficerReview,
};

/// How long guarantors and the officer have to act after the applicant submits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseWindow {
    pub period: Duration,
    pub periods: u32,
}

impl ResponseWindow {
    pub fn daily(periods: u32) -> Self {
        Self {
            period: Duration::days(1),
            periods,
        }
    }

    /// Whole periods elapsed since `since`, floored. Never negative.
    pub fn elapsed_periods(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
        let period = self.period.num_seconds().max(1);
        let elapsed = (now - since).num_seconds().max(0);
        u32::try_from(elapsed / period).unwrap_or(u32::MAX)
    }

    pub fn is_exceeded(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.elapsed_periods(since, now) >= self.periods
    }

    /// Whole periods left before expiry; zero once the window is exceeded.
    pub fn remaining_periods(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
        self.periods
            .saturating_sub(self.elapsed_periods(since, now))
    }
}

impl Default for ResponseWindow {
    fn default() -> Self {
        Self::daily(7)
    }
}

/// Precondition failures. Each aborts the transition before anything is written.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("group {0} is locked; contact an administrator")]
    Locked(GroupId),
    #[error("group {0} has no officer assigned yet")]
    OfficerNotAssigned(GroupId),
    #[error("officer for group {group_id} is incomplete: missing {}", .missing.join(", "))]
    InvalidOfficer {
        group_id: GroupId,
        missing: Vec<&'static str>,
    },
    #[error("{operation} is not allowed on group {group_id} while it is {from}")]
    InvalidTransition {
        group_id: GroupId,
        from: GroupStatus,
        operation: &'static str,
    },
    #[error("cooperator {cooperator} is not the {role} of group {group_id}")]
    PartyMismatch {
        group_id: GroupId,
        cooperator: CooperatorId,
        role: &'static str,
    },
    #[error("group {group_id} still has {remaining} period(s) before it expires")]
    NotDue { group_id: GroupId, remaining: u32 },
    #[error("group {group_id} is on cycle {current}; cycle {requested} has not started")]
    UnknownCycle {
        group_id: GroupId,
        requested: u32,
        current: u32,
    },
}

/// Outcome of applying a transition to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Apply(Box<LoanGroup>),
    Unchanged,
}

/// Every mutation the workflow knows about.
#[derive(Debug, Clone)]
pub enum Transition {
    AssignOfficer(OfficerCard),
    NotifyAssignment,
    ApplicantSubmission {
        applicant: ContactCard,
        loan: LoanDetails,
    },
    GuarantorSubmission {
        slot: GuarantorSlot,
        contact: ContactCard,
        statement: GuarantorStatement,
    },
    OfficerReview(OfficerReview),
    Expire(ResponseWindow),
    /// Administrative reset of the cycle the caller last saw.
    Reset { from_cycle: u32 },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::AssignOfficer(_) => "assign_officer",
            Transition::NotifyAssignment => "notify_assignment",
            Transition::ApplicantSubmission { .. } => "applicant_submission",
            Transition::GuarantorSubmission { .. } => "guarantor_submission",
            Transition::OfficerReview(_) => "officer_review",
            Transition::Expire(_) => "expire",
            Transition::Reset { .. } => "reset",
        }
    }

    pub fn apply(&self, group: &LoanGroup, now: DateTime<Utc>) -> Result<Step, TransitionError> {
        let step = self.next_state(group, now)?;
        if let Step::Apply(next) = &step {
            if next.status != group.status && !group.status.permits(next.status) {
                return Err(self.invalid(group));
            }
        }
        Ok(step)
    }

    fn invalid(&self, group: &LoanGroup) -> TransitionError {
        TransitionError::InvalidTransition {
            group_id: group.group_id.clone(),
            from: group.status,
            operation: self.name(),
        }
    }

    fn ensure_unlocked(group: &LoanGroup) -> Result<(), TransitionError> {
        if group.locked {
            Err(TransitionError::Locked(group.group_id.clone()))
        } else {
            Ok(())
        }
    }

    fn next_state(&self, group: &LoanGroup, now: DateTime<Utc>) -> Result<Step, TransitionError> {
        match self {
            Transition::AssignOfficer(officer) => {
                Self::ensure_unlocked(group)?;
                if group.status != GroupStatus::PendingOfficer {
                    return Err(self.invalid(group));
                }
                let missing = officer.missing_fields();
                if !missing.is_empty() {
                    return Err(TransitionError::InvalidOfficer {
                        group_id: group.group_id.clone(),
                        missing,
                    });
                }
                if group.officer.as_ref() == Some(officer) {
                    return Ok(Step::Unchanged);
                }
                let mut next = group.clone();
                next.officer = Some(officer.clone());
                Ok(Step::Apply(Box::new(next)))
            }
            Transition::NotifyAssignment => {
                if group.notified {
                    return Ok(Step::Unchanged);
                }
                Self::ensure_unlocked(group)?;
                if group.officer.is_none() {
                    return Err(TransitionError::OfficerNotAssigned(group.group_id.clone()));
                }
                let mut next = group.clone();
                next.notified = true;
                if next.status == GroupStatus::PendingOfficer {
                    next.status = GroupStatus::Notified;
                }
                Ok(Step::Apply(Box::new(next)))
            }
            Transition::ApplicantSubmission { applicant, loan } => {
                Self::ensure_unlocked(group)?;
                if group.officer.is_none() {
                    return Err(TransitionError::OfficerNotAssigned(group.group_id.clone()));
                }
                if !matches!(
                    group.status,
                    GroupStatus::PendingOfficer
                        | GroupStatus::Notified
                        | GroupStatus::ApplicantSubmitted
                ) {
                    return Err(self.invalid(group));
                }
                if applicant.cooperator_id != group.applicant.cooperator_id {
                    return Err(TransitionError::PartyMismatch {
                        group_id: group.group_id.clone(),
                        cooperator: applicant.cooperator_id.clone(),
                        role: "applicant",
                    });
                }
                let mut next = group.clone();
                next.applicant = applicant.clone();
                next.loan = Some(loan.clone());
                next.submitted_at = Some(now);
                next.status = GroupStatus::ApplicantSubmitted;
                Ok(Step::Apply(Box::new(next)))
            }
            Transition::GuarantorSubmission {
                slot,
                contact,
                statement,
            } => {
                Self::ensure_unlocked(group)?;
                if contact.cooperator_id != group.guarantor(*slot).cooperator_id {
                    return Err(TransitionError::PartyMismatch {
                        group_id: group.group_id.clone(),
                        cooperator: contact.cooperator_id.clone(),
                        role: slot.label(),
                    });
                }
                let mut next = group.clone();
                *next.guarantor_mut(*slot) = contact.clone();
                next.set_guarantor_statement(*slot, statement.clone());
                Ok(Step::Apply(Box::new(next)))
            }
            Transition::OfficerReview(review) => {
                Self::ensure_unlocked(group)?;
                if group.status != GroupStatus::ApplicantSubmitted {
                    return Err(self.invalid(group));
                }
                let mut next = group.clone();
                next.review = Some(review.clone());
                next.status = GroupStatus::FinanceReviewed;
                next.locked = true;
                Ok(Step::Apply(Box::new(next)))
            }
            Transition::Expire(window) => {
                if group.status == GroupStatus::Expired {
                    return Ok(Step::Unchanged);
                }
                let submitted_at = match (group.status, group.submitted_at) {
                    (GroupStatus::ApplicantSubmitted, Some(at)) => at,
                    _ => return Err(self.invalid(group)),
                };
                if !window.is_exceeded(submitted_at, now) {
                    return Err(TransitionError::NotDue {
                        group_id: group.group_id.clone(),
                        remaining: window.remaining_periods(submitted_at, now),
                    });
                }
                let mut next = group.clone();
                next.status = GroupStatus::Expired;
                next.locked = true;
                Ok(Step::Apply(Box::new(next)))
            }
            Transition::Reset { from_cycle } => {
                if group.cycle > *from_cycle {
                    return Ok(Step::Unchanged);
                }
                if group.cycle < *from_cycle {
                    return Err(TransitionError::UnknownCycle {
                        group_id: group.group_id.clone(),
                        requested: *from_cycle,
                        current: group.cycle,
                    });
                }
                let mut next = group.clone();
                next.status = GroupStatus::PendingOfficer;
                next.locked = false;
                next.notified = false;
                next.submitted_at = None;
                next.cycle = group.cycle.saturating_add(1);
                Ok(Step::Apply(Box::new(next)))
            }
        }
    }
}
