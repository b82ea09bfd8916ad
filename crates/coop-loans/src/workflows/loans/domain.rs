use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier wrapper for loan groups (`LC0001`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cooperative membership number identifying an applicant or guarantor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CooperatorId(pub String);

impl fmt::Display for CooperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity and contact details for a cooperative member taking part in a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCard {
    pub cooperator_id: CooperatorId,
    pub name: String,
    pub phone: String,
    pub email: String,
}

/// Reviewing officer identity. Also the shape of an officer pool entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfficerCard {
    pub officer_id: String,
    pub name: String,
    pub phone: String,
    pub email: String,
}

impl OfficerCard {
    /// Names of the officer fields that are blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("Officer ID", &self.officer_id),
            ("Officer Name", &self.name),
            ("Officer Phone", &self.phone),
            ("Officer Email", &self.email),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| field)
        .collect()
    }
}

/// Lifecycle status of a loan group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupStatus {
    PendingOfficer,
    Notified,
    ApplicantSubmitted,
    FinanceReviewed,
    Expired,
}

impl GroupStatus {
    pub const fn label(self) -> &'static str {
        match self {
            GroupStatus::PendingOfficer => "pending_officer",
            GroupStatus::Notified => "notified",
            GroupStatus::ApplicantSubmitted => "applicant_submitted",
            GroupStatus::FinanceReviewed => "finance_reviewed",
            GroupStatus::Expired => "expired",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, GroupStatus::FinanceReviewed | GroupStatus::Expired)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// Forward edges follow `PendingOfficer -> Notified -> ApplicantSubmitted ->
    /// {FinanceReviewed, Expired}`, with `PendingOfficer -> ApplicantSubmitted` allowed for
    /// groups whose officer was bound before the assignment notice went out. An applicant
    /// resubmission keeps the group in `ApplicantSubmitted`. Every state may return to
    /// `PendingOfficer` through an administrative reset.
    pub const fn permits(self, next: GroupStatus) -> bool {
        use GroupStatus::*;
        matches!(
            (self, next),
            (PendingOfficer, Notified)
                | (PendingOfficer, ApplicantSubmitted)
                | (Notified, ApplicantSubmitted)
                | (ApplicantSubmitted, ApplicantSubmitted)
                | (ApplicantSubmitted, FinanceReviewed)
                | (ApplicantSubmitted, Expired)
                | (_, PendingOfficer)
        )
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which of the two guarantor slots a party occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GuarantorSlot {
    First,
    Second,
}

impl GuarantorSlot {
    pub const ALL: [GuarantorSlot; 2] = [GuarantorSlot::First, GuarantorSlot::Second];

    pub const fn label(self) -> &'static str {
        match self {
            GuarantorSlot::First => "Guarantor 1",
            GuarantorSlot::Second => "Guarantor 2",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "first" | "guarantor1" | "guarantor 1" => Some(GuarantorSlot::First),
            "2" | "second" | "guarantor2" | "guarantor 2" => Some(GuarantorSlot::Second),
            _ => None,
        }
    }
}

/// Party a message, link, or ledger entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PartyRole {
    Applicant,
    Guarantor(GuarantorSlot),
    Officer,
}

impl PartyRole {
    pub const fn label(self) -> &'static str {
        match self {
            PartyRole::Applicant => "Applicant",
            PartyRole::Guarantor(slot) => slot.label(),
            PartyRole::Officer => "Officer",
        }
    }
}

impl fmt::Display for PartyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Loan particulars captured from the applicant form. Not interpreted by the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanDetails {
    pub loan_amount: u64,
    pub loan_purpose: String,
    pub repayment_months: u16,
    pub monthly_income: Option<u64>,
    pub comments: Option<String>,
    pub extra: BTreeMap<String, String>,
}

/// What a guarantor filed on their own form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuarantorStatement {
    pub comments: Option<String>,
    pub extra: BTreeMap<String, String>,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewDecision {
    Approved,
    Rejected,
}

impl ReviewDecision {
    pub const fn label(self) -> &'static str {
        match self {
            ReviewDecision::Approved => "Approved",
            ReviewDecision::Rejected => "Rejected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "approved" | "approve" => Some(ReviewDecision::Approved),
            "rejected" | "reject" | "declined" => Some(ReviewDecision::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfficerReview {
    pub decision: ReviewDecision,
    pub comments: Option<String>,
    pub extra: BTreeMap<String, String>,
    pub reviewed_at: DateTime<Utc>,
}

/// One loan application lifecycle spanning an applicant and two guarantors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanGroup {
    pub group_id: GroupId,
    pub status: GroupStatus,
    pub locked: bool,
    pub notified: bool,
    /// Incremented by every reset; scopes notification bookkeeping to one run of the workflow.
    pub cycle: u32,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub applicant: ContactCard,
    pub guarantor1: ContactCard,
    pub guarantor2: ContactCard,
    pub officer: Option<OfficerCard>,
    pub loan: Option<LoanDetails>,
    pub guarantor1_statement: Option<GuarantorStatement>,
    pub guarantor2_statement: Option<GuarantorStatement>,
    pub review: Option<OfficerReview>,
}

impl LoanGroup {
    pub fn enrolled(
        group_id: GroupId,
        applicant: ContactCard,
        guarantor1: ContactCard,
        guarantor2: ContactCard,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            group_id,
            status: GroupStatus::PendingOfficer,
            locked: false,
            notified: false,
            cycle: 0,
            created_at: now,
            submitted_at: None,
            applicant,
            guarantor1,
            guarantor2,
            officer: None,
            loan: None,
            guarantor1_statement: None,
            guarantor2_statement: None,
            review: None,
        }
    }

    pub fn guarantor(&self, slot: GuarantorSlot) -> &ContactCard {
        match slot {
            GuarantorSlot::First => &self.guarantor1,
            GuarantorSlot::Second => &self.guarantor2,
        }
    }

    pub(crate) fn guarantor_mut(&mut self, slot: GuarantorSlot) -> &mut ContactCard {
        match slot {
            GuarantorSlot::First => &mut self.guarantor1,
            GuarantorSlot::Second => &mut self.guarantor2,
        }
    }

    pub fn guarantor_statement(&self, slot: GuarantorSlot) -> Option<&GuarantorStatement> {
        match slot {
            GuarantorSlot::First => self.guarantor1_statement.as_ref(),
            GuarantorSlot::Second => self.guarantor2_statement.as_ref(),
        }
    }

    pub(crate) fn set_guarantor_statement(
        &mut self,
        slot: GuarantorSlot,
        statement: GuarantorStatement,
    ) {
        match slot {
            GuarantorSlot::First => self.guarantor1_statement = Some(statement),
            GuarantorSlot::Second => self.guarantor2_statement = Some(statement),
        }
    }

    /// Display name and address for a party, if the party exists on this group.
    pub fn contact_for(&self, role: PartyRole) -> Option<(&str, &str)> {
        match role {
            PartyRole::Applicant => Some((&self.applicant.name, &self.applicant.email)),
            PartyRole::Guarantor(slot) => {
                let card = self.guarantor(slot);
                Some((&card.name, &card.email))
            }
            PartyRole::Officer => self
                .officer
                .as_ref()
                .map(|officer| (officer.name.as_str(), officer.email.as_str())),
        }
    }

    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Which party an intent record was filed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantRole {
    Applicant,
    Guarantor(GuarantorSlot),
}

/// Immutable enrollment row, one per (group, participant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantIntent {
    pub group_id: GroupId,
    pub role: ParticipantRole,
    pub contact: ContactCard,
    pub recorded_at: DateTime<Utc>,
}

impl ParticipantIntent {
    pub fn for_group(group: &LoanGroup) -> [ParticipantIntent; 3] {
        let row = |role, contact: &ContactCard| ParticipantIntent {
            group_id: group.group_id.clone(),
            role,
            contact: contact.clone(),
            recorded_at: group.created_at,
        };
        [
            row(ParticipantRole::Applicant, &group.applicant),
            row(
                ParticipantRole::Guarantor(GuarantorSlot::First),
                &group.guarantor1,
            ),
            row(
                ParticipantRole::Guarantor(GuarantorSlot::Second),
                &group.guarantor2,
            ),
        ]
    }
}
