//! Fan-out of workflow events to the parties of a group.
//!
//! Every ledgered event is delivered at most once per (group, cycle, event, recipient):
//! successful sends are written to the [`DeliveryLedger`] and replaying the same fan-out
//! only reaches recipients that were not reached before.

use std::fmt::{self, Write as _};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use url::Url;

use super::domain::{GroupId, GuarantorSlot, LoanGroup, PartyRole, ReviewDecision};
use super::intake::is_valid_email;
use super::repository::{DeliveryEntry, DeliveryKey, DeliveryLedger};

/// A rendered message ready for the delivery channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub group_id: GroupId,
    pub recipient: PartyRole,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Outbound e-mail channel. Best effort: a failure is reported, never retried here.
pub trait MailDelivery: Send + Sync {
    fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("'{0}' is not a deliverable address")]
    InvalidAddress(String),
    #[error("mail transport unavailable: {0}")]
    Transport(String),
}

/// Produces pre-addressed intake form links.
pub trait IntakeLinks: Send + Sync {
    fn link(&self, group_id: &GroupId, role: PartyRole, email: &str) -> Result<String, LinkError>;
}

/// Misconfiguration of the link generator. Messages go out without the link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("no intake form configured for {0}")]
    NotConfigured(PartyRole),
    #[error("intake form url '{url}' is invalid")]
    InvalidBase {
        url: String,
        #[source]
        source: url::ParseError,
    },
}

/// Link generator backed by one configured base URL per role.
#[derive(Debug, Clone, Default)]
pub struct FormLinkTemplate {
    applicant: Option<Url>,
    guarantor: Option<Url>,
    officer: Option<Url>,
}

impl FormLinkTemplate {
    pub fn from_urls(
        applicant: Option<&str>,
        guarantor: Option<&str>,
        officer: Option<&str>,
    ) -> Result<Self, LinkError> {
        let parse = |raw: Option<&str>| {
            raw.map(|url| {
                Url::parse(url).map_err(|source| LinkError::InvalidBase {
                    url: url.to_string(),
                    source,
                })
            })
            .transpose()
        };
        Ok(Self {
            applicant: parse(applicant)?,
            guarantor: parse(guarantor)?,
            officer: parse(officer)?,
        })
    }
}

impl IntakeLinks for FormLinkTemplate {
    fn link(&self, group_id: &GroupId, role: PartyRole, email: &str) -> Result<String, LinkError> {
        let base = match role {
            PartyRole::Applicant => self.applicant.as_ref(),
            PartyRole::Guarantor(_) => self.guarantor.as_ref(),
            PartyRole::Officer => self.officer.as_ref(),
        }
        .ok_or(LinkError::NotConfigured(role))?;

        let mut url = base.clone();
        url.query_pairs_mut()
            .append_pair("group", &group_id.0)
            .append_pair("role", role.label())
            .append_pair("email", email);
        Ok(url.into())
    }
}

/// Why a submission was turned away. The submitter receives a notice explaining it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    OfficerNotAssigned,
    ActiveApplicationExists { existing: GroupId },
    Locked,
}

/// Workflow event that triggers a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowEvent {
    Enrolled,
    OfficerAssigned,
    ApplicantSubmitted,
    GuarantorSubmitted(GuarantorSlot),
    OfficerReviewed(ReviewDecision),
    Expired,
    Reset,
    Reminder { remaining_periods: u32 },
}

impl WorkflowEvent {
    /// Ledger key for the event; reminders are not ledgered.
    pub fn ledger_key(&self) -> Option<String> {
        let key = match self {
            WorkflowEvent::Enrolled => "enrolled".to_string(),
            WorkflowEvent::OfficerAssigned => "officer_assigned".to_string(),
            WorkflowEvent::ApplicantSubmitted => "applicant_submitted".to_string(),
            WorkflowEvent::GuarantorSubmitted(GuarantorSlot::First) => {
                "guarantor_submitted:1".to_string()
            }
            WorkflowEvent::GuarantorSubmitted(GuarantorSlot::Second) => {
                "guarantor_submitted:2".to_string()
            }
            WorkflowEvent::OfficerReviewed(_) => "officer_reviewed".to_string(),
            WorkflowEvent::Expired => "expired".to_string(),
            WorkflowEvent::Reset => "reset".to_string(),
            WorkflowEvent::Reminder { .. } => return None,
        };
        Some(key)
    }

    /// Recipients in delivery order.
    pub fn recipients(&self) -> Vec<PartyRole> {
        use PartyRole::*;
        const G1: PartyRole = Guarantor(GuarantorSlot::First);
        const G2: PartyRole = Guarantor(GuarantorSlot::Second);
        match self {
            WorkflowEvent::Enrolled => vec![Applicant],
            WorkflowEvent::OfficerAssigned
            | WorkflowEvent::ApplicantSubmitted
            | WorkflowEvent::Reset => vec![Applicant, G1, G2, Officer],
            WorkflowEvent::GuarantorSubmitted(slot) => vec![Guarantor(*slot), Applicant, Officer],
            WorkflowEvent::OfficerReviewed(_) => vec![Applicant, G1, G2],
            WorkflowEvent::Expired => vec![Applicant],
            WorkflowEvent::Reminder { .. } => vec![G1, G2, Officer],
        }
    }

    fn subject(&self, group_id: &GroupId) -> String {
        match self {
            WorkflowEvent::Enrolled => format!("Loan group {group_id} enrolled"),
            WorkflowEvent::OfficerAssigned => {
                format!("Loan group {group_id}: reviewing officer assigned")
            }
            WorkflowEvent::ApplicantSubmitted => {
                format!("Loan group {group_id}: application submitted")
            }
            WorkflowEvent::GuarantorSubmitted(slot) => {
                format!("Loan group {group_id}: {} form received", slot.label())
            }
            WorkflowEvent::OfficerReviewed(decision) => {
                format!("Loan group {group_id}: application {}", decision.label())
            }
            WorkflowEvent::Expired => format!("Loan group {group_id}: application expired"),
            WorkflowEvent::Reset => format!("Loan group {group_id} has been reset"),
            WorkflowEvent::Reminder { remaining_periods } => format!(
                "Reminder: loan group {group_id} expires in {remaining_periods} day(s)"
            ),
        }
    }

    fn headline(&self, role: PartyRole) -> String {
        match (self, role) {
            (WorkflowEvent::Enrolled, _) => {
                "Your loan group has been enrolled and is waiting for a reviewing officer."
                    .to_string()
            }
            (WorkflowEvent::OfficerAssigned, PartyRole::Officer) => {
                "You have been assigned as reviewing officer for this loan group.".to_string()
            }
            (WorkflowEvent::OfficerAssigned, _) => {
                "A reviewing officer has been assigned. Please complete your form.".to_string()
            }
            (WorkflowEvent::ApplicantSubmitted, PartyRole::Applicant) => {
                "Your application has been received.".to_string()
            }
            (WorkflowEvent::ApplicantSubmitted, _) => {
                "The applicant has submitted their application; your response is due within the response window."
                    .to_string()
            }
            (WorkflowEvent::GuarantorSubmitted(slot), _) => {
                format!("{} has submitted their form.", slot.label())
            }
            (WorkflowEvent::OfficerReviewed(decision), _) => {
                format!("The finance review is complete: {}.", decision.label())
            }
            (WorkflowEvent::Expired, _) => {
                "The response window closed before the review was completed. The application has expired."
                    .to_string()
            }
            (WorkflowEvent::Reset, _) => {
                "An administrator has reset this loan group. The process starts again.".to_string()
            }
            (WorkflowEvent::Reminder { remaining_periods }, _) => format!(
                "Your response is still outstanding. {remaining_periods} day(s) remain before the application expires."
            ),
        }
    }

    /// Whether the message carries the recipient's intake link.
    fn includes_link(&self, role: PartyRole) -> bool {
        match self {
            WorkflowEvent::OfficerAssigned | WorkflowEvent::Reminder { .. } => true,
            WorkflowEvent::ApplicantSubmitted => role != PartyRole::Applicant,
            _ => false,
        }
    }
}

impl fmt::Display for WorkflowEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ledger_key() {
            Some(key) => f.write_str(&key),
            None => f.write_str("reminder"),
        }
    }
}

/// Ordered field/value rows describing a group, shared by every message about it.
pub fn summary_table(group: &LoanGroup) -> Vec<(&'static str, String)> {
    let mut rows = vec![
        ("Group ID", group.group_id.0.clone()),
        ("Status", group.status.label().to_string()),
        (
            "Applicant",
            format!("{} ({})", group.applicant.name, group.applicant.cooperator_id),
        ),
        (
            "Guarantor 1",
            format!("{} ({})", group.guarantor1.name, group.guarantor1.cooperator_id),
        ),
        (
            "Guarantor 2",
            format!("{} ({})", group.guarantor2.name, group.guarantor2.cooperator_id),
        ),
    ];
    if let Some(officer) = &group.officer {
        rows.push(("Officer", format!("{} <{}>", officer.name, officer.email)));
    }
    if let Some(loan) = &group.loan {
        rows.push(("Loan Amount", loan.loan_amount.to_string()));
        rows.push(("Loan Purpose", loan.loan_purpose.clone()));
        rows.push(("Repayment Months", loan.repayment_months.to_string()));
    }
    if let Some(review) = &group.review {
        rows.push(("Decision", review.decision.label().to_string()));
        if let Some(comments) = &review.comments {
            rows.push(("Officer Comments", comments.clone()));
        }
    }
    rows
}

fn render_table(rows: &[(&'static str, String)]) -> String {
    let width = rows.iter().map(|(field, _)| field.len()).max().unwrap_or(0);
    let mut table = String::new();
    for (field, value) in rows {
        let _ = writeln!(table, "{field:<width$} : {value}");
    }
    table
}

/// Counts from one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    pub already_delivered: usize,
    pub skipped_invalid: usize,
    pub failed: usize,
}

/// Turns workflow events into messages and hands them to the delivery channel.
pub struct NotificationOrchestrator<M> {
    mailer: std::sync::Arc<M>,
    links: Box<dyn IntakeLinks>,
}

impl<M> NotificationOrchestrator<M>
where
    M: MailDelivery,
{
    pub fn new(mailer: std::sync::Arc<M>, links: Box<dyn IntakeLinks>) -> Self {
        Self { mailer, links }
    }

    pub fn with_links(self, links: Box<dyn IntakeLinks>) -> Self {
        Self {
            mailer: self.mailer,
            links,
        }
    }

    /// Messages for an event in delivery order. Recipients without an address on record
    /// (e.g. no officer yet) are left out.
    pub fn plan(&self, group: &LoanGroup, event: &WorkflowEvent) -> Vec<OutboundMessage> {
        let summary = render_table(&summary_table(group));
        event
            .recipients()
            .into_iter()
            .filter_map(|role| {
                let (name, email) = group.contact_for(role)?;
                let mut body = String::new();
                let _ = writeln!(body, "Dear {name},");
                let _ = writeln!(body);
                let _ = writeln!(body, "{}", event.headline(role));
                let _ = writeln!(body);
                body.push_str(&summary);
                if event.includes_link(role) {
                    if let Some(link) = self.link_for(&group.group_id, role, email) {
                        let _ = writeln!(body);
                        let _ = writeln!(body, "Form: {link}");
                    }
                }
                Some(OutboundMessage {
                    group_id: group.group_id.clone(),
                    recipient: role,
                    to: email.to_string(),
                    subject: event.subject(&group.group_id),
                    body,
                })
            })
            .collect()
    }

    fn link_for(&self, group_id: &GroupId, role: PartyRole, email: &str) -> Option<String> {
        match self.links.link(group_id, role, email) {
            Ok(link) => Some(link),
            Err(error) => {
                debug!(%group_id, recipient = %role, %error, "intake link omitted");
                None
            }
        }
    }

    /// Deliver an event's messages, skipping recipients the ledger shows as reached.
    pub fn dispatch<L>(
        &self,
        ledger: &L,
        group: &LoanGroup,
        event: &WorkflowEvent,
        now: DateTime<Utc>,
    ) -> FanOutReport
    where
        L: DeliveryLedger + ?Sized,
    {
        let mut report = FanOutReport::default();
        let ledger_event = event.ledger_key();

        for message in self.plan(group, event) {
            let key = ledger_event.as_ref().map(|event_key| DeliveryKey {
                group_id: group.group_id.clone(),
                cycle: group.cycle,
                event: event_key.clone(),
                recipient: message.recipient,
            });

            if let Some(key) = &key {
                match ledger.has_delivered(key) {
                    Ok(true) => {
                        report.already_delivered += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(error) => {
                        warn!(group_id = %group.group_id, %event, %error, "delivery ledger unavailable; sending anyway");
                    }
                }
            }

            match self.deliver(&message) {
                Ok(()) => {
                    report.delivered += 1;
                    if let Some(key) = key {
                        let entry = DeliveryEntry {
                            key,
                            address: message.to.clone(),
                            delivered_at: now,
                        };
                        if let Err(error) = ledger.record_delivery(entry) {
                            warn!(group_id = %group.group_id, %event, %error, "delivery not recorded");
                        }
                    }
                }
                Err(DeliveryError::InvalidAddress(address)) => {
                    report.skipped_invalid += 1;
                    warn!(group_id = %group.group_id, %event, recipient = %message.recipient, %address, "skipping recipient with invalid address");
                }
                Err(error) => {
                    report.failed += 1;
                    warn!(group_id = %group.group_id, %event, recipient = %message.recipient, %error, "notification delivery failed");
                }
            }
        }

        info!(
            group_id = %group.group_id,
            %event,
            delivered = report.delivered,
            already_delivered = report.already_delivered,
            skipped = report.skipped_invalid,
            failed = report.failed,
            "notification fan-out finished"
        );
        report
    }

    /// Tell a submitter why their submission was turned away.
    pub fn notify_rejection(
        &self,
        recipient: PartyRole,
        to: &str,
        name: &str,
        group_id: Option<&GroupId>,
        reason: &RejectionReason,
    ) -> Result<(), DeliveryError> {
        let reference = group_id
            .map(|id| id.0.clone())
            .unwrap_or_else(|| "your loan group".to_string());
        let (subject, explanation) = match reason {
            RejectionReason::OfficerNotAssigned => (
                format!("{reference}: please wait for a reviewing officer"),
                "No reviewing officer has been assigned yet. You will be notified when you can submit.".to_string(),
            ),
            RejectionReason::ActiveApplicationExists { existing } => (
                format!("{reference}: an application is already in progress"),
                format!("You already have an open application in loan group {existing}. It must be completed or expire before you apply again."),
            ),
            RejectionReason::Locked => (
                format!("{reference}: application is locked"),
                "This application is locked and can no longer be changed. Please contact an administrator.".to_string(),
            ),
        };

        let message = OutboundMessage {
            group_id: group_id.cloned().unwrap_or_else(|| GroupId(String::new())),
            recipient,
            to: to.to_string(),
            subject,
            body: format!("Dear {name},\n\n{explanation}\n"),
        };
        self.deliver(&message)
    }

    fn deliver(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        if !is_valid_email(&message.to) {
            return Err(DeliveryError::InvalidAddress(message.to.clone()));
        }
        self.mailer.send(message)
    }
}
