//! Cooperative loan groups: enrollment of an applicant with two guarantors, officer
//! assignment, applicant and guarantor intake, finance review, reminders, and expiry.
//!
//! Transitions are pure functions in [`machine`]; [`service::LoanWorkflowService`] applies
//! them against a [`repository::LoanStore`] with optimistic compare-and-set and fans out
//! notifications through the delivery ledger.

pub mod allocator;
pub mod clock;
pub mod domain;
pub mod intake;
pub mod machine;
pub mod notifications;
pub mod officers;
pub mod repository;
pub mod router;
pub mod scheduler;
pub mod service;
pub mod store;

#[cfg(test)]
mod tests;

pub use allocator::GroupIdAllocator;
pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::{
    ContactCard, CooperatorId, GroupId, GroupStatus, GuarantorSlot, LoanDetails, LoanGroup,
    OfficerCard, ParticipantIntent, ParticipantRole, PartyRole, ReviewDecision,
};
pub use intake::{
    officer_from_fields, ApplicantForm, EnrollmentForm, FieldMap, GuarantorForm, IntakeError,
    OfficerReviewForm,
};
pub use machine::{ResponseWindow, Step, Transition, TransitionError};
pub use notifications::{
    DeliveryError, FanOutReport, FormLinkTemplate, IntakeLinks, LinkError, MailDelivery,
    NotificationOrchestrator, OutboundMessage, RejectionReason, WorkflowEvent,
};
pub use officers::{AssignmentMode, OfficerPool, OfficerSelector, RandomOfficerSelector};
pub use repository::{
    ArchivedGroup, DeliveryEntry, DeliveryKey, DeliveryLedger, GroupStatusView,
    LoanGroupRepository, LoanStore, RepositoryError, VersionedGroup,
};
pub use router::{loan_router, workflow_status};
pub use scheduler::{spawn_sweep_loop, SweepReport};
pub use service::{
    ArchiveOutcome, ClosureOutcome, LoanWorkflowService, NotifyOutcome, WorkflowError,
    WorkflowSettings,
};
pub use store::{write_archive_csv, InMemoryLoanStore};
