use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::domain::{CooperatorId, GroupId, LoanGroup, ParticipantIntent, PartyRole};

/// A live group row together with the store-owned version used for compare-and-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedGroup {
    pub group: LoanGroup,
    pub version: u64,
}

/// Cold-storage row. `group` is the last live state, unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedGroup {
    pub group: LoanGroup,
    pub version: u64,
    pub archived_at: DateTime<Utc>,
}

/// Storage abstraction over live groups, participant intent rows, and the archive.
///
/// Writes to a live group go through [`LoanGroupRepository::compare_and_set`]: the caller
/// passes the version it read and the write only lands if nobody else wrote in between.
pub trait LoanGroupRepository: Send + Sync {
    /// Insert a new live group at version 1. Rejects identifiers already used, live or archived.
    fn insert_group(&self, group: LoanGroup) -> Result<VersionedGroup, RepositoryError>;
    fn fetch_group(&self, id: &GroupId) -> Result<Option<VersionedGroup>, RepositoryError>;
    fn compare_and_set(
        &self,
        expected_version: u64,
        group: LoanGroup,
    ) -> Result<VersionedGroup, RepositoryError>;
    fn live_groups(&self) -> Result<Vec<VersionedGroup>, RepositoryError>;
    /// Every identifier ever stored, live or archived.
    fn group_ids(&self) -> Result<Vec<GroupId>, RepositoryError>;

    /// Insert the intent rows for one enrollment, all or nothing.
    fn insert_intents(&self, intents: &[ParticipantIntent]) -> Result<(), RepositoryError>;
    fn intents_for(&self, id: &GroupId) -> Result<Vec<ParticipantIntent>, RepositoryError>;

    /// Move a live group into cold storage if it is still at `expected_version`.
    fn archive(
        &self,
        id: &GroupId,
        expected_version: u64,
        archived_at: DateTime<Utc>,
    ) -> Result<ArchivedGroup, RepositoryError>;
    fn fetch_archived(&self, id: &GroupId) -> Result<Option<ArchivedGroup>, RepositoryError>;
    fn archived(&self) -> Result<Vec<ArchivedGroup>, RepositoryError>;
}

/// Per-recipient record of notifications already delivered.
pub trait DeliveryLedger: Send + Sync {
    fn has_delivered(&self, key: &DeliveryKey) -> Result<bool, RepositoryError>;
    fn record_delivery(&self, entry: DeliveryEntry) -> Result<(), RepositoryError>;
    fn deliveries_for(&self, id: &GroupId) -> Result<Vec<DeliveryEntry>, RepositoryError>;
}

/// Everything the workflow service needs from the record store.
pub trait LoanStore: LoanGroupRepository + DeliveryLedger {}

impl<T> LoanStore for T where T: LoanGroupRepository + DeliveryLedger {}

/// Identity of one delivery: which message of which workflow run went to which party.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryKey {
    pub group_id: GroupId,
    pub cycle: u32,
    pub event: String,
    pub recipient: PartyRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryEntry {
    pub key: DeliveryKey,
    pub address: String,
    pub delivered_at: DateTime<Utc>,
}

/// Error enumeration for repository failures.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("record already exists")]
    Conflict,
    #[error("record was modified concurrently (expected version {expected}, found {found})")]
    VersionMismatch { expected: u64, found: u64 },
    #[error("record not found")]
    NotFound,
    #[error("participant {cooperator} is already enrolled on group {group_id}")]
    DuplicateIntent {
        group_id: GroupId,
        cooperator: CooperatorId,
    },
    #[error("repository unavailable: {0}")]
    Unavailable(String),
}

/// Sanitized representation of a group's exposed status.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatusView {
    pub group_id: GroupId,
    pub status: &'static str,
    pub locked: bool,
    pub notified: bool,
    pub archived: bool,
    /// Reset cycle; an administrative reset names the cycle it applies to.
    pub cycle: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub officer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl GroupStatusView {
    pub fn live(group: &LoanGroup) -> Self {
        Self::build(group, false)
    }

    pub fn archived(record: &ArchivedGroup) -> Self {
        Self::build(&record.group, true)
    }

    fn build(group: &LoanGroup, archived: bool) -> Self {
        Self {
            group_id: group.group_id.clone(),
            status: group.status.label(),
            locked: group.locked,
            notified: group.notified,
            archived,
            cycle: group.cycle,
            officer: group.officer.as_ref().map(|officer| officer.name.clone()),
            submitted_at: group.submitted_at,
        }
    }
}
