use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::domain::{GroupId, LoanGroup, ParticipantIntent};
use super::repository::{
    ArchivedGroup, DeliveryEntry, DeliveryKey, DeliveryLedger, LoanGroupRepository,
    RepositoryError, VersionedGroup,
};

#[derive(Debug, Default)]
struct Tables {
    live: BTreeMap<GroupId, VersionedGroup>,
    intents: Vec<ParticipantIntent>,
    archive: BTreeMap<GroupId, ArchivedGroup>,
    deliveries: HashMap<DeliveryKey, DeliveryEntry>,
}

/// Arena of group records keyed by identifier, guarded by one mutex.
///
/// Each trait call holds the lock for its whole duration, so a compare-and-set or an
/// archive move is atomic with respect to every other call.
#[derive(Debug, Default, Clone)]
pub struct InMemoryLoanStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryLoanStore {
    fn tables(&self) -> Result<MutexGuard<'_, Tables>, RepositoryError> {
        self.tables
            .lock()
            .map_err(|_| RepositoryError::Unavailable("store mutex poisoned".to_string()))
    }
}

impl LoanGroupRepository for InMemoryLoanStore {
    fn insert_group(&self, group: LoanGroup) -> Result<VersionedGroup, RepositoryError> {
        let mut tables = self.tables()?;
        if tables.live.contains_key(&group.group_id) || tables.archive.contains_key(&group.group_id)
        {
            return Err(RepositoryError::Conflict);
        }
        let row = VersionedGroup { group, version: 1 };
        tables.live.insert(row.group.group_id.clone(), row.clone());
        Ok(row)
    }

    fn fetch_group(&self, id: &GroupId) -> Result<Option<VersionedGroup>, RepositoryError> {
        Ok(self.tables()?.live.get(id).cloned())
    }

    fn compare_and_set(
        &self,
        expected_version: u64,
        group: LoanGroup,
    ) -> Result<VersionedGroup, RepositoryError> {
        let mut tables = self.tables()?;
        let row = tables
            .live
            .get_mut(&group.group_id)
            .ok_or(RepositoryError::NotFound)?;
        if row.version != expected_version {
            return Err(RepositoryError::VersionMismatch {
                expected: expected_version,
                found: row.version,
            });
        }
        row.group = group;
        row.version += 1;
        Ok(row.clone())
    }

    fn live_groups(&self) -> Result<Vec<VersionedGroup>, RepositoryError> {
        Ok(self.tables()?.live.values().cloned().collect())
    }

    fn group_ids(&self) -> Result<Vec<GroupId>, RepositoryError> {
        let tables = self.tables()?;
        Ok(tables
            .live
            .keys()
            .chain(tables.archive.keys())
            .cloned()
            .collect())
    }

    fn insert_intents(&self, intents: &[ParticipantIntent]) -> Result<(), RepositoryError> {
        let mut tables = self.tables()?;
        let mut seen: HashSet<(&GroupId, &str)> = tables
            .intents
            .iter()
            .map(|row| (&row.group_id, row.contact.cooperator_id.0.as_str()))
            .collect();

        for intent in intents {
            let key = (&intent.group_id, intent.contact.cooperator_id.0.as_str());
            if !seen.insert(key) {
                return Err(RepositoryError::DuplicateIntent {
                    group_id: intent.group_id.clone(),
                    cooperator: intent.contact.cooperator_id.clone(),
                });
            }
        }
        drop(seen);

        tables.intents.extend(intents.iter().cloned());
        Ok(())
    }

    fn intents_for(&self, id: &GroupId) -> Result<Vec<ParticipantIntent>, RepositoryError> {
        Ok(self
            .tables()?
            .intents
            .iter()
            .filter(|row| &row.group_id == id)
            .cloned()
            .collect())
    }

    fn archive(
        &self,
        id: &GroupId,
        expected_version: u64,
        archived_at: DateTime<Utc>,
    ) -> Result<ArchivedGroup, RepositoryError> {
        let mut tables = self.tables()?;
        let found = tables
            .live
            .get(id)
            .map(|row| row.version)
            .ok_or(RepositoryError::NotFound)?;
        if found != expected_version {
            return Err(RepositoryError::VersionMismatch {
                expected: expected_version,
                found,
            });
        }

        let row = tables.live.remove(id).ok_or(RepositoryError::NotFound)?;
        let archived = ArchivedGroup {
            group: row.group,
            version: row.version,
            archived_at,
        };
        tables.archive.insert(id.clone(), archived.clone());
        Ok(archived)
    }

    fn fetch_archived(&self, id: &GroupId) -> Result<Option<ArchivedGroup>, RepositoryError> {
        Ok(self.tables()?.archive.get(id).cloned())
    }

    fn archived(&self) -> Result<Vec<ArchivedGroup>, RepositoryError> {
        Ok(self.tables()?.archive.values().cloned().collect())
    }
}

impl DeliveryLedger for InMemoryLoanStore {
    fn has_delivered(&self, key: &DeliveryKey) -> Result<bool, RepositoryError> {
        Ok(self.tables()?.deliveries.contains_key(key))
    }

    fn record_delivery(&self, entry: DeliveryEntry) -> Result<(), RepositoryError> {
        self.tables()?
            .deliveries
            .entry(entry.key.clone())
            .or_insert(entry);
        Ok(())
    }

    fn deliveries_for(&self, id: &GroupId) -> Result<Vec<DeliveryEntry>, RepositoryError> {
        let mut entries: Vec<DeliveryEntry> = self
            .tables()?
            .deliveries
            .values()
            .filter(|entry| &entry.key.group_id == id)
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.delivered_at);
        Ok(entries)
    }
}

#[derive(Debug, Serialize)]
struct ArchiveRow<'a> {
    #[serde(rename = "Group ID")]
    group_id: &'a str,
    #[serde(rename = "Status")]
    status: &'static str,
    #[serde(rename = "Applicant Cooperator ID")]
    applicant: &'a str,
    #[serde(rename = "Guarantor 1 Cooperator ID")]
    guarantor1: &'a str,
    #[serde(rename = "Guarantor 2 Cooperator ID")]
    guarantor2: &'a str,
    #[serde(rename = "Officer")]
    officer: &'a str,
    #[serde(rename = "Loan Amount")]
    loan_amount: Option<u64>,
    #[serde(rename = "Decision")]
    decision: &'static str,
    #[serde(rename = "Created At")]
    created_at: String,
    #[serde(rename = "Submitted At")]
    submitted_at: String,
    #[serde(rename = "Archived At")]
    archived_at: String,
}

/// Write archived groups as a flat CSV sheet, one row per group.
pub fn write_archive_csv<W: Write>(
    rows: &[ArchivedGroup],
    writer: W,
) -> Result<(), csv::Error> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for row in rows {
        let group = &row.group;
        csv_writer.serialize(ArchiveRow {
            group_id: &group.group_id.0,
            status: group.status.label(),
            applicant: &group.applicant.cooperator_id.0,
            guarantor1: &group.guarantor1.cooperator_id.0,
            guarantor2: &group.guarantor2.cooperator_id.0,
            officer: group
                .officer
                .as_ref()
                .map(|officer| officer.name.as_str())
                .unwrap_or_default(),
            loan_amount: group.loan.as_ref().map(|loan| loan.loan_amount),
            decision: group
                .review
                .as_ref()
                .map(|review| review.decision.label())
                .unwrap_or_default(),
            created_at: group.created_at.to_rfc3339(),
            submitted_at: group
                .submitted_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_default(),
            archived_at: row.archived_at.to_rfc3339(),
        })?;
    }
    csv_writer.flush()?;
    Ok(())
}
