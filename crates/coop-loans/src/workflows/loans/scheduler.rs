use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use super::domain::{GroupId, GroupStatus};
use super::notifications::{MailDelivery, WorkflowEvent};
use super::repository::LoanStore;
use super::service::{ArchiveOutcome, ClosureOutcome, LoanWorkflowService, WorkflowError};

/// Counts from one sweep over the live store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub newly_notified: Vec<GroupId>,
    pub reminded: Vec<GroupId>,
    pub expired: Vec<GroupId>,
    pub archived_stragglers: Vec<GroupId>,
    pub skipped: usize,
}

impl<R, M> LoanWorkflowService<R, M>
where
    R: LoanStore + 'static,
    M: MailDelivery + 'static,
{
    /// One pass of the scheduler: announce newly assigned officers, then remind or expire
    /// every submitted group with an officer, then archive terminal groups left live.
    ///
    /// Safe to run twice for the same instant. Expiry only applies to submitted groups and
    /// reminders are simply sent again.
    pub fn run_sweep(&self) -> Result<SweepReport, WorkflowError> {
        let mut report = SweepReport {
            newly_notified: self.notify_newly_assigned()?,
            ..SweepReport::default()
        };

        let now = self.now();
        let window = self.window();
        for row in self.store().live_groups()? {
            let group = row.group;
            let group_id = group.group_id.clone();

            match group.status {
                GroupStatus::ApplicantSubmitted if group.officer.is_some() => {
                    let Some(submitted_at) = group.submitted_at else {
                        report.skipped += 1;
                        continue;
                    };

                    if window.is_exceeded(submitted_at, now) {
                        match self.expire(&group_id) {
                            Ok(ClosureOutcome::Archived(_)) | Ok(ClosureOutcome::Pending(_)) => {
                                report.expired.push(group_id)
                            }
                            Err(err) => {
                                warn!(%group_id, operation = "expire", error = %err, "sweep could not expire group");
                                report.skipped += 1;
                            }
                        }
                    } else {
                        let remaining_periods = window.remaining_periods(submitted_at, now);
                        self.notifier().dispatch(
                            self.store(),
                            &group,
                            &WorkflowEvent::Reminder { remaining_periods },
                            now,
                        );
                        report.reminded.push(group_id);
                    }
                }
                GroupStatus::FinanceReviewed | GroupStatus::Expired => {
                    match self.archive(&group_id) {
                        Ok(ArchiveOutcome::Archived(_)) => report.archived_stragglers.push(group_id),
                        Ok(ArchiveOutcome::AlreadyArchived(_)) => {}
                        Err(err) => {
                            warn!(%group_id, operation = "archive", error = %err, "sweep could not archive group");
                            report.skipped += 1;
                        }
                    }
                }
                _ => report.skipped += 1,
            }
        }

        info!(
            newly_notified = report.newly_notified.len(),
            reminded = report.reminded.len(),
            expired = report.expired.len(),
            archived = report.archived_stragglers.len(),
            skipped = report.skipped,
            "sweep finished"
        );
        Ok(report)
    }
}

/// Run [`LoanWorkflowService::run_sweep`] on a fixed interval until the task is aborted.
/// The first tick fires immediately.
pub fn spawn_sweep_loop<R, M>(
    service: Arc<LoanWorkflowService<R, M>>,
    every: Duration,
) -> tokio::task::JoinHandle<()>
where
    R: LoanStore + 'static,
    M: MailDelivery + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = service.run_sweep() {
                warn!(error = %err, "scheduled sweep failed");
            }
        }
    })
}
