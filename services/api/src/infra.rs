use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use coop_loans::config::LoanConfig;
use coop_loans::error::AppError;
use coop_loans::workflows::loans::{
    DeliveryError, InMemoryLoanStore, LoanWorkflowService, MailDelivery, OutboundMessage,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

pub(crate) type LoanService = LoanWorkflowService<InMemoryLoanStore, TracingMailer>;

/// Outbox that logs every message instead of handing it to a mail relay.
#[derive(Default)]
pub(crate) struct TracingMailer {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl TracingMailer {
    pub(crate) fn sent(&self) -> Vec<OutboundMessage> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl MailDelivery for TracingMailer {
    fn send(&self, message: &OutboundMessage) -> Result<(), DeliveryError> {
        info!(
            group_id = %message.group_id,
            recipient = %message.recipient,
            to = %message.to,
            subject = %message.subject,
            "message queued"
        );
        self.sent
            .lock()
            .map_err(|_| DeliveryError::Transport("outbox mutex poisoned".to_string()))?
            .push(message.clone());
        Ok(())
    }
}

/// Service over a fresh in-memory store, configured from `LOAN_*` settings.
pub(crate) fn build_service(
    config: &LoanConfig,
) -> Result<(LoanService, Arc<TracingMailer>), AppError> {
    let store = Arc::new(InMemoryLoanStore::default());
    let mailer = Arc::new(TracingMailer::default());
    let service = LoanWorkflowService::new(store, mailer.clone(), config.workflow_settings()?)?;
    Ok((service, mailer))
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD ({err})"))
}

/// Nine in the morning UTC on `date`.
pub(crate) fn morning_of(date: NaiveDate) -> DateTime<Utc> {
    let naive = date.and_hms_opt(9, 0, 0).unwrap_or_default();
    Utc.from_utc_datetime(&naive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn parse_date_reports_bad_input() {
        assert!(parse_date("2025-03-03").is_ok());
        let err = parse_date("03/03/2025").expect_err("not ISO");
        assert!(err.contains("YYYY-MM-DD"));
    }

    #[test]
    fn morning_of_is_nine_utc() {
        let date = parse_date("2025-03-03").expect("valid");
        assert_eq!(morning_of(date).hour(), 9);
    }
}
