use crate::infra::{build_service, morning_of, LoanService, TracingMailer};
use chrono::{Duration, NaiveDate, Utc};
use clap::Args;
use coop_loans::config::{AppConfig, LoanConfig};
use coop_loans::error::AppError;
use coop_loans::workflows::loans::{
    write_archive_csv, ApplicantForm, Clock, EnrollmentForm, FieldMap, GroupId, GuarantorForm,
    GuarantorSlot, ManualClock, OfficerCard, OfficerReviewForm, SweepReport, WorkflowError,
};
use serde::Serialize;
use std::sync::Arc;

#[derive(Args, Debug, Default)]
pub(crate) struct DemoArgs {
    /// Day the walkthrough starts (YYYY-MM-DD). Defaults to today.
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) start: Option<NaiveDate>,
    /// Print the archive sheet as CSV at the end.
    #[arg(long)]
    pub(crate) archive_csv: bool,
}

#[derive(Args, Debug)]
pub(crate) struct SweepArgs {
    /// Day the seeded applications are submitted from (YYYY-MM-DD). Defaults to today.
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) start: Option<NaiveDate>,
    /// Number of seeded groups; group N is submitted N days after the start.
    #[arg(long, default_value_t = 3)]
    pub(crate) groups: u32,
    /// Days between the first submission and the sweep.
    #[arg(long, default_value_t = 8)]
    pub(crate) days: i64,
    /// Print the sweep report as JSON.
    #[arg(long)]
    pub(crate) json: bool,
}

#[derive(Debug, Serialize)]
struct SweepSummary<'a> {
    swept_at: chrono::DateTime<Utc>,
    report: &'a SweepReport,
    messages_sent: usize,
}

pub(crate) fn run_sweep_once(args: SweepArgs) -> Result<(), AppError> {
    let SweepArgs {
        start,
        groups,
        days,
        json,
    } = args;

    let config = AppConfig::load()?;
    let start = morning_of(start.unwrap_or_else(|| Utc::now().date_naive()));
    let clock = Arc::new(ManualClock::starting_at(start));
    let (service, outbox) = build_service(&config.loans)?;
    let service = service.with_clock(clock.clone());

    for index in 0..groups {
        let suffix = index + 1;
        let group_id = enroll(
            &service,
            &format!("A{suffix}"),
            &format!("G{suffix}A"),
            &format!("G{suffix}B"),
        )?;
        service.assign_officer(&group_id, demo_officer())?;
        service.notify_assignment(&group_id)?;
        service.submit_application(applicant_form(&group_id, &format!("A{suffix}"))?)?;
        clock.advance(Duration::days(1));
    }

    clock.set(start + Duration::days(days));
    let before = outbox.sent().len();
    let report = service.run_sweep()?;
    let summary = SweepSummary {
        swept_at: clock.now(),
        report: &report,
        messages_sent: outbox.sent().len() - before,
    };

    if json {
        match serde_json::to_string_pretty(&summary) {
            Ok(rendered) => println!("{rendered}"),
            Err(err) => println!("failed to render sweep report: {err}"),
        }
    } else {
        render_sweep(&summary);
    }
    Ok(())
}

fn render_sweep(summary: &SweepSummary<'_>) {
    let report = summary.report;
    println!("Sweep at {}", summary.swept_at.format("%Y-%m-%d %H:%M UTC"));
    println!("  newly notified : {}", join_ids(&report.newly_notified));
    println!("  reminded       : {}", join_ids(&report.reminded));
    println!("  expired        : {}", join_ids(&report.expired));
    println!("  archived       : {}", join_ids(&report.archived_stragglers));
    println!("  skipped        : {}", report.skipped);
    println!("  messages sent  : {}", summary.messages_sent);
}

fn join_ids(ids: &[GroupId]) -> String {
    if ids.is_empty() {
        return "-".to_string();
    }
    ids.iter()
        .map(|id| id.0.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs { start, archive_csv } = args;

    let start = morning_of(start.unwrap_or_else(|| Utc::now().date_naive()));
    let clock = Arc::new(ManualClock::starting_at(start));
    let (service, outbox) = build_service(&LoanConfig::default())?;
    let service = service.with_clock(clock.clone());

    println!("Cooperative loan workflow demo");
    println!("==============================");

    let reviewed = enroll(&service, "A1", "B1", "B2")?;
    println!("\n1. Enrolled applicant A1 with guarantors B1, B2 as {reviewed}");

    match service.submit_application(applicant_form(&reviewed, "A1")?) {
        Err(err) => println!("2. Early application turned away: {err}"),
        Ok(_) => println!("2. Early application unexpectedly accepted"),
    }

    service.assign_officer(&reviewed, demo_officer())?;
    let first = service.notify_assignment(&reviewed)?;
    let second = service.notify_assignment(&reviewed)?;
    println!(
        "3. Officer assigned; first notice delivered {} message(s), repeat delivered {} ({} already sent)",
        first.fan_out.delivered, second.fan_out.delivered, second.fan_out.already_delivered
    );

    let group = service.submit_application(applicant_form(&reviewed, "A1")?)?;
    println!("4. Application received; {reviewed} is now {}", group.status);

    for (slot, cooperator, email) in [
        (GuarantorSlot::First, "B1", "b1@example.org"),
        (GuarantorSlot::Second, "B2", "b2@example.org"),
    ] {
        let form = GuarantorForm::from_fields(&guarantor_fields(&reviewed, cooperator, email))
            .map_err(WorkflowError::from)?;
        service.submit_guarantor(slot, form)?;
        println!("5. {} ({cooperator}) submitted their form", slot.label());
    }

    let second_group = enroll(&service, "A2", "B3", "B4")?;
    service.assign_officer(&second_group, demo_officer())?;
    service.notify_assignment(&second_group)?;
    service.submit_application(applicant_form(&second_group, "A2")?)?;
    println!("6. Second group {second_group} submitted and left waiting on its officer");

    let review = OfficerReviewForm::from_fields(&fields(&[
        ("Group ID", reviewed.0.as_str()),
        ("Decision", "Approved"),
        ("Comments", "Cash flow supports repayment"),
    ]))
    .map_err(WorkflowError::from)?;
    let closed = service.record_review(review)?;
    println!(
        "7. Finance review recorded: {} is {} and locked={}",
        reviewed,
        closed.group().status,
        closed.group().locked
    );

    clock.advance(Duration::days(3));
    let report = service.run_sweep()?;
    println!(
        "8. Day 3 sweep reminded {} group(s)",
        report.reminded.len()
    );

    clock.advance(Duration::days(5));
    let report = service.run_sweep()?;
    println!("9. Day 8 sweep expired {}", join_ids(&report.expired));

    let view = service.status(&second_group)?;
    println!(
        "10. {} archived={} status={}",
        view.group_id, view.archived, view.status
    );

    render_outbox(&outbox);

    if archive_csv {
        println!("\nArchive sheet");
        let rows = service.archived()?;
        write_archive_csv(&rows, std::io::stdout())?;
    }
    Ok(())
}

fn render_outbox(outbox: &TracingMailer) {
    let sent = outbox.sent();
    println!("\nOutbox ({} message(s))", sent.len());
    for message in sent {
        println!(
            "  - {:<8} {:<12} {:<24} {}",
            message.group_id, message.recipient, message.to, message.subject
        );
    }
}

fn enroll(
    service: &LoanService,
    applicant: &str,
    guarantor1: &str,
    guarantor2: &str,
) -> Result<GroupId, AppError> {
    let mut map = FieldMap::new();
    for (prefix, id) in [
        ("Applicant", applicant),
        ("Guarantor 1", guarantor1),
        ("Guarantor 2", guarantor2),
    ] {
        map.insert(format!("{prefix} Cooperator ID"), id.to_string());
        map.insert(format!("{prefix} Name"), format!("Member {id}"));
        map.insert(format!("{prefix} Phone"), "0800 000 0000".to_string());
        map.insert(
            format!("{prefix} Email"),
            format!("{}@example.org", id.to_ascii_lowercase()),
        );
    }
    let form = EnrollmentForm::from_fields(&map).map_err(WorkflowError::from)?;
    Ok(service.enroll(form)?.group_id)
}

fn applicant_form(group_id: &GroupId, cooperator: &str) -> Result<ApplicantForm, AppError> {
    let email = format!("{}@example.org", cooperator.to_ascii_lowercase());
    let name = format!("Member {cooperator}");
    let map = fields(&[
        ("Group ID", group_id.0.as_str()),
        ("Cooperator ID", cooperator),
        ("Name", name.as_str()),
        ("Phone", "0800 000 0000"),
        ("Email", email.as_str()),
        ("Loan Amount", "250,000"),
        ("Loan Purpose", "Poultry expansion"),
        ("Repayment Months", "12"),
    ]);
    Ok(ApplicantForm::from_fields(&map).map_err(WorkflowError::from)?)
}

fn guarantor_fields(group_id: &GroupId, cooperator: &str, email: &str) -> FieldMap {
    let name = format!("Member {cooperator}");
    fields(&[
        ("Group ID", group_id.0.as_str()),
        ("Cooperator ID", cooperator),
        ("Name", name.as_str()),
        ("Phone", "0800 000 0000"),
        ("Email", email),
    ])
}

fn demo_officer() -> OfficerCard {
    OfficerCard {
        officer_id: "OF-1".to_string(),
        name: "Grace Officer".to_string(),
        phone: "0801 111 1111".to_string(),
        email: "grace@coop.example.org".to_string(),
    }
}

fn fields(pairs: &[(&str, &str)]) -> FieldMap {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}
