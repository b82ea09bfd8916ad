use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use super::domain::{GroupId, GuarantorSlot};
use super::intake::{
    officer_from_fields, ApplicantForm, EnrollmentForm, FieldMap, GuarantorForm, IntakeError,
    OfficerReviewForm,
};
use super::machine::TransitionError;
use super::notifications::MailDelivery;
use super::repository::{GroupStatusView, LoanStore, RepositoryError};
use super::service::{ArchiveOutcome, ClosureOutcome, LoanWorkflowService, WorkflowError};
use super::store::write_archive_csv;

const GROUP_ID_FIELD: &str = "Group ID";

/// Body of the reset route: the cycle shown by the status view when the reset was requested.
#[derive(Debug, Deserialize)]
pub(crate) struct ResetRequest {
    pub(crate) cycle: u32,
}

/// Router exposing the intake surfaces and administrative controls.
pub fn loan_router<R, M>(service: Arc<LoanWorkflowService<R, M>>) -> Router
where
    R: LoanStore + 'static,
    M: MailDelivery + 'static,
{
    Router::new()
        .route("/api/v1/loans/enrollments", post(enroll_handler::<R, M>))
        .route(
            "/api/v1/loans/applications",
            post(application_handler::<R, M>),
        )
        .route(
            "/api/v1/loans/groups/:group_id/guarantors/:slot",
            post(guarantor_handler::<R, M>),
        )
        .route(
            "/api/v1/loans/groups/:group_id/review",
            post(review_handler::<R, M>),
        )
        .route(
            "/api/v1/loans/groups/:group_id",
            get(status_handler::<R, M>),
        )
        .route(
            "/api/v1/admin/groups/:group_id/officer",
            put(assign_officer_handler::<R, M>),
        )
        .route(
            "/api/v1/admin/notifications",
            post(notify_handler::<R, M>),
        )
        .route(
            "/api/v1/admin/groups/:group_id/reset",
            post(reset_handler::<R, M>),
        )
        .route(
            "/api/v1/admin/groups/:group_id/archive",
            post(archive_handler::<R, M>),
        )
        .route("/api/v1/admin/sweep", post(sweep_handler::<R, M>))
        .route(
            "/api/v1/admin/archive.csv",
            get(archive_export_handler::<R, M>),
        )
        .with_state(service)
}

pub(crate) async fn enroll_handler<R, M>(
    State(service): State<Arc<LoanWorkflowService<R, M>>>,
    Json(fields): Json<FieldMap>,
) -> Response
where
    R: LoanStore + 'static,
    M: MailDelivery + 'static,
{
    let result = EnrollmentForm::from_fields(&fields)
        .map_err(WorkflowError::from)
        .and_then(|form| service.enroll(form));
    match result {
        Ok(group) => (StatusCode::CREATED, Json(GroupStatusView::live(&group))).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn application_handler<R, M>(
    State(service): State<Arc<LoanWorkflowService<R, M>>>,
    Json(fields): Json<FieldMap>,
) -> Response
where
    R: LoanStore + 'static,
    M: MailDelivery + 'static,
{
    let result = ApplicantForm::from_fields(&fields)
        .map_err(WorkflowError::from)
        .and_then(|form| service.submit_application(form));
    match result {
        Ok(group) => (StatusCode::ACCEPTED, Json(GroupStatusView::live(&group))).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn guarantor_handler<R, M>(
    State(service): State<Arc<LoanWorkflowService<R, M>>>,
    Path((group_id, slot)): Path<(String, String)>,
    Json(fields): Json<FieldMap>,
) -> Response
where
    R: LoanStore + 'static,
    M: MailDelivery + 'static,
{
    let Some(slot) = GuarantorSlot::parse(&slot) else {
        let payload = json!({
            "error": format!("unknown guarantor slot '{slot}'"),
        });
        return (StatusCode::NOT_FOUND, Json(payload)).into_response();
    };

    let result = with_path_group(fields, &group_id)
        .and_then(|fields| GuarantorForm::from_fields(&fields))
        .map_err(WorkflowError::from)
        .and_then(|form| service.submit_guarantor(slot, form));
    match result {
        Ok(group) => (StatusCode::ACCEPTED, Json(GroupStatusView::live(&group))).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn review_handler<R, M>(
    State(service): State<Arc<LoanWorkflowService<R, M>>>,
    Path(group_id): Path<String>,
    Json(fields): Json<FieldMap>,
) -> Response
where
    R: LoanStore + 'static,
    M: MailDelivery + 'static,
{
    let result = with_path_group(fields, &group_id)
        .and_then(|fields| OfficerReviewForm::from_fields(&fields))
        .map_err(WorkflowError::from)
        .and_then(|form| service.record_review(form));
    match result {
        Ok(ClosureOutcome::Archived(record)) => {
            (StatusCode::OK, Json(GroupStatusView::archived(&record))).into_response()
        }
        Ok(ClosureOutcome::Pending(group)) => {
            (StatusCode::OK, Json(GroupStatusView::live(&group))).into_response()
        }
        Err(error) => error_response(error),
    }
}

pub(crate) async fn status_handler<R, M>(
    State(service): State<Arc<LoanWorkflowService<R, M>>>,
    Path(group_id): Path<String>,
) -> Response
where
    R: LoanStore + 'static,
    M: MailDelivery + 'static,
{
    match service.status(&GroupId(group_id)) {
        Ok(view) => (StatusCode::OK, Json(view)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn assign_officer_handler<R, M>(
    State(service): State<Arc<LoanWorkflowService<R, M>>>,
    Path(group_id): Path<String>,
    Json(fields): Json<FieldMap>,
) -> Response
where
    R: LoanStore + 'static,
    M: MailDelivery + 'static,
{
    let officer = officer_from_fields(&fields);
    match service.assign_officer(&GroupId(group_id), officer) {
        Ok(group) => (StatusCode::OK, Json(GroupStatusView::live(&group))).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn notify_handler<R, M>(
    State(service): State<Arc<LoanWorkflowService<R, M>>>,
) -> Response
where
    R: LoanStore + 'static,
    M: MailDelivery + 'static,
{
    match service.notify_newly_assigned() {
        Ok(notified) => {
            let payload = json!({
                "notified": notified,
            });
            (StatusCode::OK, Json(payload)).into_response()
        }
        Err(error) => error_response(error),
    }
}

pub(crate) async fn reset_handler<R, M>(
    State(service): State<Arc<LoanWorkflowService<R, M>>>,
    Path(group_id): Path<String>,
    Json(request): Json<ResetRequest>,
) -> Response
where
    R: LoanStore + 'static,
    M: MailDelivery + 'static,
{
    match service.reset(&GroupId(group_id), request.cycle) {
        Ok(group) => (StatusCode::OK, Json(GroupStatusView::live(&group))).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn archive_handler<R, M>(
    State(service): State<Arc<LoanWorkflowService<R, M>>>,
    Path(group_id): Path<String>,
) -> Response
where
    R: LoanStore + 'static,
    M: MailDelivery + 'static,
{
    match service.archive(&GroupId(group_id)) {
        Ok(ArchiveOutcome::Archived(record)) => {
            (StatusCode::OK, Json(GroupStatusView::archived(&record))).into_response()
        }
        Ok(ArchiveOutcome::AlreadyArchived(record)) => {
            let payload = json!({
                "group_id": record.group.group_id,
                "message": "already archived",
                "archived_at": record.archived_at,
            });
            (StatusCode::OK, Json(payload)).into_response()
        }
        Err(error) => error_response(error),
    }
}

pub(crate) async fn sweep_handler<R, M>(
    State(service): State<Arc<LoanWorkflowService<R, M>>>,
) -> Response
where
    R: LoanStore + 'static,
    M: MailDelivery + 'static,
{
    match service.run_sweep() {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(error) => error_response(error),
    }
}

pub(crate) async fn archive_export_handler<R, M>(
    State(service): State<Arc<LoanWorkflowService<R, M>>>,
) -> Response
where
    R: LoanStore + 'static,
    M: MailDelivery + 'static,
{
    let rows = match service.archived() {
        Ok(rows) => rows,
        Err(error) => return error_response(error),
    };

    let mut buffer = Vec::new();
    if let Err(error) = write_archive_csv(&rows, &mut buffer) {
        let payload = json!({
            "error": error.to_string(),
        });
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(payload)).into_response();
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Fill the form's group field from the path; a conflicting body value is rejected.
fn with_path_group(mut fields: FieldMap, group_id: &str) -> Result<FieldMap, IntakeError> {
    if let Some(existing) = fields.get(GROUP_ID_FIELD) {
        let existing = existing.trim();
        if !existing.is_empty() && existing != group_id {
            return Err(IntakeError::InvalidField {
                field: GROUP_ID_FIELD,
                reason: format!("'{existing}' does not match group {group_id} in the path"),
            });
        }
    }
    fields.insert(GROUP_ID_FIELD.to_string(), group_id.to_string());
    Ok(fields)
}

/// HTTP status for a workflow failure. Shared with `AppError` so both surfaces agree.
pub fn workflow_status(error: &WorkflowError) -> StatusCode {
    match error {
        WorkflowError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        WorkflowError::NotFound(_) | WorkflowError::NoOpenGroup(_) => StatusCode::NOT_FOUND,
        WorkflowError::Transition(TransitionError::InvalidOfficer { .. }) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        WorkflowError::Transition(TransitionError::PartyMismatch { .. }) => {
            StatusCode::FORBIDDEN
        }
        WorkflowError::ActiveApplicationExists { .. }
        | WorkflowError::Transition(_)
        | WorkflowError::NotArchivable { .. }
        | WorkflowError::Conflict { .. } => StatusCode::CONFLICT,
        WorkflowError::Repository(RepositoryError::NotFound) => StatusCode::NOT_FOUND,
        WorkflowError::Repository(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: WorkflowError) -> Response {
    let status = workflow_status(&error);
    let payload = json!({
        "error": error.to_string(),
    });
    (status, Json(payload)).into_response()
}
