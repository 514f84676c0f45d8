//! Axum router and the multipart submission handler.
//!
//! Every path and method lands on [`handle_submit`]; the deployed
//! convention is `POST /`.  Non-2xx responses carry no body — the reason
//! is logged here and nowhere else.

use std::sync::Arc;

use axum::extract::multipart::{Field, Multipart, MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use tracing::{error, info, instrument, warn};

use crate::job::{Job, PatchSource};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`]: one fallback route catching all paths and
/// methods, bounded by the configured form limit.
pub fn create_router(state: Arc<AppState>) -> Router {
    let limit = state.config.intake.max_form_bytes;
    Router::new()
        .fallback(handle_submit)
        .layer(DefaultBodyLimit::max(limit))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Submission handler
// ---------------------------------------------------------------------------

/// Raw form fields, prior to validation.
#[derive(Default)]
struct Submission {
    repository: Option<String>,
    branch: Option<String>,
    patch: Option<Bytes>,
    url: Option<String>,
}

/// Accept one patch submission.
///
/// Parses the multipart form, resolves the patch byte source (uploaded
/// part or remote URL), and blocks on the rendezvous hand-off to the
/// worker.  Returns 200 only after the worker has taken the job.
#[instrument(skip_all)]
async fn handle_submit(
    State(state): State<Arc<AppState>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<StatusCode, AppError> {
    let multipart = multipart
        .map_err(|e| AppError::BadRequest(format!("not a multipart request: {e}")))?;

    let submission = parse_submission(multipart).await?;

    let repository = require_text(submission.repository, "repository")?;
    let branch = require_text(submission.branch, "branch")?;

    let patch = match (submission.patch, submission.url) {
        (Some(bytes), None) => PatchSource::Buffered(bytes),
        (None, Some(url)) => fetch_remote_patch(&state, &url).await?,
        (Some(_), Some(_)) => {
            return Err(AppError::BadRequest(
                "both patch and url supplied; exactly one is required".into(),
            ));
        }
        (None, None) => {
            return Err(AppError::BadRequest(
                "neither patch nor url supplied; exactly one is required".into(),
            ));
        }
    };

    info!(%repository, %branch, "queueing patch submission");

    state
        .queue
        .send_async(Job {
            repository,
            branch,
            patch,
        })
        .await
        .map_err(|_| AppError::Internal(anyhow::anyhow!("the worker queue is closed")))?;

    Ok(StatusCode::OK)
}

/// Walk the multipart fields into a [`Submission`].  A second occurrence
/// of any recognized field is an error; unrecognized fields are ignored.
async fn parse_submission(mut multipart: Multipart) -> Result<Submission, AppError> {
    let mut submission = Submission::default();

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let Some(name) = field.name().map(str::to_owned) else {
            continue;
        };
        match name.as_str() {
            "repository" => text_field(field, &name, &mut submission.repository).await?,
            "branch" => text_field(field, &name, &mut submission.branch).await?,
            "url" => text_field(field, &name, &mut submission.url).await?,
            "patch" => {
                if submission.patch.is_some() {
                    return Err(AppError::BadRequest("duplicate patch field".into()));
                }
                submission.patch = Some(field.bytes().await.map_err(bad_multipart)?);
            }
            _ => {}
        }
    }

    Ok(submission)
}

/// Read one text field into `slot`, rejecting duplicates.
async fn text_field(
    field: Field<'_>,
    name: &str,
    slot: &mut Option<String>,
) -> Result<(), AppError> {
    if slot.is_some() {
        return Err(AppError::BadRequest(format!("duplicate {name} field")));
    }
    *slot = Some(field.text().await.map_err(bad_multipart)?);
    Ok(())
}

/// A required text field must be present and non-empty.
fn require_text(value: Option<String>, name: &str) -> Result<String, AppError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("missing {name} field")))
}

fn bad_multipart(err: MultipartError) -> AppError {
    AppError::BadRequest(format!("malformed multipart body: {err}"))
}

// ---------------------------------------------------------------------------
// Remote patch fetch
// ---------------------------------------------------------------------------

/// GET the submitted `url` and wrap its body as the job's byte source.
///
/// The response is not buffered; the worker streams it straight into the
/// tool's stdin.  A declared `Content-Length` above the ceiling is
/// rejected here; the streaming copy enforces the same ceiling for
/// responses that do not declare one.
async fn fetch_remote_patch(state: &AppState, url: &str) -> Result<PatchSource, AppError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| AppError::BadRequest(format!("invalid patch url: {e}")))?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(AppError::BadRequest(format!(
            "patch url must be http or https, got {}",
            parsed.scheme()
        )));
    }

    let response = state
        .http_client
        .get(parsed)
        .send()
        .await
        .map_err(|e| AppError::Internal(anyhow::Error::new(e).context("failed to fetch patch url")))?;

    if !response.status().is_success() {
        return Err(AppError::Internal(anyhow::anyhow!(
            "patch url returned {}",
            response.status()
        )));
    }

    let limit = state.config.intake.max_remote_patch_bytes;
    if let Some(length) = response.content_length() {
        if length > limit {
            return Err(AppError::BadRequest(format!(
                "remote patch is {length} bytes, above the {limit}-byte ceiling"
            )));
        }
    }

    Ok(PatchSource::Remote { response, limit })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error mapped to a status-only HTTP response.
#[derive(Debug)]
pub enum AppError {
    /// The request violates the form contract.
    BadRequest(String),
    /// Intake-side infrastructure failure.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(reason) => {
                warn!(%reason, "rejected patch submission");
                StatusCode::BAD_REQUEST.into_response()
            }
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "patch intake failed");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
