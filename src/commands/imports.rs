use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use axum_extra::extract::WithRejection;
use uuid::Uuid;

use super::{read_upload, Owner};
use crate::error::AppError;
use crate::models::CandidatePatch;
use crate::services::processor;
use crate::services::state::AppState;

pub async fn upload_import(
    State(state): State<AppState>,
    Owner(owner): Owner,
    WithRejection(mut multipart, _): WithRejection<Multipart, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let (file_name, bytes) = read_upload(&mut multipart).await?;
    let view = processor::start_import(&state, &owner, &file_name, &bytes)?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn get_import(
    State(state): State<AppState>,
    Owner(owner): Owner,
    WithRejection(Path(id), _): WithRejection<Path<Uuid>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let view = state.with_session(&owner, id, |session| Ok(session.view()))?;
    Ok(Json(view))
}

pub async fn discard_import(
    State(state): State<AppState>,
    Owner(owner): Owner,
    WithRejection(Path(id), _): WithRejection<Path<Uuid>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    state.remove_session(&owner, id)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn classify_import(
    State(state): State<AppState>,
    Owner(owner): Owner,
    WithRejection(Path(id), _): WithRejection<Path<Uuid>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(processor::classify_import(&state, &owner, id).await?))
}

pub async fn update_candidate(
    State(state): State<AppState>,
    Owner(owner): Owner,
    WithRejection(Path((id, index)), _): WithRejection<Path<(Uuid, usize)>, AppError>,
    WithRejection(Json(patch), _): WithRejection<Json<CandidatePatch>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let view = state.with_session(&owner, id, |session| {
        session.update_candidate(index, patch)?;
        Ok(session.view())
    })?;
    Ok(Json(view))
}

pub async fn remove_candidate(
    State(state): State<AppState>,
    Owner(owner): Owner,
    WithRejection(Path((id, index)), _): WithRejection<Path<(Uuid, usize)>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let view = state.with_session(&owner, id, |session| {
        session.remove_candidate(index)?;
        Ok(session.view())
    })?;
    Ok(Json(view))
}

pub async fn commit_import(
    State(state): State<AppState>,
    Owner(owner): Owner,
    WithRejection(Path(id), _): WithRejection<Path<Uuid>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(processor::commit_import(&state, &owner, id)?))
}
