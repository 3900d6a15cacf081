use axum::{extract::State, response::IntoResponse, Json};
use axum_extra::extract::WithRejection;
use serde::Deserialize;

use super::Owner;
use crate::error::AppError;
use crate::models::SettingsView;
use crate::services::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SettingsPayload {
    pub company_name: Option<String>,
    pub openai_api_key: Option<String>,
}

pub async fn get_settings(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(settings_view(&state, &owner)?))
}

pub async fn save_settings(
    State(state): State<AppState>,
    Owner(owner): Owner,
    WithRejection(Json(payload), _): WithRejection<Json<SettingsPayload>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    state
        .save_settings(&owner, payload.company_name, payload.openai_api_key)
        .await?;
    tracing::info!(owner, "Settings saved");
    Ok(Json(settings_view(&state, &owner)?))
}

fn settings_view(state: &AppState, owner: &str) -> Result<SettingsView, AppError> {
    let settings = state.load_settings(owner)?;
    Ok(SettingsView {
        company_name: settings.company_name,
        has_api_key: settings.openai_api_key.is_some(),
    })
}
