use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use axum_extra::extract::WithRejection;
use uuid::Uuid;

use super::Owner;
use crate::error::AppError;
use crate::models::{CategoryInfo, ExpenseCategory, NewFixedCost};
use crate::services::state::AppState;

pub async fn list_fixed_costs(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.db()?.get_fixed_costs(&owner)?))
}

pub async fn create_fixed_cost(
    State(state): State<AppState>,
    Owner(owner): Owner,
    WithRejection(Json(payload), _): WithRejection<Json<NewFixedCost>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let cost = state.db()?.insert_fixed_cost(&owner, &payload)?;
    tracing::info!(owner, category = cost.category.as_str(), "Fixed cost created");
    Ok((StatusCode::CREATED, Json(cost)))
}

pub async fn delete_fixed_cost(
    State(state): State<AppState>,
    Owner(owner): Owner,
    WithRejection(Path(id), _): WithRejection<Path<Uuid>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    if !state.db()?.delete_fixed_cost(&owner, id)? {
        return Err(AppError::NotFound(format!("fixed cost {}", id)));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_categories() -> Json<Vec<CategoryInfo>> {
    Json(
        ExpenseCategory::ALL
            .iter()
            .map(|category| CategoryInfo {
                id: *category,
                label: category.label().to_string(),
            })
            .collect(),
    )
}
