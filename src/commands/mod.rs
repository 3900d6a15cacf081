pub mod dashboard;
pub mod fixed_costs;
pub mod imports;
pub mod invoices;
pub mod settings;

use axum::{
    async_trait,
    extract::{DefaultBodyLimit, FromRequestParts, Multipart},
    http::request::Parts,
    response::IntoResponse,
    routing::{delete, get, patch, post},
    Json, Router,
};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::error::AppError;
use crate::services::state::AppState;

/// Owner of every record touched by a request, taken from the `X-User-ID`
/// header set by the authenticating proxy in front of this service.
#[derive(Debug, Clone)]
pub struct Owner(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner = parts
            .headers
            .get("X-User-ID")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::Auth("missing X-User-ID header".to_string()))?;

        Ok(Owner(owner.to_string()))
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;

    Router::new()
        .route("/health", get(health_check))
        .route("/invoices", get(invoices::list_invoices).post(invoices::create_invoice))
        .route("/invoices/extract", post(invoices::extract_invoice))
        .route("/invoices/:id", get(invoices::get_invoice).delete(invoices::delete_invoice))
        .route(
            "/fixed-costs",
            get(fixed_costs::list_fixed_costs).post(fixed_costs::create_fixed_cost),
        )
        .route("/fixed-costs/categories", get(fixed_costs::list_categories))
        .route("/fixed-costs/:id", delete(fixed_costs::delete_fixed_cost))
        .route("/dashboard", get(dashboard::get_dashboard_stats))
        .route("/breakeven", get(dashboard::get_breakeven))
        .route("/taxes", get(dashboard::get_vat_report))
        .route("/activity", get(dashboard::get_activity))
        .route("/settings", get(settings::get_settings).put(settings::save_settings))
        .route("/imports", post(imports::upload_import))
        .route("/imports/:id", get(imports::get_import).delete(imports::discard_import))
        .route("/imports/:id/classify", post(imports::classify_import))
        .route(
            "/imports/:id/candidates/:index",
            patch(imports::update_candidate).delete(imports::remove_candidate),
        )
        .route("/imports/:id/commit", post(imports::commit_import))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "cuentas",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Reads the first uploaded file of a multipart body.
pub(crate) async fn read_upload(multipart: &mut Multipart) -> Result<(String, Vec<u8>), AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("failed to read multipart field: {}", e)))?
    {
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::Validation(format!("failed to read file bytes: {}", e)))?;
        return Ok((file_name, bytes.to_vec()));
    }
    Err(AppError::Validation("no file uploaded".to_string()))
}
