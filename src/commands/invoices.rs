use axum::{
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use axum_extra::extract::WithRejection;
use serde::Deserialize;
use uuid::Uuid;

use super::{read_upload, Owner};
use crate::error::AppError;
use crate::models::{InvoiceKind, NewInvoice};
use crate::services::processor;
use crate::services::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct InvoiceListParams {
    pub kind: Option<InvoiceKind>,
}

pub async fn list_invoices(
    State(state): State<AppState>,
    Owner(owner): Owner,
    WithRejection(Query(params), _): WithRejection<Query<InvoiceListParams>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let invoices = state.db()?.get_invoices(&owner, params.kind)?;
    Ok(Json(invoices))
}

pub async fn get_invoice(
    State(state): State<AppState>,
    Owner(owner): Owner,
    WithRejection(Path(id), _): WithRejection<Path<Uuid>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let invoice = state
        .db()?
        .get_invoice(&owner, id)?
        .ok_or_else(|| AppError::NotFound(format!("invoice {}", id)))?;
    Ok(Json(invoice))
}

pub async fn create_invoice(
    State(state): State<AppState>,
    Owner(owner): Owner,
    WithRejection(Json(payload), _): WithRejection<Json<NewInvoice>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    payload.validate().map_err(AppError::Validation)?;

    let invoice = state.db()?.insert_invoice(&owner, &payload)?;
    tracing::info!(owner, invoice_id = %invoice.id, kind = %invoice.kind, "Invoice created");
    Ok((StatusCode::CREATED, Json(invoice)))
}

pub async fn delete_invoice(
    State(state): State<AppState>,
    Owner(owner): Owner,
    WithRejection(Path(id), _): WithRejection<Path<Uuid>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    if !state.db()?.delete_invoice(&owner, id)? {
        return Err(AppError::NotFound(format!("invoice {}", id)));
    }
    tracing::info!(owner, invoice_id = %id, "Invoice deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Reads one PDF invoice and returns a candidate for the client to confirm.
pub async fn extract_invoice(
    State(state): State<AppState>,
    Owner(owner): Owner,
    WithRejection(mut multipart, _): WithRejection<Multipart, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let (file_name, bytes) = read_upload(&mut multipart).await?;
    let extracted = processor::extract_document(&state, &owner, &file_name, &bytes).await?;
    Ok(Json(extracted))
}
