use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use axum_extra::extract::WithRejection;
use chrono::NaiveDate;
use serde::Deserialize;

use super::Owner;
use crate::error::AppError;
use crate::models::DashboardStats;
use crate::services::aggregation;
use crate::services::state::AppState;
use crate::utils::today;

const RECENT_INVOICES: usize = 5;
const CHART_MONTHS: u32 = 12;
const ACTIVITY_LIMIT: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct DashboardParams {
    /// `YYYY-MM`; the chart ends at this month.
    pub month: Option<String>,
}

pub async fn get_dashboard_stats(
    State(state): State<AppState>,
    Owner(owner): Owner,
    WithRejection(Query(params), _): WithRejection<Query<DashboardParams>, AppError>,
) -> Result<impl IntoResponse, AppError> {
    let chart_end = match params.month.as_deref() {
        Some(month) => parse_year_month(month)?,
        None => today(),
    };

    let (invoices, costs, recent_invoices) = {
        let db = state.db()?;
        (
            db.get_invoices(&owner, None)?,
            db.get_fixed_costs(&owner)?,
            db.get_recent_invoices(&owner, RECENT_INVOICES)?,
        )
    };

    let report = aggregation::breakeven_report(&invoices, &costs);
    Ok(Json(DashboardStats {
        total_sales: report.total_sales,
        total_received: report.total_received,
        total_fixed_costs: report.total_fixed_costs,
        breakeven: report.breakeven,
        coverage_percent: report.coverage_percent,
        recent_invoices,
        chart: aggregation::monthly_series(&invoices, chart_end, CHART_MONTHS),
    }))
}

pub async fn get_breakeven(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> Result<impl IntoResponse, AppError> {
    let (invoices, costs) = {
        let db = state.db()?;
        (db.get_invoices(&owner, None)?, db.get_fixed_costs(&owner)?)
    };
    Ok(Json(aggregation::breakeven_report(&invoices, &costs)))
}

pub async fn get_vat_report(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> Result<impl IntoResponse, AppError> {
    let invoices = state.db()?.get_invoices(&owner, None)?;
    Ok(Json(aggregation::vat_report(&invoices)))
}

/// Recent document/import processing outcomes.
pub async fn get_activity(
    State(state): State<AppState>,
    Owner(owner): Owner,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(state.db()?.get_processing_logs(&owner, ACTIVITY_LIMIT)?))
}

fn parse_year_month(value: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(&format!("{}-01", value.trim()), "%Y-%m-%d")
        .map_err(|_| AppError::Validation(format!("month '{}' is not YYYY-MM", value)))
}
