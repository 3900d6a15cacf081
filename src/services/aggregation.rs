//! Aggregations over one owner's ledger snapshot.
//!
//! Everything here is pure and works in exact decimal arithmetic; amounts
//! never pass through binary floating point.

use chrono::{Datelike, Months, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use std::collections::HashMap;

use crate::models::{
    Amount, BreakevenReport, BreakevenStatus, FixedCost, Invoice, InvoiceKind, MonthlyPoint, VatBalance,
    VatLine, VatPosition, VatReport, VatSplit,
};

/// Flat VAT rate applied to every invoice. All amounts are VAT-inclusive.
pub const STANDARD_VAT_RATE: Decimal = dec!(0.21);

const HUNDRED: Decimal = dec!(100);

pub fn total_by_kind(invoices: &[Invoice], kind: InvoiceKind) -> Decimal {
    invoices
        .iter()
        .filter(|invoice| invoice.kind == kind)
        .map(|invoice| invoice.amount.value())
        .sum()
}

pub fn total_fixed_costs(costs: &[FixedCost]) -> Decimal {
    costs.iter().map(|cost| cost.monthly_amount.value()).sum()
}

/// Positive means a deficit still to be covered; zero or negative is a surplus.
pub fn breakeven(total_sales: Decimal, total_received: Decimal, total_fixed: Decimal) -> Decimal {
    (total_fixed + total_received) - total_sales
}

/// Share of costs covered by sales, clamped to `[0, 100]` and 0 when there are no costs.
pub fn coverage_percent(total_sales: Decimal, total_received: Decimal, total_fixed: Decimal) -> Decimal {
    let total_costs = total_fixed + total_received;
    if total_costs.is_zero() {
        return Decimal::ZERO;
    }
    let percent = (total_sales / total_costs * HUNDRED).round_dp(2);
    percent.clamp(Decimal::ZERO, HUNDRED)
}

/// Splits a VAT-inclusive amount into base and VAT.
///
/// `base` is rounded to cents and `vat` takes the remainder, so the two
/// always add back up to `amount`.
pub fn vat_split(amount: Amount, rate: Decimal) -> VatSplit {
    let total = amount.value();
    let base = total
        .checked_div(Decimal::ONE + rate)
        .unwrap_or(total)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    VatSplit {
        base,
        vat: total - base,
    }
}

pub fn vat_balance(invoices: &[Invoice]) -> VatBalance {
    let mut sales_vat = Decimal::ZERO;
    let mut purchase_vat = Decimal::ZERO;
    for invoice in invoices {
        let split = vat_split(invoice.amount, STANDARD_VAT_RATE);
        match invoice.kind {
            InvoiceKind::Sale => sales_vat += split.vat,
            InvoiceKind::Received => purchase_vat += split.vat,
        }
    }
    VatBalance {
        sales_vat,
        purchase_vat,
        balance: sales_vat - purchase_vat,
    }
}

pub fn breakeven_report(invoices: &[Invoice], costs: &[FixedCost]) -> BreakevenReport {
    let total_sales = total_by_kind(invoices, InvoiceKind::Sale);
    let total_received = total_by_kind(invoices, InvoiceKind::Received);
    let total_fixed_costs = total_fixed_costs(costs);
    let result = breakeven(total_sales, total_received, total_fixed_costs);

    BreakevenReport {
        total_sales,
        total_received,
        total_fixed_costs,
        total_costs: total_fixed_costs + total_received,
        breakeven: result,
        status: if result > Decimal::ZERO {
            BreakevenStatus::Deficit
        } else {
            BreakevenStatus::Surplus
        },
        coverage_percent: coverage_percent(total_sales, total_received, total_fixed_costs),
    }
}

pub fn vat_report(invoices: &[Invoice]) -> VatReport {
    let mut lines: Vec<VatLine> = invoices
        .iter()
        .map(|invoice| {
            let split = vat_split(invoice.amount, STANDARD_VAT_RATE);
            VatLine {
                invoice_id: invoice.id,
                issue_date: invoice.issue_date,
                counterparty: invoice.counterparty.clone(),
                kind: invoice.kind,
                base: split.base,
                vat: split.vat,
                total: invoice.amount.value(),
            }
        })
        .collect();
    lines.sort_by(|a, b| b.issue_date.cmp(&a.issue_date));

    let totals = vat_balance(invoices);
    VatReport {
        rate: STANDARD_VAT_RATE,
        lines,
        position: if totals.balance >= Decimal::ZERO {
            VatPosition::Payable
        } else {
            VatPosition::Refundable
        },
        totals,
    }
}

/// Monthly sales/received totals for the `months` months ending with `end`'s month.
pub fn monthly_series(invoices: &[Invoice], end: NaiveDate, months: u32) -> Vec<MonthlyPoint> {
    let mut buckets: HashMap<(i32, u32), (Decimal, Decimal)> = HashMap::new();
    for invoice in invoices {
        let key = (invoice.issue_date.year(), invoice.issue_date.month());
        let entry = buckets.entry(key).or_insert((Decimal::ZERO, Decimal::ZERO));
        match invoice.kind {
            InvoiceKind::Sale => entry.0 += invoice.amount.value(),
            InvoiceKind::Received => entry.1 += invoice.amount.value(),
        }
    }

    let first_of_month = end.with_day(1).unwrap_or(end);
    (0..months)
        .rev()
        .filter_map(|offset| first_of_month.checked_sub_months(Months::new(offset)))
        .map(|date| {
            let (sales, received) = buckets
                .get(&(date.year(), date.month()))
                .copied()
                .unwrap_or((Decimal::ZERO, Decimal::ZERO));
            MonthlyPoint {
                month: format!("{}-{:02}", date.year(), date.month()),
                sales,
                received,
                net: sales - received,
            }
        })
        .collect()
}
