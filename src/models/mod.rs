use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
    #[error("amount must not be negative: {0}")]
    Negative(Decimal),
    #[error("invalid amount: {0}")]
    Invalid(String),
}

/// A non-negative money amount in exact decimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    pub fn new(value: Decimal) -> Result<Self, AmountError> {
        if value.is_sign_negative() {
            if !value.is_zero() {
                return Err(AmountError::Negative(value));
            }
            // -0.00 compares equal to 0.00 but prints with a sign
            return Ok(Amount(Decimal::new(0, value.scale())));
        }
        Ok(Amount(value))
    }

    pub fn value(self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = AmountError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Amount::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str(s.trim()).map_err(|_| AmountError::Invalid(s.to_string()))?;
        Amount::new(value)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceKind {
    #[serde(alias = "venta")]
    Sale,
    #[serde(alias = "recibida")]
    Received,
}

impl InvoiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceKind::Sale => "sale",
            InvoiceKind::Received => "received",
        }
    }
}

impl FromStr for InvoiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sale" | "venta" => Ok(InvoiceKind::Sale),
            "received" | "recibida" | "purchase" | "compra" => Ok(InvoiceKind::Received),
            other => Err(format!("unknown invoice kind '{}'", other)),
        }
    }
}

impl fmt::Display for InvoiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub owner: String,
    pub kind: InvoiceKind,
    pub amount: Amount,
    pub counterparty: String,
    pub issue_date: NaiveDate,
    pub document_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_manual: bool,
}

/// An invoice ready to be inserted; owner and timestamps are assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInvoice {
    pub kind: InvoiceKind,
    pub amount: Amount,
    pub counterparty: String,
    pub issue_date: NaiveDate,
    #[serde(default)]
    pub document_ref: Option<String>,
    #[serde(default = "default_manual")]
    pub is_manual: bool,
}

fn default_manual() -> bool {
    true
}

impl NewInvoice {
    pub fn validate(&self) -> Result<(), String> {
        if self.counterparty.trim().is_empty() {
            return Err("counterparty must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseCategory {
    #[serde(alias = "Alquiler")]
    Rent,
    #[serde(alias = "Luz")]
    Electricity,
    #[serde(alias = "Agua")]
    Water,
    #[serde(alias = "Gas")]
    Gas,
    #[serde(alias = "Internet")]
    Internet,
    #[serde(alias = "Teléfono")]
    Phone,
    #[serde(alias = "Salarios")]
    Salaries,
    #[serde(alias = "Seguros")]
    Insurance,
    #[serde(alias = "Impuestos")]
    Taxes,
    #[serde(alias = "Software")]
    Software,
    #[serde(alias = "Marketing")]
    Marketing,
    #[serde(alias = "Otros")]
    Other,
}

impl ExpenseCategory {
    pub const ALL: [ExpenseCategory; 12] = [
        ExpenseCategory::Rent,
        ExpenseCategory::Electricity,
        ExpenseCategory::Water,
        ExpenseCategory::Gas,
        ExpenseCategory::Internet,
        ExpenseCategory::Phone,
        ExpenseCategory::Salaries,
        ExpenseCategory::Insurance,
        ExpenseCategory::Taxes,
        ExpenseCategory::Software,
        ExpenseCategory::Marketing,
        ExpenseCategory::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExpenseCategory::Rent => "rent",
            ExpenseCategory::Electricity => "electricity",
            ExpenseCategory::Water => "water",
            ExpenseCategory::Gas => "gas",
            ExpenseCategory::Internet => "internet",
            ExpenseCategory::Phone => "phone",
            ExpenseCategory::Salaries => "salaries",
            ExpenseCategory::Insurance => "insurance",
            ExpenseCategory::Taxes => "taxes",
            ExpenseCategory::Software => "software",
            ExpenseCategory::Marketing => "marketing",
            ExpenseCategory::Other => "other",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExpenseCategory::Rent => "Alquiler",
            ExpenseCategory::Electricity => "Luz",
            ExpenseCategory::Water => "Agua",
            ExpenseCategory::Gas => "Gas",
            ExpenseCategory::Internet => "Internet",
            ExpenseCategory::Phone => "Teléfono",
            ExpenseCategory::Salaries => "Salarios",
            ExpenseCategory::Insurance => "Seguros",
            ExpenseCategory::Taxes => "Impuestos",
            ExpenseCategory::Software => "Software",
            ExpenseCategory::Marketing => "Marketing",
            ExpenseCategory::Other => "Otros",
        }
    }
}

impl FromStr for ExpenseCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ExpenseCategory::ALL
            .iter()
            .find(|c| c.as_str() == s || c.label() == s)
            .copied()
            .ok_or_else(|| format!("unknown expense category '{}'", s))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixedCost {
    pub id: Uuid,
    pub owner: String,
    pub category: ExpenseCategory,
    pub monthly_amount: Amount,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFixedCost {
    pub category: ExpenseCategory,
    pub monthly_amount: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryInfo {
    pub id: ExpenseCategory,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub company_name: String,
    pub openai_api_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            company_name: "Mi Empresa".to_string(),
            openai_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsView {
    pub company_name: String,
    pub has_api_key: bool,
}

/// One classified row awaiting human review.
///
/// Fields stay as loosely-typed text until commit, so a reviewer can fix
/// anything the classifier got wrong before validation runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateInvoice {
    pub row: usize,
    pub kind: String,
    pub amount: String,
    pub counterparty: String,
    pub issue_date: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CandidatePatch {
    pub kind: Option<String>,
    pub amount: Option<String>,
    pub counterparty: Option<String>,
    pub issue_date: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatSplit {
    pub base: Decimal,
    pub vat: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatBalance {
    pub sales_vat: Decimal,
    pub purchase_vat: Decimal,
    pub balance: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakevenStatus {
    Deficit,
    Surplus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakevenReport {
    pub total_sales: Decimal,
    pub total_received: Decimal,
    pub total_fixed_costs: Decimal,
    pub total_costs: Decimal,
    pub breakeven: Decimal,
    pub status: BreakevenStatus,
    pub coverage_percent: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VatLine {
    pub invoice_id: Uuid,
    pub issue_date: NaiveDate,
    pub counterparty: String,
    pub kind: InvoiceKind,
    pub base: Decimal,
    pub vat: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VatPosition {
    Payable,
    Refundable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VatReport {
    pub rate: Decimal,
    pub lines: Vec<VatLine>,
    pub totals: VatBalance,
    pub position: VatPosition,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyPoint {
    pub month: String,
    pub sales: Decimal,
    pub received: Decimal,
    pub net: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardStats {
    pub total_sales: Decimal,
    pub total_received: Decimal,
    pub total_fixed_costs: Decimal,
    pub breakeven: Decimal,
    pub coverage_percent: Decimal,
    pub recent_invoices: Vec<Invoice>,
    pub chart: Vec<MonthlyPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingLog {
    pub id: Uuid,
    pub process_type: String,
    pub status: String,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedInvoice {
    pub candidate: CandidateInvoice,
    pub document_ref: String,
    pub text_length: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn amount_rejects_negative_values() {
        assert_eq!(Amount::new(dec!(-0.01)), Err(AmountError::Negative(dec!(-0.01))));
        assert!(Amount::new(dec!(0)).is_ok());
        assert!("-5".parse::<Amount>().is_err());
        assert!("abc".parse::<Amount>().is_err());
    }

    #[test]
    fn amount_deserializes_from_string_and_number() {
        let from_str: Amount = serde_json::from_str("\"121.50\"").unwrap();
        let from_num: Amount = serde_json::from_str("121.5").unwrap();
        assert_eq!(from_str.value(), dec!(121.50));
        assert_eq!(from_num.value(), dec!(121.5));
        assert!(serde_json::from_str::<Amount>("\"-3\"").is_err());
    }

    #[test]
    fn invoice_kind_accepts_spanish_aliases() {
        assert_eq!("venta".parse::<InvoiceKind>().unwrap(), InvoiceKind::Sale);
        assert_eq!(" Recibida ".parse::<InvoiceKind>().unwrap(), InvoiceKind::Received);
        let kind: InvoiceKind = serde_json::from_str("\"recibida\"").unwrap();
        assert_eq!(kind, InvoiceKind::Received);
        assert!("refund".parse::<InvoiceKind>().is_err());
    }

    #[test]
    fn expense_category_parses_ids_and_labels() {
        assert_eq!("rent".parse::<ExpenseCategory>().unwrap(), ExpenseCategory::Rent);
        assert_eq!("Teléfono".parse::<ExpenseCategory>().unwrap(), ExpenseCategory::Phone);
        let cat: ExpenseCategory = serde_json::from_str("\"Seguros\"").unwrap();
        assert_eq!(cat, ExpenseCategory::Insurance);
    }
}
