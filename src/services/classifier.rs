//! Turns raw spreadsheet rows or document text into review candidates by
//! asking a text-completion service.
//!
//! The service is treated as an untrusted oracle: every response is parsed,
//! schema-checked and matched back to the rows it was asked about before a
//! candidate is produced. Nothing is retried here; a failed batch fails the
//! whole classification.

use chrono::NaiveDate;
use jsonschema::JSONSchema;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::models::{CandidateInvoice, InvoiceKind};
use crate::services::openai::CompletionClient;
use crate::services::spreadsheet::SheetRow;
use crate::utils::{normalize_date, parse_decimal};

#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("no API key configured for the classification service")]
    MissingApiKey,
    #[error("classification service unavailable: {0}")]
    Unavailable(String),
    #[error("classification service returned {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("classification service returned an empty response")]
    EmptyResponse,
    #[error("classification response is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("classification response does not match the expected shape: {0}")]
    SchemaMismatch(String),
    #[error("classification response is missing rows {0:?}")]
    MissingRows(Vec<usize>),
    #[error("classification response has unknown or duplicated rows {0:?}")]
    UnexpectedRows(Vec<usize>),
}

const SYSTEM_PROMPT: &str = "You are an expert bookkeeping assistant. Reply with valid JSON only.";

pub struct InvoiceClassifier {
    client: Arc<dyn CompletionClient>,
    api_key: String,
    company_name: String,
    batch_size: usize,
    today: NaiveDate,
}

impl InvoiceClassifier {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        api_key: String,
        company_name: String,
        batch_size: usize,
        today: NaiveDate,
    ) -> Self {
        InvoiceClassifier {
            client,
            api_key,
            company_name,
            batch_size: batch_size.max(1),
            today,
        }
    }

    /// Classifies every row, one bounded batch per call, batches sent one after another.
    pub async fn classify_rows(&self, rows: &[SheetRow]) -> Result<Vec<CandidateInvoice>, ClassificationError> {
        let mut candidates = Vec::with_capacity(rows.len());
        for (batch_number, batch) in rows.chunks(self.batch_size).enumerate() {
            let first_row = batch_number * self.batch_size;
            let indexed: Vec<(usize, &SheetRow)> = batch
                .iter()
                .enumerate()
                .map(|(offset, row)| (first_row + offset, row))
                .collect();

            let prompt = rows_prompt(&self.company_name, &indexed)?;
            let raw = self.client.complete(&self.api_key, SYSTEM_PROMPT, &prompt).await?;
            let expected: Vec<usize> = indexed.iter().map(|(index, _)| *index).collect();
            let batch_candidates = parse_rows_response(&raw, &expected, self.today)?;

            tracing::info!(
                batch = batch_number,
                rows = batch_candidates.len(),
                "Classified spreadsheet batch"
            );
            candidates.extend(batch_candidates);
        }
        Ok(candidates)
    }

    /// Classifies the text of a single invoice document.
    pub async fn classify_document(&self, text: &str) -> Result<CandidateInvoice, ClassificationError> {
        let prompt = document_prompt(&self.company_name, text);
        let raw = self.client.complete(&self.api_key, SYSTEM_PROMPT, &prompt).await?;
        parse_document_response(&raw, self.today)
    }
}

fn rules(company_name: &str) -> String {
    format!(
        r#"The user is the company "{company}".
Rules:
1. "type": if the issuer or counterparty is "{company}" (or a variation of that name) the invoice is a "sale"; otherwise it is "received" (a purchase or expense).
2. "amount": the total monetary value as a number with "." as decimal separator.
3. "provider_customer": the name of the other party.
4. "issue_date": the invoice date as YYYY-MM-DD, or null if there is none."#,
        company = company_name
    )
}

fn rows_prompt(company_name: &str, rows: &[(usize, &SheetRow)]) -> Result<String, ClassificationError> {
    let payload: Vec<Value> = rows
        .iter()
        .map(|(index, row)| json!({ "row": index, "values": row }))
        .collect();
    let data = serde_json::to_string(&payload).map_err(|e| ClassificationError::InvalidJson(e.to_string()))?;

    Ok(format!(
        r#"Analyse these rows of an imported spreadsheet and extract structured invoices.
{rules}
5. "row": copy the "row" number of the input row. Return exactly one object per input row.

Return a JSON object {{"invoices": [...]}} whose items are {{ "row", "type", "amount", "provider_customer", "issue_date" }}.

Data:
{data}"#,
        rules = rules(company_name),
        data = data
    ))
}

fn document_prompt(company_name: &str, text: &str) -> String {
    format!(
        r#"Analyse the following invoice text and extract its data.
{rules}

Return a JSON object {{ "type", "amount", "provider_customer", "issue_date" }}.

Text:
{text}"#,
        rules = rules(company_name),
        text = text
    )
}

fn candidate_schema(require_row: bool) -> Result<JSONSchema, ClassificationError> {
    let mut required = vec!["type", "amount"];
    if require_row {
        required.push("row");
    }
    let schema = json!({
        "type": "object",
        "required": required,
        "properties": {
            "row": {"type": "integer", "minimum": 0},
            "type": {"type": ["string", "null"]},
            "amount": {"type": ["number", "string", "null"]},
            "provider_customer": {"type": ["string", "null"]},
            "issue_date": {"type": ["string", "null"]}
        }
    });

    JSONSchema::compile(&schema).map_err(|e| ClassificationError::SchemaMismatch(format!("schema: {}", e)))
}

fn parse_json(raw: &str) -> Result<Value, ClassificationError> {
    let trimmed = raw.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str::<Value>(unfenced).map_err(|e| ClassificationError::InvalidJson(e.to_string()))
}

/// Models answer with a bare array, `{"invoices": [...]}`, `{"data": [...]}` or a single object.
fn candidate_items(value: Value) -> Result<Vec<Value>, ClassificationError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => {
            for key in ["invoices", "data", "rows"] {
                if let Some(Value::Array(items)) = map.remove(key) {
                    return Ok(items);
                }
            }
            if map.contains_key("type") {
                return Ok(vec![Value::Object(map)]);
            }
            Err(ClassificationError::SchemaMismatch(
                "expected an array of invoices".to_string(),
            ))
        }
        _ => Err(ClassificationError::SchemaMismatch(
            "expected a JSON object or array".to_string(),
        )),
    }
}

fn check_schema(schema: &JSONSchema, item: &Value) -> Result<(), ClassificationError> {
    if let Err(errors) = schema.validate(item) {
        let message = errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
        return Err(ClassificationError::SchemaMismatch(message));
    }
    Ok(())
}

pub(crate) fn parse_rows_response(
    raw: &str,
    expected: &[usize],
    today: NaiveDate,
) -> Result<Vec<CandidateInvoice>, ClassificationError> {
    let schema = candidate_schema(true)?;
    let items = candidate_items(parse_json(raw)?)?;

    let mut by_row: BTreeMap<usize, CandidateInvoice> = BTreeMap::new();
    let mut unexpected = Vec::new();
    for item in &items {
        check_schema(&schema, item)?;
        let row = item["row"].as_u64().ok_or_else(|| {
            ClassificationError::SchemaMismatch(format!("\"row\" must be a whole number, got {}", item["row"]))
        })? as usize;
        if !expected.contains(&row) || by_row.contains_key(&row) {
            unexpected.push(row);
            continue;
        }
        by_row.insert(row, candidate_from(item, row, today));
    }

    if !unexpected.is_empty() {
        return Err(ClassificationError::UnexpectedRows(unexpected));
    }
    let missing: Vec<usize> = expected
        .iter()
        .filter(|row| !by_row.contains_key(row))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(ClassificationError::MissingRows(missing));
    }

    Ok(expected.iter().filter_map(|row| by_row.remove(row)).collect())
}

pub(crate) fn parse_document_response(raw: &str, today: NaiveDate) -> Result<CandidateInvoice, ClassificationError> {
    let schema = candidate_schema(false)?;
    let mut items = candidate_items(parse_json(raw)?)?;
    if items.len() != 1 {
        return Err(ClassificationError::SchemaMismatch(format!(
            "expected one invoice, got {}",
            items.len()
        )));
    }
    let item = items.remove(0);
    check_schema(&schema, &item)?;
    Ok(candidate_from(&item, 0, today))
}

fn candidate_from(item: &Value, row: usize, today: NaiveDate) -> CandidateInvoice {
    let kind = match item["type"].as_str() {
        Some(raw) => InvoiceKind::from_str(raw)
            .map(|kind| kind.as_str().to_string())
            .unwrap_or_else(|_| raw.trim().to_string()),
        None => String::new(),
    };

    let amount = match &item["amount"] {
        Value::Number(number) => Decimal::from_str(&number.to_string())
            .map(|value| value.normalize().to_string())
            .unwrap_or_else(|_| number.to_string()),
        Value::String(raw) => parse_decimal(raw)
            .map(|value| value.to_string())
            .unwrap_or_else(|_| raw.trim().to_string()),
        _ => String::new(),
    };

    let counterparty = item["provider_customer"]
        .as_str()
        .or_else(|| item["counterparty"].as_str())
        .unwrap_or_default()
        .trim()
        .to_string();

    CandidateInvoice {
        row,
        kind,
        amount,
        counterparty,
        issue_date: normalize_date(item["issue_date"].as_str(), today),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, 1).unwrap()
    }

    struct ScriptedClient {
        replies: Mutex<Vec<String>>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<&str>) -> Self {
            ScriptedClient {
                replies: Mutex::new(replies.into_iter().rev().map(String::from).collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(&self, _api_key: &str, _system: &str, user: &str) -> Result<String, ClassificationError> {
            self.prompts.lock().unwrap().push(user.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop()
                .ok_or(ClassificationError::EmptyResponse)
        }
    }

    fn sheet_row(pairs: &[(&str, &str)]) -> SheetRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn rows_are_matched_by_index_not_position() {
        let raw = r#"{"invoices": [
            {"row": 1, "type": "received", "amount": 60.5, "provider_customer": "Proveedor", "issue_date": "2024-01-06"},
            {"row": 0, "type": "sale", "amount": "121,00", "provider_customer": "Cliente", "issue_date": "05/01/2024"}
        ]}"#;
        let candidates = parse_rows_response(raw, &[0, 1], today()).unwrap();

        assert_eq!(candidates[0].row, 0);
        assert_eq!(candidates[0].kind, "sale");
        assert_eq!(candidates[0].amount, "121.00");
        assert_eq!(candidates[0].issue_date, "2024-01-05");
        assert_eq!(candidates[1].counterparty, "Proveedor");
        assert_eq!(candidates[1].amount, "60.5");
    }

    #[test]
    fn bare_arrays_and_spanish_kinds_are_accepted() {
        let raw = r#"[{"row": 3, "type": "venta", "amount": 10, "provider_customer": "X", "issue_date": null}]"#;
        let candidates = parse_rows_response(raw, &[3], today()).unwrap();
        assert_eq!(candidates[0].kind, "sale");
        assert_eq!(candidates[0].issue_date, "2024-07-01");
    }

    #[test]
    fn missing_rows_fail_the_batch() {
        let raw = r#"{"invoices": [{"row": 0, "type": "sale", "amount": 1}]}"#;
        let err = parse_rows_response(raw, &[0, 1], today()).unwrap_err();
        assert!(matches!(err, ClassificationError::MissingRows(rows) if rows == vec![1]));
    }

    #[test]
    fn duplicated_or_unknown_rows_fail_the_batch() {
        let raw = r#"[{"row": 0, "type": "sale", "amount": 1}, {"row": 0, "type": "sale", "amount": 2}]"#;
        assert!(matches!(
            parse_rows_response(raw, &[0], today()),
            Err(ClassificationError::UnexpectedRows(_))
        ));

        let raw = r#"[{"row": 9, "type": "sale", "amount": 1}]"#;
        assert!(matches!(
            parse_rows_response(raw, &[0], today()),
            Err(ClassificationError::UnexpectedRows(_))
        ));
    }

    #[test]
    fn malformed_responses_are_classification_errors() {
        assert!(matches!(
            parse_rows_response("not json", &[0], today()),
            Err(ClassificationError::InvalidJson(_))
        ));
        assert!(matches!(
            parse_rows_response(r#"{"invoices": [{"row": 0, "type": "sale", "amount": true}]}"#, &[0], today()),
            Err(ClassificationError::SchemaMismatch(_))
        ));
        assert!(matches!(
            parse_rows_response(r#"{"answer": 42}"#, &[0], today()),
            Err(ClassificationError::SchemaMismatch(_))
        ));
    }

    #[test]
    fn fractional_row_numbers_are_rejected() {
        let raw = r#"[{"row": 1.0, "type": "sale", "amount": 1}]"#;
        let err = parse_rows_response(raw, &[0, 1], today()).unwrap_err();
        assert!(matches!(err, ClassificationError::SchemaMismatch(message) if message.contains("row")));
    }

    #[test]
    fn document_response_accepts_fenced_json() {
        let raw = "```json\n{\"type\": \"recibida\", \"amount\": 242.0, \"provider_customer\": \"Luz SA\", \"issue_date\": \"2024-02-01\"}\n```";
        let candidate = parse_document_response(raw, today()).unwrap();
        assert_eq!(candidate.kind, "received");
        assert_eq!(candidate.amount, "242");
        assert_eq!(candidate.counterparty, "Luz SA");
    }

    #[tokio::test]
    async fn classify_rows_sends_bounded_sequential_batches() {
        let client = Arc::new(ScriptedClient::new(vec![
            r#"[{"row": 1, "type": "sale", "amount": 2}, {"row": 0, "type": "sale", "amount": 1}]"#,
            r#"[{"row": 2, "type": "received", "amount": 3}]"#,
        ]));
        let classifier = InvoiceClassifier::new(client.clone(), "key".into(), "Estil".into(), 2, today());
        let rows = vec![
            sheet_row(&[("Importe", "1")]),
            sheet_row(&[("Importe", "2")]),
            sheet_row(&[("Importe", "3")]),
        ];

        let candidates = classifier.classify_rows(&rows).await.unwrap();

        let amounts: Vec<&str> = candidates.iter().map(|c| c.amount.as_str()).collect();
        assert_eq!(amounts, vec!["1", "2", "3"]);
        let prompts = client.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].contains("\"Estil\""));
        assert!(prompts[1].contains("\"row\":2"));
    }

    #[tokio::test]
    async fn classify_rows_stops_at_the_first_failed_batch() {
        let client = Arc::new(ScriptedClient::new(vec!["garbage"]));
        let classifier = InvoiceClassifier::new(client.clone(), "key".into(), "Estil".into(), 1, today());
        let rows = vec![sheet_row(&[("a", "1")]), sheet_row(&[("a", "2")])];

        assert!(classifier.classify_rows(&rows).await.is_err());
        assert_eq!(client.prompts.lock().unwrap().len(), 1);
    }
}
