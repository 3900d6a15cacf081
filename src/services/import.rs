//! Import session: the staged path from an uploaded spreadsheet to stored invoices.
//!
//! ```text
//! Idle -> Parsed -> Classifying -> Reviewing -> Saving -> Done
//!                        |                        |
//!                        +--------> Error <-------+
//! ```
//!
//! A parse failure never produces a session. `Error` is terminal: the user
//! starts over with a new upload.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Amount, CandidateInvoice, CandidatePatch, InvoiceKind, NewInvoice};
use crate::services::spreadsheet::{ParsedSheet, SheetRow};
use crate::utils::parse_decimal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Idle,
    Parsed,
    Classifying,
    Reviewing,
    Saving,
    Done,
    Error,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImportStateError {
    #[error("cannot {action} while the import is {status:?}")]
    InvalidTransition { action: &'static str, status: ImportStatus },
    #[error("no candidate at index {0}")]
    NoSuchCandidate(usize),
}

#[derive(Debug, Clone, Serialize)]
pub struct RowProblem {
    pub index: usize,
    pub row: usize,
    pub problems: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ImportSession {
    pub id: Uuid,
    pub owner: String,
    pub file_name: String,
    pub status: ImportStatus,
    pub headers: Vec<String>,
    pub rows: Vec<SheetRow>,
    pub candidates: Vec<CandidateInvoice>,
    pub error: Option<String>,
    pub inserted: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a client sees of a session; raw rows are summarized, not echoed back.
#[derive(Debug, Clone, Serialize)]
pub struct ImportSessionView {
    pub id: Uuid,
    pub file_name: String,
    pub status: ImportStatus,
    pub headers: Vec<String>,
    pub row_count: usize,
    pub candidates: Vec<CandidateInvoice>,
    pub problems: Vec<RowProblem>,
    pub error: Option<String>,
    pub inserted: usize,
    pub created_at: DateTime<Utc>,
}

impl ImportSession {
    pub fn new(owner: &str, file_name: &str) -> Self {
        let now = Utc::now();
        ImportSession {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            file_name: file_name.to_string(),
            status: ImportStatus::Idle,
            headers: Vec::new(),
            rows: Vec::new(),
            candidates: Vec::new(),
            error: None,
            inserted: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn load(&mut self, sheet: ParsedSheet) -> Result<(), ImportStateError> {
        self.require(ImportStatus::Idle, "load a file")?;
        self.headers = sheet.headers;
        self.rows = sheet.rows;
        self.status = ImportStatus::Parsed;
        Ok(())
    }

    /// Moves to `Classifying` and hands back the rows to send out.
    pub fn begin_classification(&mut self) -> Result<Vec<SheetRow>, ImportStateError> {
        self.require(ImportStatus::Parsed, "classify")?;
        self.status = ImportStatus::Classifying;
        Ok(self.rows.clone())
    }

    pub fn finish_classification<E: ToString>(
        &mut self,
        outcome: Result<Vec<CandidateInvoice>, E>,
    ) -> Result<(), ImportStateError> {
        self.require(ImportStatus::Classifying, "finish classification")?;
        match outcome {
            Ok(candidates) => {
                self.candidates = candidates;
                self.status = ImportStatus::Reviewing;
            }
            Err(err) => self.fail(err.to_string()),
        }
        Ok(())
    }

    pub fn update_candidate(&mut self, index: usize, patch: CandidatePatch) -> Result<&CandidateInvoice, ImportStateError> {
        self.require(ImportStatus::Reviewing, "edit candidates")?;
        let candidate = self
            .candidates
            .get_mut(index)
            .ok_or(ImportStateError::NoSuchCandidate(index))?;
        if let Some(kind) = patch.kind {
            candidate.kind = kind;
        }
        if let Some(amount) = patch.amount {
            candidate.amount = amount;
        }
        if let Some(counterparty) = patch.counterparty {
            candidate.counterparty = counterparty;
        }
        if let Some(issue_date) = patch.issue_date {
            candidate.issue_date = issue_date;
        }
        Ok(candidate)
    }

    pub fn remove_candidate(&mut self, index: usize) -> Result<CandidateInvoice, ImportStateError> {
        self.require(ImportStatus::Reviewing, "remove candidates")?;
        if index >= self.candidates.len() {
            return Err(ImportStateError::NoSuchCandidate(index));
        }
        Ok(self.candidates.remove(index))
    }

    /// Every candidate that would not pass validation, with the reasons.
    pub fn problems(&self) -> Vec<RowProblem> {
        self.candidates
            .iter()
            .enumerate()
            .filter_map(|(index, candidate)| {
                validate_candidate(candidate).err().map(|problems| RowProblem {
                    index,
                    row: candidate.row,
                    problems,
                })
            })
            .collect()
    }

    /// Validates all candidates and moves to `Saving`.
    ///
    /// On validation failure the session stays in `Reviewing` and the
    /// offending rows are returned so they can be fixed.
    pub fn begin_save(&mut self) -> Result<Result<Vec<NewInvoice>, Vec<RowProblem>>, ImportStateError> {
        self.require(ImportStatus::Reviewing, "save")?;
        let problems = self.problems();
        if !problems.is_empty() {
            return Ok(Err(problems));
        }
        let invoices = self
            .candidates
            .iter()
            .filter_map(|candidate| validate_candidate(candidate).ok())
            .collect();
        self.status = ImportStatus::Saving;
        Ok(Ok(invoices))
    }

    pub fn finish_save<E: ToString>(&mut self, outcome: Result<usize, E>) -> Result<(), ImportStateError> {
        self.require(ImportStatus::Saving, "finish saving")?;
        match outcome {
            Ok(inserted) => {
                self.inserted = inserted;
                self.status = ImportStatus::Done;
            }
            Err(err) => self.fail(err.to_string()),
        }
        Ok(())
    }

    /// A call to the completion service or the store is outstanding.
    pub fn is_in_flight(&self) -> bool {
        matches!(self.status, ImportStatus::Classifying | ImportStatus::Saving)
    }

    pub fn view(&self) -> ImportSessionView {
        ImportSessionView {
            id: self.id,
            file_name: self.file_name.clone(),
            status: self.status,
            headers: self.headers.clone(),
            row_count: self.rows.len(),
            candidates: self.candidates.clone(),
            problems: if self.status == ImportStatus::Reviewing {
                self.problems()
            } else {
                Vec::new()
            },
            error: self.error.clone(),
            inserted: self.inserted,
            created_at: self.created_at,
        }
    }

    fn fail(&mut self, message: String) {
        self.error = Some(message);
        self.status = ImportStatus::Error;
    }

    fn require(&self, status: ImportStatus, action: &'static str) -> Result<(), ImportStateError> {
        if self.status != status {
            return Err(ImportStateError::InvalidTransition {
                action,
                status: self.status,
            });
        }
        Ok(())
    }
}

/// Type-checks a reviewed candidate into an insertable invoice.
pub fn validate_candidate(candidate: &CandidateInvoice) -> Result<NewInvoice, Vec<String>> {
    let mut problems = Vec::new();

    let kind = InvoiceKind::from_str(&candidate.kind)
        .map_err(|_| problems.push(format!("type must be 'sale' or 'received', got '{}'", candidate.kind)))
        .ok();

    let amount = match parse_decimal(&candidate.amount) {
        Ok(value) => Amount::new(value).map_err(|e| problems.push(e.to_string())).ok(),
        Err(_) => {
            problems.push(format!("amount '{}' is not a number", candidate.amount));
            None
        }
    };

    let issue_date = NaiveDate::parse_from_str(candidate.issue_date.trim(), "%Y-%m-%d")
        .map_err(|_| problems.push(format!("issue date '{}' is not YYYY-MM-DD", candidate.issue_date)))
        .ok();

    let counterparty = candidate.counterparty.trim();
    if counterparty.is_empty() {
        problems.push("counterparty is empty".to_string());
    }

    match (kind, amount, issue_date) {
        (Some(kind), Some(amount), Some(issue_date)) if problems.is_empty() => Ok(NewInvoice {
            kind,
            amount,
            counterparty: counterparty.to_string(),
            issue_date,
            document_ref: None,
            is_manual: false,
        }),
        _ => Err(problems),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::Value;

    fn sheet(rows: usize) -> ParsedSheet {
        ParsedSheet {
            headers: vec!["Importe".to_string()],
            rows: (0..rows)
                .map(|i| {
                    let mut row = SheetRow::new();
                    row.insert("Importe".to_string(), Value::String(i.to_string()));
                    row
                })
                .collect(),
        }
    }

    fn candidate(row: usize, kind: &str, amount: &str) -> CandidateInvoice {
        CandidateInvoice {
            row,
            kind: kind.to_string(),
            amount: amount.to_string(),
            counterparty: "Proveedor SL".to_string(),
            issue_date: "2024-01-05".to_string(),
        }
    }

    fn reviewing(candidates: Vec<CandidateInvoice>) -> ImportSession {
        let mut session = ImportSession::new("alice", "book.csv");
        session.load(sheet(candidates.len())).unwrap();
        session.begin_classification().unwrap();
        session.finish_classification::<String>(Ok(candidates)).unwrap();
        session
    }

    #[test]
    fn happy_path_reaches_done() {
        let mut session = reviewing(vec![candidate(0, "sale", "121"), candidate(1, "received", "60,50")]);
        assert_eq!(session.status, ImportStatus::Reviewing);

        let invoices = session.begin_save().unwrap().unwrap();
        assert_eq!(session.status, ImportStatus::Saving);
        assert_eq!(invoices.len(), 2);
        assert_eq!(invoices[1].amount.value(), dec!(60.50));
        assert!(!invoices[0].is_manual);

        session.finish_save::<String>(Ok(2)).unwrap();
        assert_eq!(session.status, ImportStatus::Done);
        assert_eq!(session.view().inserted, 2);
    }

    #[test]
    fn classification_failure_is_terminal() {
        let mut session = ImportSession::new("alice", "book.csv");
        session.load(sheet(1)).unwrap();
        session.begin_classification().unwrap();
        session.finish_classification::<&str>(Err("service down")).unwrap();

        assert_eq!(session.status, ImportStatus::Error);
        assert_eq!(session.error.as_deref(), Some("service down"));
        assert!(session.begin_classification().is_err());
        assert!(session.begin_save().is_err());
    }

    #[test]
    fn cannot_classify_twice_concurrently() {
        let mut session = ImportSession::new("alice", "book.csv");
        session.load(sheet(1)).unwrap();
        session.begin_classification().unwrap();
        let err = session.begin_classification().unwrap_err();
        assert_eq!(
            err,
            ImportStateError::InvalidTransition {
                action: "classify",
                status: ImportStatus::Classifying
            }
        );
    }

    #[test]
    fn invalid_candidates_block_saving_until_fixed() {
        let mut session = reviewing(vec![candidate(0, "refund", "abc"), candidate(1, "sale", "-5")]);

        let problems = session.begin_save().unwrap().unwrap_err();
        assert_eq!(problems.len(), 2);
        assert_eq!(problems[0].problems.len(), 2);
        assert_eq!(session.status, ImportStatus::Reviewing);

        session
            .update_candidate(
                0,
                CandidatePatch {
                    kind: Some("received".to_string()),
                    amount: Some("10".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        session.remove_candidate(1).unwrap();

        let invoices = session.begin_save().unwrap().unwrap();
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].kind, InvoiceKind::Received);
    }

    #[test]
    fn cannot_save_twice_concurrently() {
        let mut session = reviewing(vec![candidate(0, "sale", "1")]);
        session.begin_save().unwrap().unwrap();
        assert!(session.is_in_flight());

        assert_eq!(
            session.begin_save().unwrap_err(),
            ImportStateError::InvalidTransition {
                action: "save",
                status: ImportStatus::Saving
            }
        );
    }

    #[test]
    fn save_failure_is_terminal() {
        let mut session = reviewing(vec![candidate(0, "sale", "1")]);
        session.begin_save().unwrap().unwrap();
        session.finish_save::<&str>(Err("constraint failed")).unwrap();

        assert_eq!(session.status, ImportStatus::Error);
        assert!(session.update_candidate(0, CandidatePatch::default()).is_err());
    }

    #[test]
    fn editing_out_of_range_is_rejected() {
        let mut session = reviewing(vec![candidate(0, "sale", "1")]);
        assert_eq!(
            session.remove_candidate(5).unwrap_err(),
            ImportStateError::NoSuchCandidate(5)
        );
    }

    #[test]
    fn validation_rejects_malformed_dates() {
        let mut bad = candidate(0, "sale", "1");
        bad.issue_date = "05/01/2024".to_string();
        let problems = validate_candidate(&bad).unwrap_err();
        assert!(problems[0].contains("YYYY-MM-DD"));
    }
}
