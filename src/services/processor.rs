use anyhow::anyhow;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::ExtractedInvoice;
use crate::services::classifier::InvoiceClassifier;
use crate::services::import::{ImportSession, ImportSessionView};
use crate::services::spreadsheet::{is_spreadsheet, parse_spreadsheet, ParseError, SheetRow};
use crate::services::state::{run_blocking, AppState};
use crate::services::text_extraction::TextExtractor;
use crate::utils::sha256_bytes;

/// Parses an uploaded spreadsheet into a fresh session in `Parsed`.
pub fn start_import(
    state: &AppState,
    owner: &str,
    file_name: &str,
    bytes: &[u8],
) -> Result<ImportSessionView, AppError> {
    if !is_spreadsheet(file_name) {
        return Err(ParseError::UnsupportedFormat(file_name.to_string()).into());
    }
    let sheet = parse_spreadsheet(file_name, bytes)?;

    let mut session = ImportSession::new(owner, file_name);
    session.load(sheet)?;
    let view = session.view();
    state.insert_session(session)?;

    tracing::info!(
        owner,
        session_id = %view.id,
        rows = view.row_count,
        "Parsed import file"
    );
    Ok(view)
}

/// Sends the session's rows out for classification and stages the result for review.
///
/// The call runs on its own task: a client that goes away abandons the
/// request without cancelling it, and the session still reaches `Reviewing`
/// or `Error`. The `Classifying` state keeps a second request from starting meanwhile.
pub async fn classify_import(state: &AppState, owner: &str, id: Uuid) -> Result<ImportSessionView, AppError> {
    let classifier = state.classifier_for(owner).await?;
    let rows = state.with_session(owner, id, |session| Ok(session.begin_classification()?))?;

    let task = tokio::spawn(run_classification(state.clone(), owner.to_string(), id, classifier, rows));
    match task.await {
        Ok(result) => result,
        Err(join_err) => {
            let message = format!("classification task failed: {}", join_err);
            tracing::error!(owner, session_id = %id, error = %message, "Import classification aborted");
            if let Err(err) = state.with_session(owner, id, |session| Ok(session.finish_classification(Err(&message))?)) {
                tracing::warn!(owner, session_id = %id, error = %err, "Could not close aborted session");
            }
            Err(AppError::Internal(anyhow!(message)))
        }
    }
}

async fn run_classification(
    state: AppState,
    owner: String,
    id: Uuid,
    classifier: InvoiceClassifier,
    rows: Vec<SheetRow>,
) -> Result<ImportSessionView, AppError> {
    let outcome = classifier.classify_rows(&rows).await;
    match &outcome {
        Ok(candidates) => {
            tracing::info!(owner = %owner, session_id = %id, candidates = candidates.len(), "Import classified")
        }
        Err(err) => tracing::warn!(owner = %owner, session_id = %id, error = %err, "Import classification failed"),
    }

    let view = state.with_session(&owner, id, |session| {
        session.finish_classification(outcome.as_ref().cloned().map_err(|e| e.to_string()))?;
        Ok(session.view())
    })?;
    record_processing(&state, &owner, "classify", &outcome);

    match outcome {
        Ok(_) => Ok(view),
        Err(err) => Err(err.into()),
    }
}

/// Validates the reviewed candidates and inserts them in one transaction.
pub fn commit_import(state: &AppState, owner: &str, id: Uuid) -> Result<ImportSessionView, AppError> {
    let invoices = state.with_session(owner, id, |session| match session.begin_save()? {
        Ok(invoices) => Ok(invoices),
        Err(problems) => {
            let rows: Vec<String> = problems
                .iter()
                .map(|p| format!("row {}: {}", p.row, p.problems.join(", ")))
                .collect();
            Err(AppError::Validation(rows.join("; ")))
        }
    })?;

    let outcome = state
        .db()
        .and_then(|mut db| db.insert_invoices(owner, &invoices).map_err(AppError::from));
    match &outcome {
        Ok(inserted) => tracing::info!(owner, session_id = %id, inserted = inserted.len(), "Import committed"),
        Err(err) => tracing::error!(owner, session_id = %id, error = %err, "Import commit failed"),
    }

    let view = state.with_session(owner, id, |session| {
        session.finish_save(outcome.as_ref().map(|rows| rows.len()).map_err(|e| e.to_string()))?;
        Ok(session.view())
    })?;
    record_processing(state, owner, "commit", &outcome);

    outcome.map(|_| view)
}

/// Extracts a review candidate from a single PDF invoice. Nothing is stored
/// except the processing log entry.
pub async fn extract_document(
    state: &AppState,
    owner: &str,
    file_name: &str,
    bytes: &[u8],
) -> Result<ExtractedInvoice, AppError> {
    if !TextExtractor::is_pdf(file_name) {
        return Err(ParseError::UnsupportedFormat(file_name.to_string()).into());
    }
    let document_ref = format!("sha256:{}", sha256_bytes(bytes));
    let limit = state.config.document_text_limit;
    let pdf = bytes.to_vec();
    let text = run_blocking(move || TextExtractor::extract_from_pdf(&pdf, limit)).await??;
    let text_length = text.chars().count();
    tracing::info!(owner, document = %document_ref, chars = text_length, "Extracted PDF text");

    let classifier = state.classifier_for(owner).await?;
    let outcome = classifier.classify_document(&text).await;
    record_processing(state, owner, "extract", &outcome);

    Ok(ExtractedInvoice {
        candidate: outcome?,
        document_ref,
        text_length,
    })
}

/// Writes the activity entry for a finished step. A failure here is logged
/// and swallowed; the step's own outcome stands.
fn record_processing<T, E: ToString>(state: &AppState, owner: &str, process_type: &str, outcome: &Result<T, E>) {
    let (status, message) = match outcome {
        Ok(_) => ("success", None),
        Err(err) => ("failed", Some(err.to_string())),
    };
    let logged = state
        .db()
        .and_then(|db| db.log_processing(owner, process_type, status, message.as_deref()).map_err(AppError::from));
    if let Err(err) = logged {
        tracing::warn!(owner, process_type, error = %err, "Could not record processing log");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::db::Database;
    use crate::services::classifier::ClassificationError;
    use crate::services::import::ImportStatus;
    use crate::services::openai::CompletionClient;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    const TWO_ROWS: &[u8] = b"Fecha;Cliente;Importe\n2024-03-01;Acme;121,00\n2024-03-02;Papeleria;60,50\n";

    /// Answers every request after `delay`.
    struct SlowClient {
        delay: Duration,
    }

    #[async_trait]
    impl CompletionClient for SlowClient {
        async fn complete(&self, _api_key: &str, _system: &str, _user: &str) -> Result<String, ClassificationError> {
            tokio::time::sleep(self.delay).await;
            Ok(r#"{"invoices": [
                {"row": 0, "type": "sale", "amount": "121.00", "provider_customer": "Acme", "issue_date": "2024-03-01"},
                {"row": 1, "type": "received", "amount": "60.50", "provider_customer": "Papeleria", "issue_date": "2024-03-02"}
            ]}"#
            .to_string())
        }
    }

    fn state(delay: Duration) -> AppState {
        let mut config = AppConfig::default();
        config.openai.api_key = Some("sk-test".to_string());
        AppState::new(Database::open_in_memory().unwrap(), config, Arc::new(SlowClient { delay }))
    }

    fn status(state: &AppState, id: Uuid) -> ImportStatus {
        state.with_session("alice", id, |s| Ok(s.view().status)).unwrap()
    }

    #[tokio::test]
    async fn abandoned_classification_still_reaches_review() {
        let state = state(Duration::from_millis(100));
        let id = start_import(&state, "alice", "book.csv", TWO_ROWS).unwrap().id;

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), classify_import(&state, "alice", id)).await;
        assert!(abandoned.is_err());
        assert_eq!(status(&state, id), ImportStatus::Classifying);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(status(&state, id), ImportStatus::Reviewing);
        let view = state.with_session("alice", id, |s| Ok(s.view())).unwrap();
        assert_eq!(view.candidates.len(), 2);
    }

    #[tokio::test]
    async fn commit_succeeds_when_the_activity_log_cannot_be_written() {
        let state = state(Duration::ZERO);
        let id = start_import(&state, "alice", "book.csv", TWO_ROWS).unwrap().id;
        classify_import(&state, "alice", id).await.unwrap();

        state.db().unwrap().execute_batch("DROP TABLE processing_logs").unwrap();

        let view = commit_import(&state, "alice", id).unwrap();
        assert_eq!(view.status, ImportStatus::Done);
        assert_eq!(state.db().unwrap().get_invoices("alice", None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn classification_outcome_stands_when_the_activity_log_cannot_be_written() {
        let state = state(Duration::ZERO);
        let id = start_import(&state, "alice", "book.csv", TWO_ROWS).unwrap().id;
        state.db().unwrap().execute_batch("DROP TABLE processing_logs").unwrap();

        let view = classify_import(&state, "alice", id).await.unwrap();
        assert_eq!(view.status, ImportStatus::Reviewing);
    }
}
