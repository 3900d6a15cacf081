use anyhow::anyhow;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::db::Database;
use crate::error::AppError;
use crate::models::Settings;
use crate::services::classifier::{ClassificationError, InvoiceClassifier};
use crate::services::crypto::CryptoService;
use crate::services::import::ImportSession;
use crate::services::openai::CompletionClient;
use crate::utils::today;

const COMPANY_NAME_KEY: &str = "company_name";
const API_KEY_KEY: &str = "openai_api_key";

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Database>>,
    pub config: Arc<AppConfig>,
    pub completion: Arc<dyn CompletionClient>,
    pub crypto: Arc<CryptoService>,
    imports: Arc<Mutex<HashMap<Uuid, ImportSession>>>,
}

impl AppState {
    pub fn new(db: Database, config: AppConfig, completion: Arc<dyn CompletionClient>) -> Self {
        let crypto = CryptoService::new(&config.settings_secret);
        AppState {
            db: Arc::new(Mutex::new(db)),
            config: Arc::new(config),
            completion,
            crypto: Arc::new(crypto),
            imports: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn db(&self) -> Result<MutexGuard<'_, Database>, AppError> {
        self.db
            .lock()
            .map_err(|_| AppError::Internal(anyhow!("DB lock poisoned")))
    }

    fn imports(&self) -> Result<MutexGuard<'_, HashMap<Uuid, ImportSession>>, AppError> {
        self.imports
            .lock()
            .map_err(|_| AppError::Internal(anyhow!("Import sessions lock poisoned")))
    }

    pub fn load_settings(&self, owner: &str) -> Result<Settings, AppError> {
        let db = self.db()?;
        let defaults = Settings::default();
        Ok(Settings {
            company_name: db
                .get_setting(owner, COMPANY_NAME_KEY)?
                .unwrap_or(defaults.company_name),
            openai_api_key: db.get_setting(owner, API_KEY_KEY)?,
        })
    }

    pub async fn save_settings(
        &self,
        owner: &str,
        company_name: Option<String>,
        openai_api_key: Option<String>,
    ) -> Result<(), AppError> {
        let company_name = match company_name {
            Some(name) if name.trim().is_empty() => {
                return Err(AppError::Validation("company name must not be empty".to_string()))
            }
            other => other,
        };
        let encrypted = match openai_api_key.filter(|key| !key.trim().is_empty()) {
            Some(key) => {
                let crypto = self.crypto.clone();
                Some(run_blocking(move || crypto.encrypt_api_key(key.trim())).await??)
            }
            None => None,
        };

        let db = self.db()?;
        if let Some(name) = company_name {
            db.set_setting(owner, COMPANY_NAME_KEY, name.trim())?;
        }
        if let Some(encrypted) = encrypted {
            db.set_setting(owner, API_KEY_KEY, &encrypted)?;
        }
        Ok(())
    }

    /// Builds a classifier for the owner: their stored key wins over the configured one.
    pub async fn classifier_for(&self, owner: &str) -> Result<InvoiceClassifier, AppError> {
        let settings = self.load_settings(owner)?;
        let api_key = match settings.openai_api_key {
            Some(encrypted) => {
                let crypto = self.crypto.clone();
                run_blocking(move || crypto.decrypt_api_key(&encrypted)).await??
            }
            None => self
                .config
                .openai
                .api_key
                .clone()
                .ok_or(ClassificationError::MissingApiKey)?,
        };

        Ok(InvoiceClassifier::new(
            self.completion.clone(),
            api_key,
            settings.company_name,
            self.config.import_batch_size,
            today(),
        ))
    }

    /// Registers a new session, dropping any that have gone idle.
    pub fn insert_session(&self, session: ImportSession) -> Result<(), AppError> {
        let mut imports = self.imports()?;
        evict_idle(&mut imports, Utc::now(), self.session_ttl());
        imports.insert(session.id, session);
        Ok(())
    }

    /// Runs `f` against one of the owner's sessions while holding the registry lock.
    pub fn with_session<R>(
        &self,
        owner: &str,
        id: Uuid,
        f: impl FnOnce(&mut ImportSession) -> Result<R, AppError>,
    ) -> Result<R, AppError> {
        let mut imports = self.imports()?;
        let session = imports
            .get_mut(&id)
            .filter(|session| session.owner == owner)
            .ok_or_else(|| AppError::NotFound(format!("import {}", id)))?;
        session.updated_at = Utc::now();
        f(session)
    }

    pub fn remove_session(&self, owner: &str, id: Uuid) -> Result<(), AppError> {
        let mut imports = self.imports()?;
        match imports.get(&id) {
            Some(session) if session.owner == owner => {
                imports.remove(&id);
                Ok(())
            }
            _ => Err(AppError::NotFound(format!("import {}", id))),
        }
    }

    /// Drops sessions idle for longer than the configured TTL. Returns how many went.
    pub fn sweep_sessions(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let mut imports = self.imports()?;
        Ok(evict_idle(&mut imports, now, self.session_ttl()))
    }

    fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.import_session_ttl).unwrap_or(chrono::Duration::MAX)
    }
}

/// Sessions waiting on the completion service or the store are kept; their
/// task still has to record the outcome.
fn evict_idle(imports: &mut HashMap<Uuid, ImportSession>, now: DateTime<Utc>, ttl: chrono::Duration) -> usize {
    let before = imports.len();
    imports.retain(|_, session| session.is_in_flight() || now - session.updated_at < ttl);
    let evicted = before - imports.len();
    if evicted > 0 {
        tracing::info!(evicted, "Evicted idle import sessions");
    }
    evicted
}

/// Runs CPU-bound work off the async worker threads.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, AppError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Internal(anyhow!("Blocking task failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::spreadsheet::{ParsedSheet, SheetRow};
    use async_trait::async_trait;
    use std::time::Duration;

    struct Offline;

    #[async_trait]
    impl CompletionClient for Offline {
        async fn complete(&self, _api_key: &str, _system: &str, _user: &str) -> Result<String, ClassificationError> {
            Err(ClassificationError::Unavailable("offline".to_string()))
        }
    }

    fn state() -> AppState {
        let config = AppConfig {
            import_session_ttl: Duration::from_secs(60),
            ..AppConfig::default()
        };
        AppState::new(Database::open_in_memory().unwrap(), config, Arc::new(Offline))
    }

    fn parsed_session(owner: &str) -> ImportSession {
        let mut row = SheetRow::new();
        row.insert("Importe".to_string(), serde_json::Value::String("10".to_string()));
        let mut session = ImportSession::new(owner, "book.csv");
        session
            .load(ParsedSheet {
                headers: vec!["Importe".to_string()],
                rows: vec![row],
            })
            .unwrap();
        session
    }

    #[test]
    fn idle_sessions_are_swept_after_the_ttl() {
        let state = state();
        let idle = parsed_session("alice");
        let idle_id = idle.id;
        let mut busy = parsed_session("alice");
        busy.begin_classification().unwrap();
        let busy_id = busy.id;
        state.insert_session(idle).unwrap();
        state.insert_session(busy).unwrap();

        assert_eq!(state.sweep_sessions(Utc::now()).unwrap(), 0);

        let later = Utc::now() + chrono::Duration::seconds(61);
        assert_eq!(state.sweep_sessions(later).unwrap(), 1);
        assert!(matches!(
            state.with_session("alice", idle_id, |s| Ok(s.view())),
            Err(AppError::NotFound(_))
        ));
        assert!(state.with_session("alice", busy_id, |s| Ok(s.view())).is_ok());
    }

    #[test]
    fn sessions_are_invisible_to_other_owners() {
        let state = state();
        let session = parsed_session("alice");
        let id = session.id;
        state.insert_session(session).unwrap();

        assert!(matches!(
            state.with_session("bob", id, |s| Ok(s.view())),
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(state.remove_session("bob", id), Err(AppError::NotFound(_))));
        assert!(state.remove_session("alice", id).is_ok());
    }

    #[tokio::test]
    async fn stored_api_key_is_preferred_over_missing_config_key() {
        let state = state();
        assert!(matches!(
            state.classifier_for("alice").await,
            Err(AppError::Classification(ClassificationError::MissingApiKey))
        ));

        state
            .save_settings("alice", None, Some("sk-owner".to_string()))
            .await
            .unwrap();
        assert!(state.classifier_for("alice").await.is_ok());
        assert!(state.load_settings("alice").unwrap().openai_api_key.unwrap().starts_with("enc:"));
    }
}
