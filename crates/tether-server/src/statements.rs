//! Stored statement files.
//!
//! A TOML file maps each statement id to its texts per SQL dialect:
//!
//! ```toml
//! [customer_by_id]
//! default = "SELECT * FROM customer WHERE id = @id"
//! mssql = "SELECT TOP 1 * FROM customer WHERE id = @id"
//! ```

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tether_core::{ConnectionInfo, SessionId, TetherError, TetherResult};
use tracing::info;

const DEFAULT_LANGUAGE: &str = "default";

#[derive(Debug)]
pub struct StatementStore {
    language: Option<String>,
    statements: HashMap<String, HashMap<String, String>>,
}

impl StatementStore {
    pub fn parse(contents: &str, language: Option<String>) -> TetherResult<Self> {
        let statements = toml::from_str(contents)
            .map_err(|e| TetherError::Malformed(format!("statement file: {e}")))?;
        Ok(Self {
            language,
            statements,
        })
    }

    pub async fn load(info: &ConnectionInfo) -> TetherResult<Self> {
        let path = info
            .statement_file_name
            .as_deref()
            .ok_or_else(|| TetherError::missing("statement_file_name"))?;
        match info.statement_file_type.as_deref() {
            None | Some("toml") => {}
            Some(other) => {
                return Err(TetherError::Malformed(format!(
                    "unsupported statement file type: {other}"
                )))
            }
        }
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TetherError::ServerFault(format!("reading {path}: {e}")))?;
        let store = Self::parse(&contents, info.statement_language.clone())?;
        info!(path, statements = store.len(), "statement file loaded");
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Text for `id` in the configured language, falling back to `default`.
    pub fn get(&self, id: &str) -> TetherResult<&str> {
        let texts = self
            .statements
            .get(id)
            .ok_or_else(|| TetherError::missing(format!("statement {id}")))?;
        self.language
            .as_deref()
            .and_then(|lang| texts.get(lang))
            .or_else(|| texts.get(DEFAULT_LANGUAGE))
            .map(String::as_str)
            .ok_or_else(|| {
                TetherError::missing(format!("statement {id} has no text for this language"))
            })
    }
}

/// One store per session, loaded on first use.
#[derive(Debug, Default)]
pub struct StatementCache {
    stores: Mutex<HashMap<SessionId, Arc<StatementStore>>>,
}

impl StatementCache {
    pub async fn store_for(
        &self,
        session_id: SessionId,
        info: &ConnectionInfo,
    ) -> TetherResult<Arc<StatementStore>> {
        let cached = self.stores.lock().get(&session_id).cloned();
        if let Some(store) = cached {
            return Ok(store);
        }
        let loaded = Arc::new(StatementStore::load(info).await?);
        Ok(self
            .stores
            .lock()
            .entry(session_id)
            .or_insert(loaded)
            .clone())
    }
}
