use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

pub type SessionId = Uuid;
pub type ConnectionId = Uuid;
pub type TransactionId = Uuid;

pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Everything a client states about the database it wants to reach.
///
/// Two infos with the same [`DatabaseId`] describe the same resource and share
/// one session.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionInfo {
    pub driver: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub statement_file_type: Option<String>,
    #[serde(default)]
    pub statement_file_name: Option<String>,
    #[serde(default)]
    pub statement_language: Option<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default)]
    pub remote_host: Option<String>,
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub remote_timeout_ms: Option<u64>,
    #[serde(default)]
    pub connection_factory: Option<String>,
    #[serde(default = "default_field_delimiter")]
    pub field_delimiter: String,
    #[serde(default)]
    pub session_id: Option<SessionId>,
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_field_delimiter() -> String {
    ";".to_string()
}

/// Composite key used to deduplicate logins to the same resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DatabaseId {
    pub driver: String,
    pub host: String,
    pub database: String,
    pub user: String,
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}@{}/{}", self.driver, self.user, self.host, self.database)
    }
}

impl ConnectionInfo {
    pub fn new(driver: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            host: String::new(),
            database: database.into(),
            user: String::new(),
            password: String::new(),
            statement_file_type: None,
            statement_file_name: None,
            statement_language: None,
            pool_size: DEFAULT_POOL_SIZE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            idle_timeout_ms: None,
            remote_host: None,
            remote_port: None,
            remote_timeout_ms: None,
            connection_factory: None,
            field_delimiter: default_field_delimiter(),
            session_id: None,
        }
    }

    pub fn database_id(&self) -> DatabaseId {
        DatabaseId {
            driver: self.driver.to_ascii_lowercase(),
            host: self.host.to_ascii_lowercase(),
            database: self.database.clone(),
            user: self.user.clone(),
        }
    }

    /// Registry key of the factory that builds connections for this info.
    pub fn factory_name(&self) -> &str {
        self.connection_factory.as_deref().unwrap_or(&self.driver)
    }

    /// Upper bound on any wait for a pooled connection.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.unwrap_or(self.timeout_ms))
    }
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"***")
            .field("pool_size", &self.pool_size)
            .field("timeout_ms", &self.timeout_ms)
            .field("connection_factory", &self.connection_factory)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}
