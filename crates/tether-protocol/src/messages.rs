use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use tether_core::{TetherError, TetherResult};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Login,
    StartTransaction,
    Commit,
    Rollback,
    GetConnection,
    ReleaseConnection,
    ExecuteSelectStatement,
    ExecuteSelectStatementInTransaction,
    ExecuteCommandStatement,
    GetKey,
    GetSqlStatement,
    Exception,
}

impl CommandKind {
    pub const ALL: [CommandKind; 12] = [
        CommandKind::Login,
        CommandKind::StartTransaction,
        CommandKind::Commit,
        CommandKind::Rollback,
        CommandKind::GetConnection,
        CommandKind::ReleaseConnection,
        CommandKind::ExecuteSelectStatement,
        CommandKind::ExecuteSelectStatementInTransaction,
        CommandKind::ExecuteCommandStatement,
        CommandKind::GetKey,
        CommandKind::GetSqlStatement,
        CommandKind::Exception,
    ];

    pub fn id(self) -> i32 {
        match self {
            CommandKind::Login => 1,
            CommandKind::StartTransaction => 2,
            CommandKind::Commit => 3,
            CommandKind::Rollback => 4,
            CommandKind::GetConnection => 5,
            CommandKind::ReleaseConnection => 6,
            CommandKind::ExecuteSelectStatement => 7,
            CommandKind::ExecuteSelectStatementInTransaction => 8,
            CommandKind::ExecuteCommandStatement => 9,
            CommandKind::GetKey => 10,
            CommandKind::GetSqlStatement => 11,
            CommandKind::Exception => 99,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            CommandKind::Login => "Login",
            CommandKind::StartTransaction => "StartTransaction",
            CommandKind::Commit => "Commit",
            CommandKind::Rollback => "Rollback",
            CommandKind::GetConnection => "GetConnection",
            CommandKind::ReleaseConnection => "ReleaseConnection",
            CommandKind::ExecuteSelectStatement => "ExecuteSelectStatement",
            CommandKind::ExecuteSelectStatementInTransaction => {
                "ExecuteSelectStatementInTransaction"
            }
            CommandKind::ExecuteCommandStatement => "ExecuteCommandStatement",
            CommandKind::GetKey => "GetKey",
            CommandKind::GetSqlStatement => "GetSQLStatement",
            CommandKind::Exception => "Exception",
        }
    }
}

/// Parameter keys shared by requests and responses.
pub mod keys {
    pub const CONNECTION_INFO: &str = "connection_info";
    pub const SESSION_ID: &str = "session_id";
    pub const TRANSACTION_ID: &str = "transaction_id";
    pub const CONNECTION_ID: &str = "connection_id";
    pub const STATEMENT: &str = "statement";
    pub const STATEMENT_ID: &str = "statement_id";
    pub const PARAMS: &str = "params";
    pub const KEY_ID: &str = "key_id";
    pub const KEY: &str = "key";
    pub const RESULT: &str = "result";
    pub const ROWS_AFFECTED: &str = "rows_affected";

    pub const KIND: &str = "kind";
    pub const MESSAGE: &str = "message";
    pub const SOURCE: &str = "source";
    pub const TRACE: &str = "trace";
}

/// One request or response. Created per exchange and never reused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: i32,
    pub guid: Uuid,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl Message {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            id: kind.id(),
            guid: Uuid::new_v4(),
            params: BTreeMap::new(),
        }
    }

    /// Response skeleton carrying the request's correlation id.
    pub fn reply(&self, kind: CommandKind) -> Self {
        Self {
            id: kind.id(),
            guid: self.guid,
            params: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> Option<CommandKind> {
        CommandKind::from_id(self.id)
    }

    pub fn is_exception(&self) -> bool {
        self.id == CommandKind::Exception.id()
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_json<T: Serialize>(self, key: &str, value: &T) -> TetherResult<Self> {
        let encoded = serde_json::to_string(value)
            .map_err(|e| TetherError::Malformed(format!("{key}: {e}")))?;
        Ok(self.with(key, encoded))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> TetherResult<&str> {
        self.get(key).ok_or_else(|| TetherError::missing(key))
    }

    pub fn parse<T: FromStr>(&self, key: &str) -> TetherResult<T>
    where
        T::Err: std::fmt::Display,
    {
        let raw = self.require(key)?;
        raw.parse()
            .map_err(|e| TetherError::Malformed(format!("{key}: {e}")))
    }

    pub fn parse_opt<T: FromStr>(&self, key: &str) -> TetherResult<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(_) => self.parse(key).map(Some),
            None => Ok(None),
        }
    }

    pub fn json<T: DeserializeOwned>(&self, key: &str) -> TetherResult<T> {
        let raw = self.require(key)?;
        serde_json::from_str(raw).map_err(|e| TetherError::Malformed(format!("{key}: {e}")))
    }

    pub fn json_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> TetherResult<T> {
        match self.get(key) {
            Some(_) => self.json(key),
            None => Ok(T::default()),
        }
    }
}

/// Wire-level rendering of a failed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionReport {
    pub kind: String,
    pub message: String,
    pub source: String,
    pub trace: String,
}

impl ExceptionReport {
    pub fn into_message(self, request_guid: Uuid) -> Message {
        Message {
            id: CommandKind::Exception.id(),
            guid: request_guid,
            params: BTreeMap::new(),
        }
        .with(keys::KIND, self.kind)
        .with(keys::MESSAGE, self.message)
        .with(keys::SOURCE, self.source)
        .with(keys::TRACE, self.trace)
    }

    pub fn from_message(message: &Message) -> Option<Self> {
        if !message.is_exception() {
            return None;
        }
        let field = |key: &str| message.get(key).unwrap_or_default().to_string();
        Some(Self {
            kind: field(keys::KIND),
            message: field(keys::MESSAGE),
            source: field(keys::SOURCE),
            trace: field(keys::TRACE),
        })
    }
}
