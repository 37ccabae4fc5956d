//! Loopback driver keeping everything in process memory.
//!
//! Each database name maps to a shared journal of executed commands and a set
//! of key generators. Commands issued inside a transaction stay private to the
//! connection until commit. Selects return the journal as a one-column table.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tether_core::{
    Column, Connection, ConnectionFactory, ConnectionInfo, DataRow, DataType, DataValue, Param,
    ResultSet, TetherError, TetherResult,
};

#[derive(Debug, Default)]
struct MemoryDatabase {
    journal: Vec<String>,
    keys: HashMap<String, i64>,
}

#[derive(Debug, Default, Clone)]
pub struct MemoryFactory {
    databases: Arc<Mutex<HashMap<String, Arc<Mutex<MemoryDatabase>>>>>,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed journal of `database`, oldest first.
    pub fn journal(&self, database: &str) -> Vec<String> {
        self.databases
            .lock()
            .get(database)
            .map(|db| db.lock().journal.clone())
            .unwrap_or_default()
    }
}

impl ConnectionFactory for MemoryFactory {
    fn create(&self, info: &ConnectionInfo) -> TetherResult<Box<dyn Connection>> {
        let database = self
            .databases
            .lock()
            .entry(info.database.clone())
            .or_default()
            .clone();
        Ok(Box::new(MemoryConnection {
            name: info.database.clone(),
            database,
            open: false,
            pending: None,
        }))
    }
}

struct MemoryConnection {
    name: String,
    database: Arc<Mutex<MemoryDatabase>>,
    open: bool,
    pending: Option<Vec<String>>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> TetherResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(TetherError::driver(format!("connection to {} is not open", self.name)))
        }
    }

    fn take_pending(&mut self) -> TetherResult<Vec<String>> {
        self.ensure_open()?;
        self.pending
            .take()
            .ok_or_else(|| TetherError::driver("no active transaction"))
    }
}

fn render(statement: &str, params: &[Param]) -> String {
    if params.is_empty() {
        return statement.to_string();
    }
    let bound: Vec<String> = params
        .iter()
        .map(|p| format!("{}={}", p.name, p.value.to_literal()))
        .collect();
    format!("{statement} [{}]", bound.join(", "))
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open(&mut self) -> TetherResult<()> {
        if self.name.is_empty() {
            return Err(TetherError::driver("database name is empty"));
        }
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> TetherResult<()> {
        self.pending = None;
        self.open = false;
        Ok(())
    }

    async fn start_transaction(&mut self) -> TetherResult<()> {
        self.ensure_open()?;
        if self.pending.is_some() {
            return Err(TetherError::driver("transaction already active"));
        }
        self.pending = Some(Vec::new());
        Ok(())
    }

    async fn commit(&mut self) -> TetherResult<()> {
        let pending = self.take_pending()?;
        self.database.lock().journal.extend(pending);
        Ok(())
    }

    async fn rollback(&mut self) -> TetherResult<()> {
        self.take_pending().map(drop)
    }

    async fn execute_select(
        &mut self,
        _statement: &str,
        _params: &[Param],
    ) -> TetherResult<ResultSet> {
        self.ensure_open()?;
        let mut entries = self.database.lock().journal.clone();
        if let Some(pending) = &self.pending {
            entries.extend(pending.iter().cloned());
        }
        Ok(ResultSet {
            columns: vec![Column {
                name: "statement".to_string(),
                data_type: DataType::Text.to_string(),
            }],
            rows: entries
                .into_iter()
                .map(|entry| DataRow {
                    values: vec![DataValue::String(entry)],
                })
                .collect(),
            rows_affected: 0,
        })
    }

    async fn execute_command(&mut self, statement: &str, params: &[Param]) -> TetherResult<u64> {
        self.ensure_open()?;
        let entry = render(statement, params);
        match &mut self.pending {
            Some(pending) => pending.push(entry),
            None => self.database.lock().journal.push(entry),
        }
        Ok(1)
    }

    async fn get_key(&mut self, key_id: &str) -> TetherResult<DataValue> {
        self.ensure_open()?;
        let mut database = self.database.lock();
        let next = database.keys.entry(key_id.to_string()).or_insert(0);
        *next += 1;
        Ok(DataValue::Int64(*next))
    }
}
