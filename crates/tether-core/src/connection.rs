//! Capability surface every database technology implements.
//!
//! The pool and the provider only ever see `dyn Connection`; concrete drivers
//! are picked at runtime through [`DriverRegistry`] by driver id.

use crate::error::{TetherError, TetherResult};
use crate::info::ConnectionInfo;
use crate::param::Param;
use crate::types::{DataValue, ResultSet};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait Connection: Send {
    async fn open(&mut self) -> TetherResult<()>;

    async fn close(&mut self) -> TetherResult<()>;

    async fn start_transaction(&mut self) -> TetherResult<()>;

    async fn commit(&mut self) -> TetherResult<()>;

    async fn rollback(&mut self) -> TetherResult<()>;

    async fn execute_select(
        &mut self,
        statement: &str,
        params: &[Param],
    ) -> TetherResult<ResultSet>;

    /// Returns the number of affected rows.
    async fn execute_command(&mut self, statement: &str, params: &[Param]) -> TetherResult<u64>;

    /// Next value of the named key generator.
    async fn get_key(&mut self, key_id: &str) -> TetherResult<DataValue>;
}

/// Builds unopened connections for one driver.
pub trait ConnectionFactory: Send + Sync {
    fn create(&self, info: &ConnectionInfo) -> TetherResult<Box<dyn Connection>>;
}

#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<String, Arc<dyn ConnectionFactory>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver_id: impl Into<String>, factory: Arc<dyn ConnectionFactory>) {
        self.factories
            .insert(driver_id.into().to_ascii_lowercase(), factory);
    }

    pub fn with(
        mut self,
        driver_id: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        self.register(driver_id, factory);
        self
    }

    pub fn factory(&self, driver_id: &str) -> TetherResult<Arc<dyn ConnectionFactory>> {
        self.factories
            .get(&driver_id.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| TetherError::InvalidDatabase(format!("unknown driver: {driver_id}")))
    }

    pub fn drivers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.drivers())
            .finish()
    }
}
