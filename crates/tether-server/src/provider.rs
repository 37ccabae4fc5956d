use crate::statements::StatementCache;
use tether_core::{
    bound_parameters, substitute_tokens, ConnectionId, ConnectionInfo, DataValue, Param,
    ResultSet, SessionId, TetherError, TetherResult, TransactionId,
};
use tether_pool::{ConnectionHandle, ConnectionPool};
use tracing::{instrument, warn};

/// Server-side implementation of every remote command, on top of the pool.
pub struct Provider {
    pool: ConnectionPool,
    statements: StatementCache,
}

/// A connection resolved for one statement. `ad_hoc` ones go back to the
/// pool as soon as the statement finishes.
struct Lease {
    handle: ConnectionHandle,
    ad_hoc: bool,
}

impl Provider {
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            statements: StatementCache::default(),
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Equivalent logins share one session and wait for its single
    /// validation attempt, so none of them returns a session that fails.
    #[instrument(skip_all, fields(database = %info.database_id()), err)]
    pub async fn login(&self, info: ConnectionInfo) -> TetherResult<SessionId> {
        let session_id = self.pool.register_session(info)?.session_id();
        self.pool.validate(session_id).await?;
        Ok(session_id)
    }

    #[instrument(skip(self), err)]
    pub async fn start_transaction(&self, session_id: SessionId) -> TetherResult<TransactionId> {
        let handle = self.pool.get_idle_connection(session_id, true).await?;
        let begun = handle.lock().await.start_transaction().await;
        if let Err(err) = begun {
            self.release_quietly(handle.connection_id());
            return Err(err);
        }
        let transaction_id = TransactionId::new_v4();
        self.pool
            .attach_transaction(handle.connection_id(), transaction_id)?;
        Ok(transaction_id)
    }

    #[instrument(skip(self), err)]
    pub async fn commit(&self, transaction_id: TransactionId) -> TetherResult<()> {
        let handle = self.transaction(transaction_id)?;
        handle.lock().await.commit().await?;
        self.pool.release(handle.connection_id())
    }

    /// Rolls back best effort: a driver failure is logged and the connection
    /// still returns to the idle set.
    #[instrument(skip(self), err)]
    pub async fn rollback(&self, transaction_id: TransactionId) -> TetherResult<()> {
        let handle = self.transaction(transaction_id)?;
        if let Err(err) = handle.lock().await.rollback().await {
            warn!(
                transaction_id = %transaction_id,
                connection_id = %handle.connection_id(),
                error = %err,
                "rollback failed, releasing connection anyway"
            );
        }
        self.pool.release(handle.connection_id())
    }

    #[instrument(skip(self), err)]
    pub async fn get_connection(&self, session_id: SessionId) -> TetherResult<ConnectionId> {
        let handle = self.pool.get_idle_connection(session_id, true).await?;
        Ok(handle.connection_id())
    }

    #[instrument(skip(self), err)]
    pub async fn release_connection(&self, connection_id: ConnectionId) -> TetherResult<()> {
        let state = self
            .pool
            .connection_state(connection_id)
            .ok_or_else(|| TetherError::missing(format!("connection {connection_id}")))?;
        if let Some(transaction_id) = state.transaction_id {
            return Err(TetherError::InvalidState(format!(
                "connection {connection_id} still carries transaction {transaction_id}"
            )));
        }
        if state.idle {
            return Err(TetherError::InvalidState(format!(
                "connection {connection_id} is not checked out"
            )));
        }
        self.pool.release(connection_id)
    }

    #[instrument(skip(self, statement, params), err)]
    pub async fn execute_select(
        &self,
        session_id: SessionId,
        connection_id: Option<ConnectionId>,
        statement: &str,
        params: &[Param],
    ) -> TetherResult<ResultSet> {
        let lease = match connection_id {
            Some(id) => self.checked_out(session_id, id)?,
            None => self.ad_hoc(session_id).await?,
        };
        let (sql, bound) = prepare(statement, params);
        let result = lease.handle.lock().await.execute_select(&sql, &bound).await;
        self.finish(lease);
        result
    }

    #[instrument(skip(self, statement, params), err)]
    pub async fn execute_select_in_transaction(
        &self,
        transaction_id: TransactionId,
        statement: &str,
        params: &[Param],
    ) -> TetherResult<ResultSet> {
        let handle = self.transaction(transaction_id)?;
        self.pool.touch(handle.connection_id());
        let (sql, bound) = prepare(statement, params);
        let mut connection = handle.lock().await;
        connection.execute_select(&sql, &bound).await
    }

    /// Runs a command on the transaction's connection, else on the given
    /// checked-out connection, else on an idle one borrowed for this call.
    #[instrument(skip(self, statement, params), err)]
    pub async fn execute_command(
        &self,
        session_id: SessionId,
        transaction_id: Option<TransactionId>,
        connection_id: Option<ConnectionId>,
        statement: &str,
        params: &[Param],
    ) -> TetherResult<u64> {
        let lease = match (transaction_id, connection_id) {
            (Some(tx), _) => Lease {
                handle: self.transaction(tx)?,
                ad_hoc: false,
            },
            (None, Some(id)) => self.checked_out(session_id, id)?,
            (None, None) => self.ad_hoc(session_id).await?,
        };
        let (sql, bound) = prepare(statement, params);
        let result = lease.handle.lock().await.execute_command(&sql, &bound).await;
        self.finish(lease);
        result
    }

    #[instrument(skip(self), err)]
    pub async fn get_key(&self, key_id: &str, session_id: SessionId) -> TetherResult<DataValue> {
        let lease = self.ad_hoc(session_id).await?;
        let result = lease.handle.lock().await.get_key(key_id).await;
        self.finish(lease);
        result
    }

    #[instrument(skip(self), err)]
    pub async fn get_sql_statement(
        &self,
        statement_id: &str,
        session_id: SessionId,
    ) -> TetherResult<String> {
        let info = self
            .pool
            .connection_info(session_id)
            .ok_or_else(|| TetherError::missing(format!("session {session_id}")))?;
        let store = self.statements.store_for(session_id, &info).await?;
        store.get(statement_id).map(str::to_string)
    }

    fn transaction(&self, transaction_id: TransactionId) -> TetherResult<ConnectionHandle> {
        let handle = self
            .pool
            .connection_by_transaction_id(transaction_id)
            .ok_or_else(|| TetherError::missing(format!("transaction {transaction_id}")))?;
        self.pool.touch(handle.connection_id());
        Ok(handle)
    }

    fn checked_out(
        &self,
        session_id: SessionId,
        connection_id: ConnectionId,
    ) -> TetherResult<Lease> {
        let handle = self
            .pool
            .connection_by_connection_id(connection_id)
            .ok_or_else(|| TetherError::missing(format!("connection {connection_id}")))?;
        if handle.session_id() != session_id {
            return Err(TetherError::InvalidState(format!(
                "connection {connection_id} belongs to another session"
            )));
        }
        self.pool.touch(connection_id);
        Ok(Lease {
            handle,
            ad_hoc: false,
        })
    }

    async fn ad_hoc(&self, session_id: SessionId) -> TetherResult<Lease> {
        let handle = self.pool.get_idle_connection(session_id, true).await?;
        Ok(Lease {
            handle,
            ad_hoc: true,
        })
    }

    fn finish(&self, lease: Lease) {
        if lease.ad_hoc {
            self.release_quietly(lease.handle.connection_id());
        } else {
            self.pool.touch(lease.handle.connection_id());
        }
    }

    fn release_quietly(&self, connection_id: ConnectionId) {
        if let Err(err) = self.pool.release(connection_id) {
            warn!(
                connection_id = %connection_id,
                error = %err,
                "connection vanished before release"
            );
        }
    }
}

fn prepare(statement: &str, params: &[Param]) -> (String, Vec<Param>) {
    (substitute_tokens(statement, params), bound_parameters(params))
}
