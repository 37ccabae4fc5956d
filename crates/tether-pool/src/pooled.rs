use std::sync::Arc;
use std::time::Duration;
use tether_core::{Connection, ConnectionId, SessionId, TransactionId};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

pub(crate) type SharedConnection = Arc<Mutex<Box<dyn Connection>>>;

/// Pool-side bookkeeping for one physical connection.
///
/// `idle` holds exactly when nobody has the connection checked out and no
/// transaction is attached to it.
pub(crate) struct PooledConnection {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    pub transaction_id: Option<TransactionId>,
    pub idle: bool,
    pub opened: bool,
    pub last_access: Instant,
    pub connection: SharedConnection,
}

impl PooledConnection {
    pub fn checked_out(
        session_id: SessionId,
        connection: Box<dyn Connection>,
        opened: bool,
    ) -> Self {
        Self {
            session_id,
            connection_id: ConnectionId::new_v4(),
            transaction_id: None,
            idle: false,
            opened,
            last_access: Instant::now(),
            connection: Arc::new(Mutex::new(connection)),
        }
    }

    pub fn touch(&mut self) {
        self.last_access = Instant::now();
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            session_id: self.session_id,
            connection_id: self.connection_id,
            transaction_id: self.transaction_id,
            connection: self.connection.clone(),
        }
    }

    pub fn state(&self, now: Instant) -> ConnectionState {
        ConnectionState {
            session_id: self.session_id,
            connection_id: self.connection_id,
            transaction_id: self.transaction_id,
            idle: self.idle,
            opened: self.opened,
            since_last_access: now.saturating_duration_since(self.last_access),
        }
    }
}

/// Caller-side view of a pooled connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    session_id: SessionId,
    connection_id: ConnectionId,
    transaction_id: Option<TransactionId>,
    connection: SharedConnection,
}

impl ConnectionHandle {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction_id
    }

    /// Exclusive access to the driver connection for one operation.
    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn Connection>> {
        self.connection.lock().await
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("session_id", &self.session_id)
            .field("connection_id", &self.connection_id)
            .field("transaction_id", &self.transaction_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    pub transaction_id: Option<TransactionId>,
    pub idle: bool,
    pub opened: bool,
    pub since_last_access: Duration,
}
