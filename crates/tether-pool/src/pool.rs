use crate::config::PoolConfig;
use crate::pooled::{ConnectionHandle, ConnectionState, PooledConnection};
use metrics::counter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tether_core::{
    Connection, ConnectionFactory, ConnectionId, ConnectionInfo, DatabaseId, DriverRegistry,
    SessionId, TetherError, TetherResult, TransactionId,
};
use tokio::sync::{Notify, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const ACQUIRE_OPERATION: &str = "GetIdleConnection";

struct Session {
    id: SessionId,
    database_id: DatabaseId,
    info: ConnectionInfo,
    factory: Arc<dyn ConnectionFactory>,
    /// Outcome of the first connection attempt, shared by every login.
    validation: Arc<OnceCell<Result<(), String>>>,
}

#[derive(Default)]
struct PoolState {
    connections: Vec<PooledConnection>,
    sessions: Vec<Session>,
    /// Connections under construction, counted against the session cap.
    pending: HashMap<SessionId, usize>,
}

impl PoolState {
    fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut PooledConnection> {
        self.connections.iter_mut().find(|c| c.connection_id == id)
    }

    fn live(&self, session_id: SessionId) -> usize {
        self.connections
            .iter()
            .filter(|c| c.session_id == session_id)
            .count()
    }
}

struct PoolInner {
    config: PoolConfig,
    registry: DriverRegistry,
    state: Mutex<PoolState>,
    released: Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Existing(SessionId),
    New(SessionId),
}

impl Registration {
    pub fn session_id(self) -> SessionId {
        match self {
            Registration::Existing(id) | Registration::New(id) => id,
        }
    }
}

enum Acquire {
    Claimed { handle: ConnectionHandle, opened: bool },
    Reserved,
    Full,
}

/// Per-session sets of driver connections, sole owner of their lifecycle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, registry: DriverRegistry) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                registry,
                state: Mutex::new(PoolState::default()),
                released: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Registers `info` unless an equivalent one already owns a session.
    pub fn register_session(&self, mut info: ConnectionInfo) -> TetherResult<Registration> {
        let database_id = info.database_id();
        let factory = self.inner.registry.factory(info.factory_name())?;
        let mut state = self.inner.state.lock();
        if let Some(existing) = state.sessions.iter().find(|s| s.database_id == database_id) {
            return Ok(Registration::Existing(existing.id));
        }
        let id = SessionId::new_v4();
        info.session_id = Some(id);
        info!(session_id = %id, database = %database_id, "session registered");
        state.sessions.push(Session {
            id,
            database_id,
            info,
            factory,
            validation: Arc::new(OnceCell::new()),
        });
        Ok(Registration::New(id))
    }

    /// Withdraws a session and closes whatever connections it still owns.
    pub async fn unregister_session(&self, session_id: SessionId) {
        let orphans: Vec<PooledConnection> = {
            let mut state = self.inner.state.lock();
            state.sessions.retain(|s| s.id != session_id);
            state.pending.remove(&session_id);
            let (orphans, keep) = std::mem::take(&mut state.connections)
                .into_iter()
                .partition(|c| c.session_id == session_id);
            state.connections = keep;
            orphans
        };
        debug!(session_id = %session_id, connections = orphans.len(), "session withdrawn");
        for conn in orphans {
            retire(conn, "session withdrawn").await;
        }
        self.inner.released.notify_waiters();
    }

    pub fn connection_info(&self, session_id: SessionId) -> Option<ConnectionInfo> {
        self.inner
            .state
            .lock()
            .session(session_id)
            .map(|s| s.info.clone())
    }

    pub fn session_count(&self) -> usize {
        self.inner.state.lock().sessions.len()
    }

    /// Makes one real connection attempt outside the pool. Every login of the
    /// session waits for that same attempt; nothing is retried. A failed
    /// attempt withdraws the session.
    pub async fn validate(&self, session_id: SessionId) -> TetherResult<()> {
        let (info, factory, validation) = {
            let state = self.inner.state.lock();
            let session = state.session(session_id).ok_or_else(|| {
                TetherError::InvalidDatabase(format!("session {session_id} was withdrawn"))
            })?;
            (
                session.info.clone(),
                session.factory.clone(),
                session.validation.clone(),
            )
        };
        let outcome = validation
            .get_or_init(|| attempt(session_id, factory.as_ref(), &info))
            .await
            .clone();
        if let Err(message) = outcome {
            self.unregister_session(session_id).await;
            return Err(TetherError::InvalidDatabase(message));
        }
        Ok(())
    }

    /// Checks out an idle connection of `session_id`, growing the pool up to
    /// the session cap and otherwise waiting for a release until the session
    /// timeout runs out.
    pub async fn get_idle_connection(
        &self,
        session_id: SessionId,
        open: bool,
    ) -> TetherResult<ConnectionHandle> {
        let (info, factory) = self.session_parts(session_id)?;
        let limit = info.timeout();
        let deadline = Instant::now() + limit;
        let cap = info.pool_size.max(1);
        loop {
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            match self.claim_or_reserve(session_id, cap) {
                Acquire::Claimed { handle, opened } => {
                    if opened || !open {
                        return Ok(handle);
                    }
                    let opening = async { handle.lock().await.open().await };
                    match tokio::time::timeout_at(deadline, opening).await {
                        Err(_) => {
                            warn!(
                                session_id = %session_id,
                                connection_id = %handle.connection_id(),
                                "pooled connection still opening at timeout, discarding"
                            );
                            self.discard(handle.connection_id()).await;
                            return Err(TetherError::timeout(ACQUIRE_OPERATION, limit));
                        }
                        Ok(Ok(())) => {
                            self.mark_opened(handle.connection_id());
                            return Ok(handle);
                        }
                        Ok(Err(err)) => {
                            warn!(
                                session_id = %session_id,
                                connection_id = %handle.connection_id(),
                                error = %err,
                                "pooled connection failed to open, discarding"
                            );
                            self.discard(handle.connection_id()).await;
                        }
                    }
                }
                Acquire::Reserved => {
                    let building = build(factory.as_ref(), &info, open);
                    match tokio::time::timeout_at(deadline, building).await {
                        Ok(Ok(conn)) => return Ok(self.adopt(session_id, conn, open)),
                        Ok(Err(err)) => {
                            self.cancel_reservation(session_id);
                            warn!(
                                session_id = %session_id,
                                error = %err,
                                "connection attempt failed, retrying"
                            );
                            let retry_at = Instant::now() + self.inner.config.retry_backoff;
                            tokio::time::sleep_until(retry_at.min(deadline)).await;
                        }
                        Err(_) => {
                            self.cancel_reservation(session_id);
                            warn!(session_id = %session_id, "connection attempt outlived timeout");
                            return Err(TetherError::timeout(ACQUIRE_OPERATION, limit));
                        }
                    }
                }
                Acquire::Full => {
                    if tokio::time::timeout_at(deadline, released).await.is_err() {
                        warn!(session_id = %session_id, cap, "no idle connection before timeout");
                        return Err(TetherError::timeout(ACQUIRE_OPERATION, limit));
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(TetherError::timeout(ACQUIRE_OPERATION, limit));
            }
        }
    }

    pub fn connection_by_transaction_id(
        &self,
        transaction_id: TransactionId,
    ) -> Option<ConnectionHandle> {
        self.inner
            .state
            .lock()
            .connections
            .iter()
            .find(|c| c.transaction_id == Some(transaction_id))
            .map(PooledConnection::handle)
    }

    pub fn connection_by_connection_id(
        &self,
        connection_id: ConnectionId,
    ) -> Option<ConnectionHandle> {
        self.inner
            .state
            .lock()
            .connections
            .iter()
            .find(|c| c.connection_id == connection_id)
            .map(PooledConnection::handle)
    }

    /// Attaches a transaction to a checked-out connection.
    pub fn attach_transaction(
        &self,
        connection_id: ConnectionId,
        transaction_id: TransactionId,
    ) -> TetherResult<()> {
        let mut state = self.inner.state.lock();
        let conn = state
            .connection_mut(connection_id)
            .ok_or_else(|| TetherError::missing(format!("connection {connection_id}")))?;
        conn.idle = false;
        conn.transaction_id = Some(transaction_id);
        conn.touch();
        Ok(())
    }

    /// Returns a connection to the idle set and clears its transaction.
    pub fn release(&self, connection_id: ConnectionId) -> TetherResult<()> {
        {
            let mut state = self.inner.state.lock();
            let conn = state
                .connection_mut(connection_id)
                .ok_or_else(|| TetherError::missing(format!("connection {connection_id}")))?;
            conn.idle = true;
            conn.transaction_id = None;
            conn.touch();
        }
        self.inner.released.notify_waiters();
        Ok(())
    }

    pub fn touch(&self, connection_id: ConnectionId) {
        if let Some(conn) = self.inner.state.lock().connection_mut(connection_id) {
            conn.touch();
        }
    }

    pub fn live_connections(&self, session_id: SessionId) -> usize {
        self.inner.state.lock().live(session_id)
    }

    pub fn snapshot(&self) -> Vec<ConnectionState> {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .connections
            .iter()
            .map(|c| c.state(now))
            .collect()
    }

    pub fn connection_state(&self, connection_id: ConnectionId) -> Option<ConnectionState> {
        let now = Instant::now();
        self.inner
            .state
            .lock()
            .connections
            .iter()
            .find(|c| c.connection_id == connection_id)
            .map(|c| c.state(now))
    }

    /// Evicts idle connections past their session's idle timeout and any
    /// connection past the broken ceiling. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let broken = self.inner.config.broken_timeout;
        let evicted: Vec<(PooledConnection, &'static str)> = {
            let mut state = self.inner.state.lock();
            let idle_limits: HashMap<SessionId, Duration> = state
                .sessions
                .iter()
                .map(|s| (s.id, s.info.idle_timeout()))
                .collect();
            let mut evicted = Vec::new();
            let mut keep = Vec::with_capacity(state.connections.len());
            for conn in std::mem::take(&mut state.connections) {
                let elapsed = now.saturating_duration_since(conn.last_access);
                let idle_limit = idle_limits.get(&conn.session_id).copied().unwrap_or(broken);
                if elapsed > broken {
                    evicted.push((conn, "broken timeout"));
                } else if conn.idle && elapsed > idle_limit {
                    evicted.push((conn, "idle timeout"));
                } else {
                    keep.push(conn);
                }
            }
            state.connections = keep;
            evicted
        };
        let count = evicted.len();
        for (conn, reason) in evicted {
            counter!("tether_pool_connections_evicted_total").increment(1);
            retire(conn, reason).await;
        }
        if count > 0 {
            self.inner.released.notify_waiters();
        }
        count
    }

    /// Starts the periodic eviction sweep. The task ends on its own once the
    /// pool is dropped.
    pub fn start_sweeper(&self) -> SweepHandle {
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let evicted = ConnectionPool { inner }.sweep().await;
                if evicted > 0 {
                    debug!(evicted, "eviction sweep");
                }
            }
        });
        SweepHandle { task: Some(task) }
    }

    /// Rolls back and closes every pooled connection.
    pub async fn close_all(&self) {
        let all = std::mem::take(&mut self.inner.state.lock().connections);
        info!(connections = all.len(), "closing pool");
        for conn in all {
            retire(conn, "pool shutdown").await;
        }
        self.inner.released.notify_waiters();
    }

    fn session_parts(
        &self,
        session_id: SessionId,
    ) -> TetherResult<(ConnectionInfo, Arc<dyn ConnectionFactory>)> {
        let state = self.inner.state.lock();
        let session = state
            .session(session_id)
            .ok_or_else(|| TetherError::missing(format!("session {session_id}")))?;
        Ok((session.info.clone(), session.factory.clone()))
    }

    fn claim_or_reserve(&self, session_id: SessionId, cap: usize) -> Acquire {
        let mut state = self.inner.state.lock();
        if let Some(conn) = state
            .connections
            .iter_mut()
            .find(|c| c.session_id == session_id && c.idle)
        {
            conn.idle = false;
            conn.touch();
            return Acquire::Claimed {
                handle: conn.handle(),
                opened: conn.opened,
            };
        }
        let pending = state.pending.get(&session_id).copied().unwrap_or(0);
        if state.live(session_id) + pending < cap {
            *state.pending.entry(session_id).or_insert(0) += 1;
            return Acquire::Reserved;
        }
        Acquire::Full
    }

    fn cancel_reservation(&self, session_id: SessionId) {
        {
            let mut state = self.inner.state.lock();
            if let Some(pending) = state.pending.get_mut(&session_id) {
                *pending = pending.saturating_sub(1);
            }
        }
        self.inner.released.notify_waiters();
    }

    fn adopt(
        &self,
        session_id: SessionId,
        conn: Box<dyn Connection>,
        opened: bool,
    ) -> ConnectionHandle {
        let pooled = PooledConnection::checked_out(session_id, conn, opened);
        let handle = pooled.handle();
        let mut state = self.inner.state.lock();
        if let Some(pending) = state.pending.get_mut(&session_id) {
            *pending = pending.saturating_sub(1);
        }
        state.connections.push(pooled);
        counter!("tether_pool_connections_created_total").increment(1);
        debug!(
            session_id = %session_id,
            connection_id = %handle.connection_id(),
            live = state.live(session_id),
            "connection created"
        );
        handle
    }

    fn mark_opened(&self, connection_id: ConnectionId) {
        if let Some(conn) = self.inner.state.lock().connection_mut(connection_id) {
            conn.opened = true;
        }
    }

    async fn discard(&self, connection_id: ConnectionId) {
        let removed = {
            let mut state = self.inner.state.lock();
            state
                .connections
                .iter()
                .position(|c| c.connection_id == connection_id)
                .map(|idx| state.connections.swap_remove(idx))
        };
        if let Some(conn) = removed {
            retire(conn, "failed to open").await;
        }
        self.inner.released.notify_waiters();
    }
}

async fn attempt(
    session_id: SessionId,
    factory: &dyn ConnectionFactory,
    info: &ConnectionInfo,
) -> Result<(), String> {
    let mut conn = factory.create(info).map_err(|e| e.to_string())?;
    match tokio::time::timeout(info.timeout(), conn.open()).await {
        Ok(opened) => opened.map_err(|e| e.to_string())?,
        Err(_) => return Err(format!("open exceeded {}ms", info.timeout_ms)),
    }
    if let Err(err) = conn.close().await {
        warn!(session_id = %session_id, error = %err, "closing validation connection failed");
    }
    Ok(())
}

async fn build(
    factory: &dyn ConnectionFactory,
    info: &ConnectionInfo,
    open: bool,
) -> TetherResult<Box<dyn Connection>> {
    let mut conn = factory.create(info)?;
    if open {
        conn.open().await?;
    }
    Ok(conn)
}

/// Rolls back any attached transaction and closes the connection. Failures
/// are logged only. A connection still locked by a stuck caller is shut down
/// in the background once that caller lets go.
async fn retire(conn: PooledConnection, reason: &'static str) {
    info!(
        session_id = %conn.session_id,
        connection_id = %conn.connection_id,
        transaction_id = ?conn.transaction_id,
        reason,
        "evicting connection"
    );
    match conn.connection.clone().try_lock_owned() {
        Ok(mut guard) => shut_down(&mut guard, &conn).await,
        Err(_) => {
            tokio::spawn(async move {
                let mut guard = conn.connection.clone().lock_owned().await;
                shut_down(&mut guard, &conn).await;
            });
        }
    }
}

async fn shut_down(connection: &mut Box<dyn Connection>, conn: &PooledConnection) {
    if conn.transaction_id.is_some() {
        if let Err(err) = connection.rollback().await {
            warn!(
                connection_id = %conn.connection_id,
                error = %err,
                "rollback during eviction failed"
            );
        }
    }
    if conn.opened {
        if let Err(err) = connection.close().await {
            warn!(
                connection_id = %conn.connection_id,
                error = %err,
                "close during eviction failed"
            );
        }
    }
}

/// Keeps the sweep task alive; stopping or dropping it ends the sweep.
#[derive(Debug)]
pub struct SweepHandle {
    task: Option<JoinHandle<()>>,
}

impl SweepHandle {
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
