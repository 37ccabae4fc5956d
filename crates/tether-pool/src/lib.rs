pub mod config;
pub mod pool;
pub mod pooled;

pub use config::PoolConfig;
pub use pool::{ConnectionPool, Registration, SweepHandle};
pub use pooled::{ConnectionHandle, ConnectionState};
