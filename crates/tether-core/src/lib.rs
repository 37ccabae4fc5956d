pub mod connection;
pub mod error;
pub mod info;
pub mod param;
pub mod types;

pub use connection::{Connection, ConnectionFactory, DriverRegistry};
pub use error::{TetherError, TetherResult};
pub use info::{ConnectionId, ConnectionInfo, DatabaseId, SessionId, TransactionId};
pub use param::{bound_parameters, substitute_tokens, Param, ParamType};
pub use types::{Column, DataRow, DataType, DataValue, ResultSet};
