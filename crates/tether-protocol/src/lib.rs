pub mod client;
pub mod codec;
pub mod messages;
pub mod packet;

pub use messages::{keys, CommandKind, ExceptionReport, Message};
pub use packet::{Reassembler, ReassemblyState};
