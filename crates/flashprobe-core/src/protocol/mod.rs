//! Protocol module - frame layout, command IDs and typed operations.

pub mod command;
pub mod constants;
pub mod frame;
pub mod operation;

pub use command::{Command, Status, Subsystem};
pub use frame::{Frame, ProtocolError, Reply};
pub use operation::{Operation, PageSpan};
