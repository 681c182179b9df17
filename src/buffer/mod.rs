//! Connector read/write buffers

mod read;
mod row;
mod write;

pub use read::{FillError, ReadBuffer, ReadLimits};
pub use row::{DataRowView, Fields};
pub use write::WriteBuffer;
