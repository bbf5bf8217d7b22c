pub mod memory;
pub mod oplog;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod traits;

pub use memory::MemoryOpLogStore;
pub use oplog::OpLog;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteOpLogStore;
pub use traits::{LogEntry, OpLogStore, OpSource, StateCache, StoreResult};
