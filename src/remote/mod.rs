pub mod adapter;
pub mod blob;
pub mod file;

pub use adapter::FileRemoteAdapter;
pub use blob::{BlobCodec, JsonCodec, SyncBlob, BLOB_FORMAT_VERSION};
pub use file::{MemoryRemote, RemoteFile};
