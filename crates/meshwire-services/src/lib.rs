//! meshwire-services: stateful components built on meshwire-core:
//! the chunked transfer engine, the channel registry and its key store.

pub mod channel;
pub mod file_transfer;
pub mod store;

pub use channel::{
    ChannelError, ChannelEvent, ChannelRegistry, ACTIVE_STORAGE_KEY, CHANNELS_STORAGE_KEY,
};
pub use file_transfer::{
    build_manifest, IncomingProgress, OutgoingProgress, TransferEngine, TransferError,
    COMPLETED_MEMORY, MAX_PENDING_INCOMING,
};
pub use store::{FileStore, MemoryStore, SecureStore};
