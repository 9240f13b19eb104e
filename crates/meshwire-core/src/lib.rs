//! meshwire-core: wire codec, packet catalog, and channel cryptography.
//! All other meshwire crates depend on this one.

pub mod config;
pub mod crypto;
pub mod packet;
pub mod transfer;
pub mod wire;

pub use crypto::{normalize_channel_name, ChannelId, ChannelKey, CryptoError};
pub use packet::{AnnouncementPacket, ChannelEncryptedPacket, PrivateMessagePacket};
pub use transfer::{
    BitTransferAck, BitTransferCancel, BitTransferChunk, BitTransferManifest, FileId,
    TransferPacket,
};
pub use wire::WireError;
