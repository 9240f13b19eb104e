//! Transfer packets: manifest, chunk, ack, cancel.
//!
//! Unlike the tolerant kinds in `packet`, every transfer packet starts with a
//! one-byte tag from a closed set (0x10..=0x13). A buffer whose leading tag is
//! not in that set is a protocol mismatch and fails to decode. The records
//! after the tag are scanned the same way as tolerant packets: any order,
//! unknown record types skipped, last occurrence wins.

use static_assertions::const_assert;
use subtle::ConstantTimeEq;

use crate::crypto::hash;
use crate::wire::{self, Tlv, WireError};

/// Random 16-byte identifier shared by every packet of one transfer.
pub type FileId = [u8; 16];

// ── Constants ─────────────────────────────────────────────────────────────────

/// Largest payload a single chunk can carry.
pub const MAX_CHUNK_PAYLOAD: usize = wire::MAX_VALUE_LEN;

/// Default chunk payload size. Leaves headroom under the link's packet ceiling.
pub const DEFAULT_CHUNK_SIZE: usize = 192;

/// Default number of chunks emitted per pull.
pub const DEFAULT_WINDOW: usize = 4;

/// Bytes an encoded chunk adds around its payload: tag, five record
/// headers, file id, index, total, hash.
pub const CHUNK_FRAMING_LEN: usize = 1 + 5 * wire::RECORD_HEADER_LEN + 16 + 4 + 4 + 32;

/// Largest payload whose encoded chunk still fits in one channel envelope.
pub const MAX_SEALED_CHUNK_PAYLOAD: usize = wire::MAX_VALUE_LEN - CHUNK_FRAMING_LEN;

const_assert!(DEFAULT_CHUNK_SIZE <= MAX_CHUNK_PAYLOAD);
const_assert!(MAX_SEALED_CHUNK_PAYLOAD > 0);
const_assert!(DEFAULT_WINDOW > 0);

/// Leading tag bytes.
pub mod tag {
    pub const MANIFEST: u8 = 0x10;
    pub const CHUNK: u8 = 0x11;
    pub const ACK: u8 = 0x12;
    pub const CANCEL: u8 = 0x13;
}

pub mod manifest_field {
    pub const FILE_ID: u8 = 0x01;
    pub const FILE_NAME: u8 = 0x02;
    pub const MIME_TYPE: u8 = 0x03;
    pub const FILE_SIZE: u8 = 0x04;
    pub const TOTAL_CHUNKS: u8 = 0x05;
    pub const FILE_HASH: u8 = 0x06;
}

pub mod chunk_field {
    pub const FILE_ID: u8 = 0x01;
    pub const INDEX: u8 = 0x02;
    pub const TOTAL_CHUNKS: u8 = 0x03;
    pub const CHUNK_HASH: u8 = 0x04;
    pub const PAYLOAD: u8 = 0x05;
}

pub mod ack_field {
    pub const FILE_ID: u8 = 0x01;
    pub const ACKED_UP_TO: u8 = 0x02;
}

pub mod cancel_field {
    pub const FILE_ID: u8 = 0x01;
}

/// Strip and check the leading tag, returning the record body.
fn body(bytes: &[u8], expected: u8) -> Result<&[u8], WireError> {
    match bytes.split_first() {
        None => Err(WireError::Empty),
        Some((&actual, rest)) if actual == expected => Ok(rest),
        Some((&actual, _)) => Err(WireError::UnexpectedTag { expected, actual }),
    }
}

fn tagged(tag: u8) -> Vec<u8> {
    vec![tag]
}

// ── Manifest ──────────────────────────────────────────────────────────────────

/// Describes one transfer. Sent before the first chunk and never modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitTransferManifest {
    pub file_id: FileId,
    pub file_name: String,
    pub mime_type: String,
    pub file_size: u64,
    pub total_chunks: u32,
    /// BLAKE3 hash of the complete file.
    pub file_hash: [u8; 32],
}

impl BitTransferManifest {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        use manifest_field::*;

        let mut out = tagged(tag::MANIFEST);
        wire::encode_record(&mut out, FILE_ID, &self.file_id)?;
        wire::encode_record(&mut out, FILE_NAME, self.file_name.as_bytes())?;
        wire::encode_record(&mut out, MIME_TYPE, self.mime_type.as_bytes())?;
        wire::encode_record(&mut out, FILE_SIZE, &self.file_size.to_be_bytes())?;
        wire::encode_record(&mut out, TOTAL_CHUNKS, &self.total_chunks.to_be_bytes())?;
        wire::encode_record(&mut out, FILE_HASH, &self.file_hash)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        use manifest_field::*;

        let mut file_id = None;
        let mut file_name = None;
        let mut mime_type = None;
        let mut file_size = None;
        let mut total_chunks = None;
        let mut file_hash = None;

        for record in wire::records(body(bytes, tag::MANIFEST)?) {
            let Tlv { kind, value } = record?;
            match kind {
                FILE_ID => file_id = Some(wire::read_fixed(kind, value)?),
                FILE_NAME => file_name = Some(wire::read_text(kind, value)?),
                MIME_TYPE => mime_type = Some(wire::read_text(kind, value)?),
                FILE_SIZE => file_size = Some(wire::read_u64(kind, value)?),
                TOTAL_CHUNKS => total_chunks = Some(wire::read_u32(kind, value)?),
                FILE_HASH => file_hash = Some(wire::read_fixed(kind, value)?),
                _ => {}
            }
        }

        Ok(Self {
            file_id: wire::require(file_id, FILE_ID)?,
            file_name: wire::require(file_name, FILE_NAME)?,
            mime_type: wire::require(mime_type, MIME_TYPE)?,
            file_size: wire::require(file_size, FILE_SIZE)?,
            total_chunks: wire::require(total_chunks, TOTAL_CHUNKS)?,
            file_hash: wire::require(file_hash, FILE_HASH)?,
        })
    }
}

// ── Chunk ─────────────────────────────────────────────────────────────────────

/// One slice of a file. `chunk_hash` authenticates the payload on its own,
/// independent of whatever envelope the chunk later travels in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitTransferChunk {
    pub file_id: FileId,
    /// Zero-based position of this chunk.
    pub index: u32,
    pub total_chunks: u32,
    pub chunk_hash: [u8; 32],
    pub payload: Vec<u8>,
}

impl BitTransferChunk {
    /// Build a chunk, hashing its payload.
    pub fn new(file_id: FileId, index: u32, total_chunks: u32, payload: Vec<u8>) -> Self {
        Self {
            file_id,
            index,
            total_chunks,
            chunk_hash: hash(&payload),
            payload,
        }
    }

    /// Recompute the payload hash and compare it in constant time.
    pub fn verify(&self) -> bool {
        hash(&self.payload)[..].ct_eq(&self.chunk_hash[..]).into()
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        use chunk_field::*;

        let mut out = tagged(tag::CHUNK);
        wire::encode_record(&mut out, FILE_ID, &self.file_id)?;
        wire::encode_record(&mut out, INDEX, &self.index.to_be_bytes())?;
        wire::encode_record(&mut out, TOTAL_CHUNKS, &self.total_chunks.to_be_bytes())?;
        wire::encode_record(&mut out, CHUNK_HASH, &self.chunk_hash)?;
        wire::encode_record(&mut out, PAYLOAD, &self.payload)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        use chunk_field::*;

        let mut file_id = None;
        let mut index = None;
        let mut total_chunks = None;
        let mut chunk_hash = None;
        let mut payload = None;

        for record in wire::records(body(bytes, tag::CHUNK)?) {
            let Tlv { kind, value } = record?;
            match kind {
                FILE_ID => file_id = Some(wire::read_fixed(kind, value)?),
                INDEX => index = Some(wire::read_u32(kind, value)?),
                TOTAL_CHUNKS => total_chunks = Some(wire::read_u32(kind, value)?),
                CHUNK_HASH => chunk_hash = Some(wire::read_fixed(kind, value)?),
                PAYLOAD => payload = Some(value.to_vec()),
                _ => {}
            }
        }

        Ok(Self {
            file_id: wire::require(file_id, FILE_ID)?,
            index: wire::require(index, INDEX)?,
            total_chunks: wire::require(total_chunks, TOTAL_CHUNKS)?,
            chunk_hash: wire::require(chunk_hash, CHUNK_HASH)?,
            payload: wire::require(payload, PAYLOAD)?,
        })
    }
}

// ── Ack ───────────────────────────────────────────────────────────────────────

/// Contiguous acknowledgment: every index in `0..=acked_up_to` has arrived.
///
/// Receivers never send an ack before index 0 is held, so the value always
/// confirms at least one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTransferAck {
    pub file_id: FileId,
    pub acked_up_to: u32,
}

impl BitTransferAck {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        use ack_field::*;

        let mut out = tagged(tag::ACK);
        wire::encode_record(&mut out, FILE_ID, &self.file_id)?;
        wire::encode_record(&mut out, ACKED_UP_TO, &self.acked_up_to.to_be_bytes())?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        use ack_field::*;

        let mut file_id = None;
        let mut acked_up_to = None;

        for record in wire::records(body(bytes, tag::ACK)?) {
            let Tlv { kind, value } = record?;
            match kind {
                FILE_ID => file_id = Some(wire::read_fixed(kind, value)?),
                ACKED_UP_TO => acked_up_to = Some(wire::read_u32(kind, value)?),
                _ => {}
            }
        }

        Ok(Self {
            file_id: wire::require(file_id, FILE_ID)?,
            acked_up_to: wire::require(acked_up_to, ACKED_UP_TO)?,
        })
    }
}

// ── Cancel ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitTransferCancel {
    pub file_id: FileId,
}

impl BitTransferCancel {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = tagged(tag::CANCEL);
        wire::encode_record(&mut out, cancel_field::FILE_ID, &self.file_id)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let mut file_id = None;

        for record in wire::records(body(bytes, tag::CANCEL)?) {
            let Tlv { kind, value } = record?;
            if kind == cancel_field::FILE_ID {
                file_id = Some(wire::read_fixed(kind, value)?);
            }
        }

        Ok(Self {
            file_id: wire::require(file_id, cancel_field::FILE_ID)?,
        })
    }
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Any transfer packet, selected by its leading tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPacket {
    Manifest(BitTransferManifest),
    Chunk(BitTransferChunk),
    Ack(BitTransferAck),
    Cancel(BitTransferCancel),
}

impl TransferPacket {
    pub fn file_id(&self) -> &FileId {
        match self {
            TransferPacket::Manifest(m) => &m.file_id,
            TransferPacket::Chunk(c) => &c.file_id,
            TransferPacket::Ack(a) => &a.file_id,
            TransferPacket::Cancel(c) => &c.file_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        match self {
            TransferPacket::Manifest(m) => m.encode(),
            TransferPacket::Chunk(c) => c.encode(),
            TransferPacket::Ack(a) => a.encode(),
            TransferPacket::Cancel(c) => c.encode(),
        }
    }

    /// Decode whichever transfer packet `bytes` holds.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        match bytes.first() {
            None => Err(WireError::Empty),
            Some(&tag::MANIFEST) => BitTransferManifest::decode(bytes).map(Self::Manifest),
            Some(&tag::CHUNK) => BitTransferChunk::decode(bytes).map(Self::Chunk),
            Some(&tag::ACK) => BitTransferAck::decode(bytes).map(Self::Ack),
            Some(&tag::CANCEL) => BitTransferCancel::decode(bytes).map(Self::Cancel),
            Some(&other) => Err(WireError::UnknownTag(other)),
        }
    }
}

impl From<BitTransferManifest> for TransferPacket {
    fn from(m: BitTransferManifest) -> Self {
        TransferPacket::Manifest(m)
    }
}

impl From<BitTransferChunk> for TransferPacket {
    fn from(c: BitTransferChunk) -> Self {
        TransferPacket::Chunk(c)
    }
}

impl From<BitTransferAck> for TransferPacket {
    fn from(a: BitTransferAck) -> Self {
        TransferPacket::Ack(a)
    }
}

impl From<BitTransferCancel> for TransferPacket {
    fn from(c: BitTransferCancel) -> Self {
        TransferPacket::Cancel(c)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
