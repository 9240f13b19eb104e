//! File transfer: chunking, windowed emission, acknowledgment and reassembly.
//!
//! The engine is a pure state machine. It never touches the network, never
//! sleeps and never retransmits on its own: the transport loop pulls chunks
//! with `next_chunks`, feeds inbound packets to the `handle_*` methods, and
//! decides when to `rewind` a stalled sender.
//!
//! Sender and receiver state live in separate maps keyed by file id, so a
//! peer can send and receive any number of independent transfers at once.

use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use subtle::ConstantTimeEq;

use meshwire_core::crypto::{self, Hasher};
use meshwire_core::transfer::{
    manifest_field, BitTransferAck, BitTransferCancel, BitTransferChunk, BitTransferManifest,
    FileId, TransferPacket, MAX_CHUNK_PAYLOAD,
};
use meshwire_core::wire::{WireError, MAX_VALUE_LEN};

/// Incoming transfers tracked at once; further manifests are refused until
/// one completes or is cancelled.
pub const MAX_PENDING_INCOMING: usize = 64;

/// Recently assembled transfers remembered so retransmitted chunks can be
/// re-acknowledged after the final ack was lost.
pub const COMPLETED_MEMORY: usize = 64;

fn short_id(id: &FileId) -> String {
    hex::encode(&id[..8])
}

// ── Manifest ──────────────────────────────────────────────────────────────────

/// Describe `data` as a new transfer with a fresh random file id.
pub fn build_manifest(
    file_name: &str,
    mime_type: &str,
    data: &[u8],
    chunk_size: usize,
) -> Result<BitTransferManifest, TransferError> {
    let total_chunks = chunk_count(data.len(), chunk_size)?;

    if file_name.len() > MAX_VALUE_LEN {
        return Err(WireError::ValueTooLong {
            kind: manifest_field::FILE_NAME,
            len: file_name.len(),
        }
        .into());
    }
    if mime_type.len() > MAX_VALUE_LEN {
        return Err(WireError::ValueTooLong {
            kind: manifest_field::MIME_TYPE,
            len: mime_type.len(),
        }
        .into());
    }

    Ok(BitTransferManifest {
        file_id: crypto::generate_file_id(),
        file_name: file_name.to_string(),
        mime_type: mime_type.to_string(),
        file_size: data.len() as u64,
        total_chunks,
        file_hash: crypto::hash(data),
    })
}

/// `ceil(len / chunk_size)`, checked against the chunk size range and u32.
fn chunk_count(len: usize, chunk_size: usize) -> Result<u32, TransferError> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_PAYLOAD {
        return Err(TransferError::InvalidChunkSize(chunk_size));
    }
    u32::try_from(len.div_ceil(chunk_size))
        .map_err(|_| TransferError::TooManyChunks { len, chunk_size })
}

// ── State ─────────────────────────────────────────────────────────────────────

struct OutgoingTransfer {
    manifest: BitTransferManifest,
    data: Bytes,
    chunk_size: usize,
    next_index: u32,
    last_acked: Option<u32>,
}

impl OutgoingTransfer {
    fn chunk(&self, index: u32) -> BitTransferChunk {
        let start = index as usize * self.chunk_size;
        let end = (start + self.chunk_size).min(self.data.len());
        BitTransferChunk::new(
            self.manifest.file_id,
            index,
            self.manifest.total_chunks,
            self.data[start..end].to_vec(),
        )
    }
}

struct IncomingTransfer {
    manifest: BitTransferManifest,
    chunks: BTreeMap<u32, Bytes>,
}

impl IncomingTransfer {
    /// Number of chunks received contiguously from index 0.
    fn contiguous(&self) -> u32 {
        self.chunks
            .keys()
            .zip(0u32..)
            .take_while(|(index, expected)| **index == *expected)
            .count() as u32
    }

    fn is_complete(&self) -> bool {
        self.chunks.len() as u64 == u64::from(self.manifest.total_chunks)
    }
}

/// Snapshot of one outgoing transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutgoingProgress {
    pub total_chunks: u32,
    /// Next index `next_chunks` will emit.
    pub next_index: u32,
    pub last_acked: Option<u32>,
}

/// Snapshot of one incoming transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingProgress {
    pub total_chunks: u32,
    /// Distinct chunks stored, in any order.
    pub received: u32,
    /// Chunks received without a gap from index 0.
    pub contiguous: u32,
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Per-peer transfer state. Clones share the same maps.
///
/// Every mutation goes through a single map entry, so operations on one
/// transfer are linearized while distinct transfers proceed independently.
#[derive(Clone, Default)]
pub struct TransferEngine {
    outgoing: Arc<DashMap<FileId, OutgoingTransfer>>,
    incoming: Arc<DashMap<FileId, IncomingTransfer>>,
    completed: Arc<Mutex<VecDeque<(FileId, u32)>>>,
}

impl TransferEngine {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Sender ────────────────────────────────────────────────────────────────

    /// Register an outgoing transfer for `manifest`, emitting from index 0.
    ///
    /// `data` must be the buffer the manifest was built from and `chunk_size`
    /// the size it was built with. A zero-chunk transfer needs no
    /// acknowledgment, so no state is kept for it.
    pub fn start_send(
        &self,
        manifest: BitTransferManifest,
        data: impl Into<Bytes>,
        chunk_size: usize,
    ) -> Result<(), TransferError> {
        let data = data.into();
        let total_chunks = chunk_count(data.len(), chunk_size)?;

        let matches = manifest.file_size == data.len() as u64
            && manifest.total_chunks == total_chunks
            && bool::from(crypto::hash(&data)[..].ct_eq(&manifest.file_hash[..]));
        if !matches {
            return Err(TransferError::ManifestMismatch(manifest.file_id));
        }
        let slot = match self.outgoing.entry(manifest.file_id) {
            Entry::Occupied(_) => return Err(TransferError::AlreadyActive(manifest.file_id)),
            Entry::Vacant(slot) => slot,
        };

        tracing::info!(
            file_id = %short_id(&manifest.file_id),
            file_name = %manifest.file_name,
            bytes = manifest.file_size,
            chunks = total_chunks,
            "transfer started"
        );

        if total_chunks == 0 {
            return Ok(());
        }

        slot.insert(OutgoingTransfer {
            manifest,
            data,
            chunk_size,
            next_index: 0,
            last_acked: None,
        });
        Ok(())
    }

    /// Build a manifest for `data` and register it in one step.
    pub fn send(
        &self,
        file_name: &str,
        mime_type: &str,
        data: impl Into<Bytes>,
        chunk_size: usize,
    ) -> Result<BitTransferManifest, TransferError> {
        let data = data.into();
        let manifest = build_manifest(file_name, mime_type, &data, chunk_size)?;
        self.start_send(manifest.clone(), data, chunk_size)?;
        Ok(manifest)
    }

    /// Emit up to `window` chunks starting at the transfer's next index.
    ///
    /// Returns an empty list for unknown or fully emitted transfers.
    pub fn next_chunks(&self, file_id: &FileId, window: usize) -> Vec<BitTransferChunk> {
        let mut state = match self.outgoing.get_mut(file_id) {
            Some(s) => s,
            None => return Vec::new(),
        };

        let total = state.manifest.total_chunks;
        let mut chunks = Vec::with_capacity(window.min(total as usize));
        while chunks.len() < window && state.next_index < total {
            chunks.push(state.chunk(state.next_index));
            state.next_index += 1;
        }
        chunks
    }

    /// Re-materialize any chunk of an outgoing transfer.
    pub fn chunk_at(&self, file_id: &FileId, index: u32) -> Option<BitTransferChunk> {
        let state = self.outgoing.get(file_id)?;
        (index < state.manifest.total_chunks).then(|| state.chunk(index))
    }

    /// Move the emission point back to the first unacknowledged chunk.
    ///
    /// Returns false for unknown transfers.
    pub fn rewind(&self, file_id: &FileId) -> bool {
        match self.outgoing.get_mut(file_id) {
            Some(mut state) => {
                let from = state.last_acked.map_or(0, |n| n + 1);
                if from < state.next_index {
                    tracing::debug!(
                        file_id = %short_id(file_id),
                        from,
                        was = state.next_index,
                        "rewinding transfer"
                    );
                }
                state.next_index = from;
                true
            }
            None => false,
        }
    }

    /// Highest index the receiver has confirmed contiguously.
    pub fn last_acked(&self, file_id: &FileId) -> Option<u32> {
        self.outgoing.get(file_id).and_then(|s| s.last_acked)
    }

    /// Merge an acknowledgment. Returns true once the final chunk is covered,
    /// at which point the outgoing state is discarded.
    pub fn handle_ack(&self, ack: &BitTransferAck) -> bool {
        let finished = {
            let mut state = match self.outgoing.get_mut(&ack.file_id) {
                Some(s) => s,
                None => return false,
            };
            let total = state.manifest.total_chunks;
            if ack.acked_up_to >= total {
                tracing::warn!(
                    file_id = %short_id(&ack.file_id),
                    acked_up_to = ack.acked_up_to,
                    total,
                    "ignoring ack past the last chunk"
                );
                return false;
            }
            let merged = state
                .last_acked
                .map_or(ack.acked_up_to, |prev| prev.max(ack.acked_up_to));
            state.last_acked = Some(merged);
            merged + 1 == total
        };

        if finished && self.outgoing.remove(&ack.file_id).is_some() {
            tracing::info!(file_id = %short_id(&ack.file_id), "transfer acknowledged");
        }
        finished
    }

    pub fn outgoing_progress(&self, file_id: &FileId) -> Option<OutgoingProgress> {
        self.outgoing.get(file_id).map(|s| OutgoingProgress {
            total_chunks: s.manifest.total_chunks,
            next_index: s.next_index,
            last_acked: s.last_acked,
        })
    }

    pub fn outgoing_ids(&self) -> Vec<FileId> {
        self.outgoing.iter().map(|e| *e.key()).collect()
    }

    // ── Receiver ──────────────────────────────────────────────────────────────

    /// Start tracking an incoming transfer.
    ///
    /// Repeated manifests and manifests of recently completed transfers are
    /// ignored. Returns false when the manifest is refused because
    /// `MAX_PENDING_INCOMING` transfers are already open; callers should
    /// cancel transfers that stall.
    pub fn handle_manifest(&self, manifest: BitTransferManifest) -> bool {
        let file_id = manifest.file_id;
        if self.completed_total(&file_id).is_some() {
            return true;
        }
        if self.incoming.len() >= MAX_PENDING_INCOMING && !self.incoming.contains_key(&file_id) {
            tracing::warn!(
                file_id = %short_id(&file_id),
                pending = MAX_PENDING_INCOMING,
                "too many incoming transfers, manifest refused"
            );
            return false;
        }

        if let Entry::Vacant(slot) = self.incoming.entry(file_id) {
            slot.insert(IncomingTransfer {
                manifest,
                chunks: BTreeMap::new(),
            });
            tracing::debug!(file_id = %short_id(&file_id), "incoming transfer registered");
        }
        true
    }

    /// Store a verified chunk and report the contiguous prefix received.
    ///
    /// Returns `None` when the transfer is unknown, the chunk fails
    /// validation, or index 0 has not arrived yet.
    pub fn handle_chunk(&self, chunk: BitTransferChunk) -> Option<BitTransferAck> {
        let mut state = match self.incoming.get_mut(&chunk.file_id) {
            Some(s) => s,
            None => {
                if let Some(total) = self.completed_total(&chunk.file_id) {
                    // Our final ack was lost; confirm the whole file again.
                    return (chunk.index < total && total > 0).then(|| BitTransferAck {
                        file_id: chunk.file_id,
                        acked_up_to: total - 1,
                    });
                }
                tracing::debug!(
                    file_id = %short_id(&chunk.file_id),
                    index = chunk.index,
                    "chunk for unknown transfer dropped"
                );
                return None;
            }
        };

        let total = state.manifest.total_chunks;
        if chunk.total_chunks != total || chunk.index >= total {
            tracing::warn!(
                file_id = %short_id(&chunk.file_id),
                index = chunk.index,
                chunk_total = chunk.total_chunks,
                total,
                "chunk outside manifest rejected"
            );
            return None;
        }
        if !chunk.verify() {
            tracing::warn!(
                file_id = %short_id(&chunk.file_id),
                index = chunk.index,
                "chunk hash mismatch, dropped"
            );
            return None;
        }

        state.chunks.insert(chunk.index, Bytes::from(chunk.payload));

        match state.contiguous() {
            0 => None,
            n => Some(BitTransferAck {
                file_id: chunk.file_id,
                acked_up_to: n - 1,
            }),
        }
    }

    /// Return the file once every chunk is present and the whole-file hash
    /// matches the manifest.
    ///
    /// `Ok(None)` while incomplete or for unknown transfers. A complete
    /// transfer is discarded whether or not it verifies.
    pub fn assemble_if_complete(&self, file_id: &FileId) -> Result<Option<Bytes>, TransferError> {
        let complete = match self.incoming.get(file_id) {
            Some(state) => state.is_complete(),
            None => return Ok(None),
        };
        if !complete {
            return Ok(None);
        }
        let (_, state) = match self.incoming.remove(file_id) {
            Some(entry) => entry,
            None => return Ok(None),
        };

        let len: usize = state.chunks.values().map(Bytes::len).sum();
        let mut file = BytesMut::with_capacity(len);
        let mut hasher = Hasher::new();
        for payload in state.chunks.values() {
            hasher.update(payload);
            file.extend_from_slice(payload);
        }

        let hash_ok: bool = hasher.finalize()[..]
            .ct_eq(&state.manifest.file_hash[..])
            .into();
        if !hash_ok || len as u64 != state.manifest.file_size {
            tracing::warn!(
                file_id = %short_id(file_id),
                bytes = len,
                expected = state.manifest.file_size,
                "assembled file failed verification"
            );
            return Err(TransferError::FileHashMismatch(*file_id));
        }

        self.remember_completed(*file_id, state.manifest.total_chunks);
        tracing::info!(
            file_id = %short_id(file_id),
            file_name = %state.manifest.file_name,
            bytes = len,
            chunks = state.manifest.total_chunks,
            "file received and reassembled"
        );
        Ok(Some(file.freeze()))
    }

    pub fn incoming_progress(&self, file_id: &FileId) -> Option<IncomingProgress> {
        self.incoming.get(file_id).map(|s| IncomingProgress {
            total_chunks: s.manifest.total_chunks,
            received: s.chunks.len() as u32,
            contiguous: s.contiguous(),
        })
    }

    pub fn incoming_manifest(&self, file_id: &FileId) -> Option<BitTransferManifest> {
        self.incoming.get(file_id).map(|s| s.manifest.clone())
    }

    pub fn incoming_ids(&self) -> Vec<FileId> {
        self.incoming.iter().map(|e| *e.key()).collect()
    }

    /// Whether `file_id` was assembled recently enough to still be remembered.
    pub fn is_completed(&self, file_id: &FileId) -> bool {
        self.completed_total(file_id).is_some()
    }

    fn completed_total(&self, file_id: &FileId) -> Option<u32> {
        let completed = self.completed.lock().unwrap_or_else(PoisonError::into_inner);
        completed
            .iter()
            .find(|(id, _)| id == file_id)
            .map(|(_, total)| *total)
    }

    fn remember_completed(&self, file_id: FileId, total_chunks: u32) {
        let mut completed = self.completed.lock().unwrap_or_else(PoisonError::into_inner);
        if completed.len() >= COMPLETED_MEMORY {
            completed.pop_front();
        }
        completed.push_back((file_id, total_chunks));
    }

    // ── Cancellation and dispatch ─────────────────────────────────────────────

    /// Drop local state for `file_id` and return the packet telling the peer.
    pub fn cancel(&self, file_id: &FileId) -> BitTransferCancel {
        self.discard(file_id, "transfer cancelled locally");
        BitTransferCancel { file_id: *file_id }
    }

    pub fn handle_cancel(&self, cancel: &BitTransferCancel) {
        self.discard(&cancel.file_id, "transfer cancelled by peer");
    }

    fn discard(&self, file_id: &FileId, reason: &'static str) {
        let had_out = self.outgoing.remove(file_id).is_some();
        let had_in = self.incoming.remove(file_id).is_some();
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(id, _)| id != file_id);
        if had_out || had_in {
            tracing::info!(file_id = %short_id(file_id), "{reason}");
        }
    }

    /// Route an inbound transfer packet. Returns the response to send, if any.
    pub fn handle_packet(&self, packet: TransferPacket) -> Option<TransferPacket> {
        match packet {
            TransferPacket::Manifest(manifest) => {
                self.handle_manifest(manifest);
                None
            }
            TransferPacket::Chunk(chunk) => self.handle_chunk(chunk).map(TransferPacket::from),
            TransferPacket::Ack(ack) => {
                self.handle_ack(&ack);
                None
            }
            TransferPacket::Cancel(cancel) => {
                self.handle_cancel(&cancel);
                None
            }
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("chunk size {0} outside 1..={}", MAX_CHUNK_PAYLOAD)]
    InvalidChunkSize(usize),

    #[error("{len} bytes at chunk size {chunk_size} needs more than u32::MAX chunks")]
    TooManyChunks { len: usize, chunk_size: usize },

    #[error("data does not match the manifest for transfer {}", hex::encode(.0))]
    ManifestMismatch(FileId),

    #[error("transfer {} is already being sent", hex::encode(.0))]
    AlreadyActive(FileId),

    #[error("assembled file for transfer {} failed hash verification", hex::encode(.0))]
    FileHashMismatch(FileId),

    #[error(transparent)]
    Wire(#[from] WireError),
}
