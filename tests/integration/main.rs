//! meshwire integration test harness.
//!
//! Every test runs in-process: each `Peer` owns its own channel registry,
//! transfer engine and store, and peers talk only through encoded bytes
//! passed over a `Link`. A link can drop and reorder frames; seeded links
//! keep failures reproducible.
//!
//!   cargo test --test integration

use anyhow::{bail, Result};
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;

use meshwire_core::crypto::MAX_PLAINTEXT_LEN;
use meshwire_core::transfer::{tag, TransferPacket};
use meshwire_core::{BitTransferManifest, ChannelEncryptedPacket};
use meshwire_services::{ChannelRegistry, MemoryStore, TransferEngine};

mod channels;
mod transfer;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Associated data bound into every sealed transfer frame.
pub const TRANSFER_AAD: &[u8] = b"meshwire-transfer";

/// One simulated node.
pub struct Peer {
    pub name: &'static str,
    pub store: MemoryStore,
    pub channels: ChannelRegistry,
    pub transfers: TransferEngine,
}

impl Peer {
    pub fn new(name: &'static str) -> Self {
        Self::with_epoch(name, 0)
    }

    pub fn with_epoch(name: &'static str, epoch_length_secs: u64) -> Self {
        let store = MemoryStore::new();
        Self {
            name,
            channels: ChannelRegistry::new(Arc::new(store.clone()), epoch_length_secs),
            store,
            transfers: TransferEngine::new(),
        }
    }

    /// Encode a transfer packet, sealing it with the active channel when one
    /// exists and the packet fits in an envelope.
    pub fn frame(&self, packet: &TransferPacket) -> Result<Vec<u8>> {
        let bytes = packet.encode()?;
        if bytes.len() > MAX_PLAINTEXT_LEN {
            return Ok(bytes);
        }
        match self.channels.seal_active(&bytes, TRANSFER_AAD)? {
            Some(envelope) => Ok(envelope.encode()?),
            None => Ok(bytes),
        }
    }

    /// Decode an inbound frame, opening envelopes with any joined channel.
    pub fn unframe(&self, frame: &[u8]) -> Option<TransferPacket> {
        match frame.first() {
            Some(&t) if (tag::MANIFEST..=tag::CANCEL).contains(&t) => {
                TransferPacket::decode(frame).ok()
            }
            _ => {
                let envelope = ChannelEncryptedPacket::decode(frame).ok()?;
                let (_, plaintext) = self.channels.open_with_known(&envelope, TRANSFER_AAD)?;
                TransferPacket::decode(&plaintext).ok()
            }
        }
    }

    /// Feed one frame to this peer's engine, returning the framed reply.
    pub fn receive(&self, frame: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.unframe(frame) {
            Some(packet) => match self.transfers.handle_packet(packet) {
                Some(reply) => Ok(Some(self.frame(&reply)?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }
}

/// A one-way frame queue that may drop and reorder.
pub struct Link {
    rng: StdRng,
    loss_percent: u8,
    reorder: bool,
    in_flight: Vec<Vec<u8>>,
    pub dropped: usize,
}

impl Link {
    /// No loss, delivery in send order.
    pub fn reliable() -> Self {
        Self {
            reorder: false,
            ..Self::lossy(0, 0)
        }
    }

    /// Drops `loss_percent` of frames and shuffles the rest.
    pub fn lossy(loss_percent: u8, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            loss_percent,
            reorder: true,
            in_flight: Vec::new(),
            dropped: 0,
        }
    }

    pub fn send(&mut self, frame: Vec<u8>) {
        if self.rng.gen_range(0..100u8) < self.loss_percent {
            self.dropped += 1;
        } else {
            self.in_flight.push(frame);
        }
    }

    /// Drain everything in flight.
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        let mut frames = std::mem::take(&mut self.in_flight);
        if self.reorder {
            frames.shuffle(&mut self.rng);
        }
        frames
    }
}

/// Drive a transfer from `sender` to `receiver` until the receiver
/// assembles it, retransmitting from the last ack whenever the sender has
/// emitted everything. Returns the assembled bytes and the number of rounds.
pub fn run_transfer(
    sender: &Peer,
    receiver: &Peer,
    manifest: &BitTransferManifest,
    window: usize,
    uplink: &mut Link,
    downlink: &mut Link,
    max_rounds: u32,
) -> Result<(Bytes, u32)> {
    let file_id = manifest.file_id;
    let manifest = TransferPacket::from(manifest.clone());

    for round in 1..=max_rounds {
        if receiver.transfers.incoming_progress(&file_id).is_none() {
            uplink.send(sender.frame(&manifest)?);
        }
        let mut chunks = sender.transfers.next_chunks(&file_id, window);
        if chunks.is_empty() {
            sender.transfers.rewind(&file_id);
            chunks = sender.transfers.next_chunks(&file_id, window);
        }
        for chunk in chunks {
            uplink.send(sender.frame(&TransferPacket::from(chunk))?);
        }

        for frame in uplink.drain() {
            if let Some(reply) = receiver.receive(&frame)? {
                downlink.send(reply);
            }
        }
        let assembled = receiver.transfers.assemble_if_complete(&file_id)?;

        for frame in downlink.drain() {
            sender.receive(&frame)?;
        }

        if let Some(file) = assembled {
            return Ok((file, round));
        }
    }

    bail!("transfer from {} did not complete in {max_rounds} rounds", sender.name)
}

/// Start a transfer on `sender`.
pub fn start_transfer(
    sender: &Peer,
    file_name: &str,
    data: &[u8],
    chunk_size: usize,
) -> Result<BitTransferManifest> {
    Ok(sender
        .transfers
        .send(file_name, "application/octet-stream", data.to_vec(), chunk_size)?)
}

/// Deterministic test payload.
pub fn payload(len: usize, salt: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(salt))
        .collect()
}

/// Fresh per-test directory under the system temp dir.
pub fn temp_dir(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("meshwire-it-{test}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}
