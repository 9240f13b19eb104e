//! Tolerant packet kinds: announcement, private message, channel envelope.
//!
//! These packets carry no leading tag. Decoders scan every record, keep the
//! last occurrence of each known field, and skip unknown record types so new
//! optional fields can be added without breaking older peers. A packet that
//! is still missing a required field after the full scan fails to decode.

use crate::wire::{self, Tlv, WireError};

// ── Sizes ─────────────────────────────────────────────────────────────────────

/// Channel identifier length on the wire.
pub const CHANNEL_ID_LEN: usize = 16;

/// XChaCha20-Poly1305 nonce length.
pub const NONCE_LEN: usize = 24;

/// Poly1305 tag length.
pub const TAG_LEN: usize = 16;

// ── Field codes ───────────────────────────────────────────────────────────────

pub mod announcement_field {
    pub const NICKNAME: u8 = 0x01;
    pub const NOISE_PUBLIC_KEY: u8 = 0x02;
    pub const SIGNING_PUBLIC_KEY: u8 = 0x03;
}

pub mod private_message_field {
    pub const MESSAGE_ID: u8 = 0x00;
    pub const CONTENT: u8 = 0x01;
}

pub mod envelope_field {
    pub const CHANNEL_ID: u8 = 0x01;
    pub const NONCE: u8 = 0x02;
    pub const CIPHERTEXT: u8 = 0x03;
    pub const TAG: u8 = 0x04;
    pub const EPOCH: u8 = 0x05;
}

// ── Announcement ──────────────────────────────────────────────────────────────

/// Identity broadcast.
///
/// The key fields are opaque here; they are produced and consumed by the
/// key-agreement and signing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncementPacket {
    pub nickname: String,
    pub noise_public_key: Vec<u8>,
    pub signing_public_key: Vec<u8>,
}

impl AnnouncementPacket {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        use announcement_field::*;

        let mut out = Vec::new();
        wire::encode_record(&mut out, NICKNAME, self.nickname.as_bytes())?;
        wire::encode_record(&mut out, NOISE_PUBLIC_KEY, &self.noise_public_key)?;
        wire::encode_record(&mut out, SIGNING_PUBLIC_KEY, &self.signing_public_key)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        use announcement_field::*;

        let mut nickname = None;
        let mut noise_public_key = None;
        let mut signing_public_key = None;

        for record in wire::records(bytes) {
            let Tlv { kind, value } = record?;
            match kind {
                NICKNAME => nickname = Some(wire::read_text(kind, value)?),
                NOISE_PUBLIC_KEY => noise_public_key = Some(value.to_vec()),
                SIGNING_PUBLIC_KEY => signing_public_key = Some(value.to_vec()),
                _ => {}
            }
        }

        Ok(Self {
            nickname: wire::require(nickname, NICKNAME)?,
            noise_public_key: wire::require(noise_public_key, NOISE_PUBLIC_KEY)?,
            signing_public_key: wire::require(signing_public_key, SIGNING_PUBLIC_KEY)?,
        })
    }
}

// ── Private message ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateMessagePacket {
    pub message_id: String,
    pub content: String,
}

impl PrivateMessagePacket {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        use private_message_field::*;

        let mut out = Vec::new();
        wire::encode_record(&mut out, MESSAGE_ID, self.message_id.as_bytes())?;
        wire::encode_record(&mut out, CONTENT, self.content.as_bytes())?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        use private_message_field::*;

        let mut message_id = None;
        let mut content = None;

        for record in wire::records(bytes) {
            let Tlv { kind, value } = record?;
            match kind {
                MESSAGE_ID => message_id = Some(wire::read_text(kind, value)?),
                CONTENT => content = Some(wire::read_text(kind, value)?),
                _ => {}
            }
        }

        Ok(Self {
            message_id: wire::require(message_id, MESSAGE_ID)?,
            content: wire::require(content, CONTENT)?,
        })
    }
}

// ── Channel envelope ──────────────────────────────────────────────────────────

/// Authenticated envelope for one ciphertext unit on a password channel.
///
/// Produced by [`crate::crypto::ChannelKey::seal`]. The ciphertext is the
/// same length as the plaintext; the Poly1305 tag travels separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEncryptedPacket {
    pub channel_id: [u8; CHANNEL_ID_LEN],
    /// Key epoch the envelope was sealed under. Always 0 for static keys.
    pub epoch: u64,
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

impl ChannelEncryptedPacket {
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        use envelope_field::*;

        let mut out = Vec::with_capacity(
            5 * wire::RECORD_HEADER_LEN + CHANNEL_ID_LEN + 8 + NONCE_LEN + TAG_LEN
                + self.ciphertext.len(),
        );
        wire::encode_record(&mut out, CHANNEL_ID, &self.channel_id)?;
        wire::encode_record(&mut out, EPOCH, &self.epoch.to_be_bytes())?;
        wire::encode_record(&mut out, NONCE, &self.nonce)?;
        wire::encode_record(&mut out, CIPHERTEXT, &self.ciphertext)?;
        wire::encode_record(&mut out, TAG, &self.tag)?;
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        use envelope_field::*;

        let mut channel_id = None;
        let mut epoch = None;
        let mut nonce = None;
        let mut ciphertext = None;
        let mut tag = None;

        for record in wire::records(bytes) {
            let Tlv { kind, value } = record?;
            match kind {
                CHANNEL_ID => channel_id = Some(wire::read_fixed(kind, value)?),
                EPOCH => epoch = Some(wire::read_u64(kind, value)?),
                NONCE => nonce = Some(wire::read_fixed(kind, value)?),
                CIPHERTEXT => ciphertext = Some(value.to_vec()),
                TAG => tag = Some(wire::read_fixed(kind, value)?),
                _ => {}
            }
        }

        Ok(Self {
            channel_id: wire::require(channel_id, CHANNEL_ID)?,
            epoch: wire::require(epoch, EPOCH)?,
            nonce: wire::require(nonce, NONCE)?,
            ciphertext: wire::require(ciphertext, CIPHERTEXT)?,
            tag: wire::require(tag, TAG)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
