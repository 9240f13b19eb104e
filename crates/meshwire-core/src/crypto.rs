//! Cryptographic primitives for meshwire.
//!
//! Provides two things:
//!   1. BLAKE3 content hashing for chunks and whole files
//!   2. Password channels: a symmetric key and a public channel id derived
//!      from (channel name, password), and XChaCha20-Poly1305 envelopes
//!
//! Two peers that know the same name and password derive identical keys
//! without any handshake. The channel id is a non-secret fingerprint of the
//! key used to pick a candidate key for an incoming envelope.
//!
//! Key material derives ZeroizeOnDrop and is wiped from memory when dropped.
//! There is no unsafe code in this module.

use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{Key, KeyInit, Tag, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use static_assertions::const_assert;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::packet::{ChannelEncryptedPacket, CHANNEL_ID_LEN, NONCE_LEN, TAG_LEN};
use crate::wire::MAX_VALUE_LEN;

type HmacSha256 = Hmac<Sha256>;

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
///
/// Used for chunk hashes and whole-file hashes.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Incremental BLAKE3 hasher for payloads that arrive in pieces.
///
/// # Example
/// ```
/// use meshwire_core::crypto::Hasher;
/// let mut h = Hasher::new();
/// h.update(b"hello ");
/// h.update(b"world");
/// let digest = h.finalize();
/// assert_eq!(digest, meshwire_core::crypto::hash(b"hello world"));
/// ```
pub struct Hasher(blake3::Hasher);

impl Hasher {
    pub fn new() -> Self {
        Self(blake3::Hasher::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        *self.0.finalize().as_bytes()
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

// ── Randomness ────────────────────────────────────────────────────────────────

/// Generate a fresh random envelope nonce.
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Generate a random 16-byte transfer identifier.
pub fn generate_file_id() -> [u8; 16] {
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

// ── Channel keys ──────────────────────────────────────────────────────────────

/// Application namespace mixed into every derivation. Peers only interoperate
/// when this string matches exactly.
pub const APP_DOMAIN: &str = "meshwire";

const KEY_PREIMAGE_PREFIX: &str = "meshwire:chan:v1|";
const CHANNEL_KDF_INFO: &[u8] = b"meshwire-channel-v1";
const EPOCH_KDF_INFO: &[u8] = b"meshwire-epoch-v1";
const CHANNEL_ID_LABEL: &[u8] = b"id";

/// Symmetric channel key length.
pub const KEY_LEN: usize = 32;

/// Largest plaintext one envelope can carry. The ciphertext is the same
/// length and must fit one TLV value.
pub const MAX_PLAINTEXT_LEN: usize = MAX_VALUE_LEN;

/// Persisted record: key(32) ‖ channel id(16) ‖ epoch length(8, BE).
pub const PERSISTED_KEY_LEN: usize = KEY_LEN + CHANNEL_ID_LEN + 8;

const_assert!(MAX_PLAINTEXT_LEN <= MAX_VALUE_LEN);

pub type ChannelId = [u8; CHANNEL_ID_LEN];

/// Canonical form of a channel name: trimmed, lower-cased, one leading `#`
/// removed. `"#Foo "` and `"foo"` name the same channel.
pub fn normalize_channel_name(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    match lowered.strip_prefix('#') {
        Some(rest) => rest.to_string(),
        None => lowered,
    }
}

/// Key and identifier for one password channel.
///
/// Derived once per (name, password) and never regenerated unless the
/// channel is rejoined. With `epoch_length_secs == 0` the key is static;
/// otherwise each envelope is sealed under a per-epoch key expanded from it.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChannelKey {
    key: [u8; KEY_LEN],
    #[zeroize(skip)]
    channel_id: ChannelId,
    #[zeroize(skip)]
    epoch_length_secs: u64,
}

impl ChannelKey {
    /// Derive a static channel key.
    pub fn derive(name: &str, password: &str) -> Self {
        Self::derive_with_epoch(name, password, 0)
    }

    /// Derive a channel key that rotates every `epoch_length_secs` seconds.
    /// Zero disables rotation.
    pub fn derive_with_epoch(name: &str, password: &str, epoch_length_secs: u64) -> Self {
        let normalized = normalize_channel_name(name);

        let mut preimage = Zeroizing::new(String::with_capacity(
            KEY_PREIMAGE_PREFIX.len() + normalized.len() + 1 + password.len(),
        ));
        preimage.push_str(KEY_PREIMAGE_PREFIX);
        preimage.push_str(&normalized);
        preimage.push('|');
        preimage.push_str(password);

        let ikm: Zeroizing<[u8; 32]> = Zeroizing::new(Sha256::digest(preimage.as_bytes()).into());
        let key = hkdf_expand(&*ikm, &[CHANNEL_KDF_INFO]);
        let channel_id = channel_id_for(&key);

        Self {
            key,
            channel_id,
            epoch_length_secs,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn epoch_length_secs(&self) -> u64 {
        self.epoch_length_secs
    }

    /// Epoch an envelope sealed at `now_secs` carries.
    pub fn epoch_at(&self, now_secs: u64) -> u64 {
        if self.epoch_length_secs == 0 {
            0
        } else {
            now_secs / self.epoch_length_secs
        }
    }

    /// Seal `plaintext` into an envelope using the current wall clock.
    pub fn seal(
        &self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<ChannelEncryptedPacket, CryptoError> {
        self.seal_at(plaintext, associated_data, unix_now())
    }

    /// Seal `plaintext` as of `now_secs` (seconds since the Unix epoch).
    ///
    /// A fresh random nonce is drawn for every call. The authenticated data
    /// is `associated_data ‖ channel_id`.
    pub fn seal_at(
        &self,
        plaintext: &[u8],
        associated_data: &[u8],
        now_secs: u64,
    ) -> Result<ChannelEncryptedPacket, CryptoError> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(CryptoError::PlaintextTooLarge(plaintext.len()));
        }

        let epoch = self.epoch_at(now_secs);
        let key = self.epoch_key(epoch);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&*key));
        let nonce = generate_nonce();
        let aad = self.aad(associated_data);

        let mut ciphertext = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(XNonce::from_slice(&nonce), &aad, &mut ciphertext)
            .map_err(|_| CryptoError::SealFailed)?;

        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(&tag);

        Ok(ChannelEncryptedPacket {
            channel_id: self.channel_id,
            epoch,
            nonce,
            ciphertext,
            tag: tag_bytes,
        })
    }

    /// Open an envelope with this key.
    ///
    /// Returns `Ok(None)` when the envelope belongs to another channel, so a
    /// receiver can try each known key in turn. Returns an error only when
    /// the channel id matches and authentication still fails.
    pub fn open(
        &self,
        packet: &ChannelEncryptedPacket,
        associated_data: &[u8],
    ) -> Result<Option<Vec<u8>>, CryptoError> {
        if packet.channel_id != self.channel_id {
            return Ok(None);
        }
        if self.epoch_length_secs == 0 && packet.epoch != 0 {
            return Err(CryptoError::UnexpectedEpoch(packet.epoch));
        }

        let key = self.epoch_key(packet.epoch);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&*key));
        let aad = self.aad(associated_data);

        let mut plaintext = packet.ciphertext.clone();
        cipher
            .decrypt_in_place_detached(
                XNonce::from_slice(&packet.nonce),
                &aad,
                &mut plaintext,
                Tag::from_slice(&packet.tag),
            )
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        Ok(Some(plaintext))
    }

    /// Serialize for the secure store.
    pub fn to_bytes(&self) -> Zeroizing<[u8; PERSISTED_KEY_LEN]> {
        let mut out = Zeroizing::new([0u8; PERSISTED_KEY_LEN]);
        out[..KEY_LEN].copy_from_slice(&self.key);
        out[KEY_LEN..KEY_LEN + CHANNEL_ID_LEN].copy_from_slice(&self.channel_id);
        out[KEY_LEN + CHANNEL_ID_LEN..].copy_from_slice(&self.epoch_length_secs.to_be_bytes());
        out
    }

    /// Reconstruct a key from its persisted record.
    ///
    /// The stored channel id must match the id recomputed from the key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PERSISTED_KEY_LEN {
            return Err(CryptoError::BadKeyRecord(bytes.len()));
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes[..KEY_LEN]);
        let mut stored_id = [0u8; CHANNEL_ID_LEN];
        stored_id.copy_from_slice(&bytes[KEY_LEN..KEY_LEN + CHANNEL_ID_LEN]);
        let mut epoch = [0u8; 8];
        epoch.copy_from_slice(&bytes[KEY_LEN + CHANNEL_ID_LEN..]);

        let channel_id = channel_id_for(&key);
        if channel_id != stored_id {
            key.zeroize();
            return Err(CryptoError::ChannelIdMismatch);
        }

        Ok(Self {
            key,
            channel_id,
            epoch_length_secs: u64::from_be_bytes(epoch),
        })
    }

    fn epoch_key(&self, epoch: u64) -> Zeroizing<[u8; KEY_LEN]> {
        if self.epoch_length_secs == 0 {
            return Zeroizing::new(self.key);
        }
        Zeroizing::new(hkdf_expand(
            &self.key,
            &[EPOCH_KDF_INFO, &epoch.to_be_bytes()[..]],
        ))
    }

    fn aad(&self, associated_data: &[u8]) -> Vec<u8> {
        let mut aad = Vec::with_capacity(associated_data.len() + CHANNEL_ID_LEN);
        aad.extend_from_slice(associated_data);
        aad.extend_from_slice(&self.channel_id);
        aad
    }
}

impl PartialEq for ChannelKey {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.key[..].ct_eq(&other.key[..]))
            && self.channel_id == other.channel_id
            && self.epoch_length_secs == other.epoch_length_secs
    }
}

impl Eq for ChannelKey {}

impl std::fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelKey")
            .field("channel_id", &self.channel_id)
            .field("epoch_length_secs", &self.epoch_length_secs)
            .finish_non_exhaustive()
    }
}

/// HKDF-SHA256 with an empty salt, expanded to one key.
fn hkdf_expand(ikm: &[u8], info: &[&[u8]]) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_LEN];
    hk.expand_multi_info(info, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// First 16 bytes of HMAC-SHA256(key, "id").
fn channel_id_for(key: &[u8; KEY_LEN]) -> ChannelId {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(CHANNEL_ID_LABEL);
    let full = mac.finalize().into_bytes();

    let mut id = [0u8; CHANNEL_ID_LEN];
    id.copy_from_slice(&full[..CHANNEL_ID_LEN]);
    id
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("plaintext is {0} bytes, an envelope carries at most {}", MAX_PLAINTEXT_LEN)]
    PlaintextTooLarge(usize),

    #[error("envelope failed authentication")]
    AuthenticationFailed,

    #[error("envelope carries epoch {0} but the channel key does not rotate")]
    UnexpectedEpoch(u64),

    #[error("envelope encryption failed")]
    SealFailed,

    #[error("persisted key record is {0} bytes, expected {}", PERSISTED_KEY_LEN)]
    BadKeyRecord(usize),

    #[error("persisted channel id does not match its key")]
    ChannelIdMismatch,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
