//! meshwire wire format: the type-length-value record codec.
//!
//! Every packet kind is a sequence of records:
//!
//!   [type: u8] [length: u8] [value: length bytes]
//!
//! Values are at most 255 bytes. Integers inside values are big-endian and
//! text is UTF-8. Decoding is a single left-to-right scan that never reads
//! past the end of the buffer; a record whose declared length overruns the
//! buffer fails the whole decode.
//!
//! Tolerant packet kinds skip record types they do not know. Tagged packet
//! kinds (see `transfer`) prefix one closed-set tag byte before their records.

// ── Constants ─────────────────────────────────────────────────────────────────

/// Largest value a single record can carry.
pub const MAX_VALUE_LEN: usize = u8::MAX as usize;

/// Bytes of framing in front of every value (type + length).
pub const RECORD_HEADER_LEN: usize = 2;

// ── Records ───────────────────────────────────────────────────────────────────

/// One decoded record, borrowing its value from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub kind: u8,
    pub value: &'a [u8],
}

/// Append one record to `out`.
pub fn encode_record(out: &mut Vec<u8>, kind: u8, value: &[u8]) -> Result<(), WireError> {
    if value.len() > MAX_VALUE_LEN {
        return Err(WireError::ValueTooLong {
            kind,
            len: value.len(),
        });
    }
    out.reserve(RECORD_HEADER_LEN + value.len());
    out.push(kind);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
    Ok(())
}

/// Encode a single record into a fresh buffer.
pub fn encode(kind: u8, value: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + value.len());
    encode_record(&mut out, kind, value)?;
    Ok(out)
}

/// Decode every record in `buf`, in wire order.
pub fn decode(buf: &[u8]) -> Result<Vec<Tlv<'_>>, WireError> {
    records(buf).collect()
}

/// Lazily scan the records in `buf`.
///
/// Yields at most one error, after which the iterator is exhausted.
pub fn records(buf: &[u8]) -> Records<'_> {
    Records {
        buf,
        pos: 0,
        failed: false,
    }
}

/// Iterator returned by [`records`].
pub struct Records<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Tlv<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos == self.buf.len() {
            return None;
        }

        let remaining = &self.buf[self.pos..];
        if remaining.len() < RECORD_HEADER_LEN {
            self.failed = true;
            return Some(Err(WireError::Truncated { offset: self.pos }));
        }

        let kind = remaining[0];
        let len = remaining[1] as usize;
        if remaining.len() - RECORD_HEADER_LEN < len {
            self.failed = true;
            return Some(Err(WireError::Truncated { offset: self.pos }));
        }

        let value = &remaining[RECORD_HEADER_LEN..RECORD_HEADER_LEN + len];
        self.pos += RECORD_HEADER_LEN + len;
        Some(Ok(Tlv { kind, value }))
    }
}

impl std::iter::FusedIterator for Records<'_> {}

// ── Field helpers ─────────────────────────────────────────────────────────────
//
// Shared by the packet decoders. Each one checks the exact width of a
// fixed-size field so a short or long value never reaches the caller.

/// Copy a fixed-width field value.
pub fn read_fixed<const N: usize>(kind: u8, value: &[u8]) -> Result<[u8; N], WireError> {
    value.try_into().map_err(|_| WireError::BadFieldLength {
        kind,
        expected: N,
        actual: value.len(),
    })
}

pub fn read_u32(kind: u8, value: &[u8]) -> Result<u32, WireError> {
    read_fixed::<4>(kind, value).map(u32::from_be_bytes)
}

pub fn read_u64(kind: u8, value: &[u8]) -> Result<u64, WireError> {
    read_fixed::<8>(kind, value).map(u64::from_be_bytes)
}

pub fn read_text(kind: u8, value: &[u8]) -> Result<String, WireError> {
    std::str::from_utf8(value)
        .map(str::to_owned)
        .map_err(|_| WireError::InvalidUtf8(kind))
}

/// Unwrap a field collected during a scan, or report it missing.
pub fn require<T>(field: Option<T>, kind: u8) -> Result<T, WireError> {
    field.ok_or(WireError::MissingField(kind))
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when encoding or interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("value for field 0x{kind:02x} is {len} bytes, maximum {}", MAX_VALUE_LEN)]
    ValueTooLong { kind: u8, len: usize },

    #[error("record at offset {offset} runs past the end of the buffer")]
    Truncated { offset: usize },

    #[error("empty packet")]
    Empty,

    #[error("unknown packet tag: 0x{0:02x}")]
    UnknownTag(u8),

    #[error("expected packet tag 0x{expected:02x}, found 0x{actual:02x}")]
    UnexpectedTag { expected: u8, actual: u8 },

    #[error("missing required field 0x{0:02x}")]
    MissingField(u8),

    #[error("field 0x{kind:02x} is {actual} bytes, expected {expected}")]
    BadFieldLength {
        kind: u8,
        expected: usize,
        actual: usize,
    },

    #[error("field 0x{0:02x} is not valid UTF-8")]
    InvalidUtf8(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
