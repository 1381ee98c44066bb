//! Payload masking (RFC 6455 Section 5.3).
//!
//! Masking XORs every payload byte with one byte of a 4-byte key: `out[i] = in[i] ^ key[i % 4]`.
//! Applying the same key twice restores the input, so one function serves both directions.

/// Masks or unmasks `buf` in place with `key`.
#[inline]
pub(crate) fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    let word = u32::from_ne_bytes(key);
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let masked = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ word;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }
    // the tail starts on a multiple of 4, so the key lines up from its first byte again
    apply_mask_bytewise(chunks.into_remainder(), key);
}

/// Byte-at-a-time masking, used for the unaligned tail.
#[inline]
fn apply_mask_bytewise(buf: &mut [u8], key: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Generates a fresh masking key for a client-originated frame.
///
/// RFC 6455 only asks the key to be unpredictable to the application, not cryptographically
/// strong, so the thread-local generator is enough.
#[inline]
pub(crate) fn random_key() -> [u8; 4] {
    rand::random()
}
