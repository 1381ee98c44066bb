//! Incremental UTF-8 decoding for fragmented text messages.
//!
//! A code point may be split across two frames. [`decode`] takes the bytes left over from the
//! previous fragment, the new fragment and whether it is the last one, and returns the text
//! that is complete so far plus the (at most 3) bytes of a trailing, still incomplete sequence.
//! It holds no state of its own; the caller carries the [`Remainder`] between calls.

use crate::ProtocolError;

/// The incomplete tail of a UTF-8 sequence carried over to the next fragment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Remainder {
    buf: [u8; 3],
    len: usize,
}

impl Remainder {
    fn from_slice(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= 3);
        let mut buf = [0u8; 3];
        buf[..bytes.len()].copy_from_slice(bytes);
        Self {
            buf,
            len: bytes.len(),
        }
    }

    #[inline]
    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Length of the sequence introduced by `lead`, or 0 if `lead` cannot start one.
fn sequence_len(lead: u8) -> usize {
    match lead {
        0x00..=0x7F => 1,
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => 0,
    }
}

/// Outcome of validating one contiguous run of bytes.
enum Run<'a> {
    /// Every byte belongs to a complete code point.
    Complete(&'a str),
    /// The run ends in the middle of a code point starting at the returned offset.
    Incomplete(&'a str, &'a [u8]),
}

#[cfg(not(feature = "simd"))]
fn validate(input: &[u8]) -> Result<Run<'_>, ProtocolError> {
    match std::str::from_utf8(input) {
        Ok(text) => Ok(Run::Complete(text)),
        Err(err) if err.error_len().is_none() => {
            let (valid, tail) = input.split_at(err.valid_up_to());
            // SAFETY: `valid_up_to` is the length of the longest valid prefix
            let text = unsafe { std::str::from_utf8_unchecked(valid) };
            Ok(Run::Incomplete(text, tail))
        }
        Err(_) => Err(ProtocolError::InvalidUtf8),
    }
}

#[cfg(feature = "simd")]
fn validate(input: &[u8]) -> Result<Run<'_>, ProtocolError> {
    match simdutf8::compat::from_utf8(input) {
        Ok(text) => Ok(Run::Complete(text)),
        Err(err) if err.error_len().is_none() => {
            let (valid, tail) = input.split_at(err.valid_up_to());
            // SAFETY: `valid_up_to` is the length of the longest valid prefix
            let text = unsafe { std::str::from_utf8_unchecked(valid) };
            Ok(Run::Incomplete(text, tail))
        }
        Err(_) => Err(ProtocolError::InvalidUtf8),
    }
}

/// Decodes `input` as the continuation of a text message whose previous fragments left
/// `remainder` undecoded.
///
/// Returns the decoded text and the new remainder. With `is_final` set, any bytes that do not
/// form a complete code point are an error.
///
/// # Errors
/// [`ProtocolError::InvalidUtf8`] on an invalid sequence, or on an incomplete one at the end of
/// the final fragment.
pub(crate) fn decode(
    remainder: &Remainder,
    input: &[u8],
    is_final: bool,
) -> Result<(String, Remainder), ProtocolError> {
    let mut text = String::with_capacity(input.len() + remainder.len);
    let mut input = input;

    if !remainder.is_empty() {
        let pending = remainder.as_bytes();
        let needed = sequence_len(pending[0]).saturating_sub(pending.len());
        if needed == 0 {
            return Err(ProtocolError::InvalidUtf8);
        }

        let take = needed.min(input.len());
        let mut joined = [0u8; 4];
        joined[..pending.len()].copy_from_slice(pending);
        joined[pending.len()..pending.len() + take].copy_from_slice(&input[..take]);
        let joined = &joined[..pending.len() + take];

        match validate(joined)? {
            Run::Complete(code_point) => text.push_str(code_point),
            // the fragment was too short to finish the code point
            Run::Incomplete(_, tail) if take < needed => {
                if is_final {
                    return Err(ProtocolError::InvalidUtf8);
                }
                return Ok((text, Remainder::from_slice(tail)));
            }
            Run::Incomplete(..) => return Err(ProtocolError::InvalidUtf8),
        }

        input = &input[take..];
    }

    match validate(input)? {
        Run::Complete(valid) => {
            text.push_str(valid);
            Ok((text, Remainder::default()))
        }
        Run::Incomplete(valid, tail) => {
            if is_final {
                return Err(ProtocolError::InvalidUtf8);
            }
            text.push_str(valid);
            Ok((text, Remainder::from_slice(tail)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_split(bytes: &[u8], at: usize) -> Result<String, ProtocolError> {
        let (first, rest) = bytes.split_at(at);
        let (mut text, remainder) = decode(&Remainder::default(), first, false)?;
        let (tail, remainder) = decode(&remainder, rest, true)?;
        assert!(remainder.is_empty());
        text.push_str(&tail);
        Ok(text)
    }

    #[test]
    fn test_complete_input() {
        let (text, remainder) = decode(&Remainder::default(), "hello".as_bytes(), true).unwrap();
        assert_eq!(text, "hello");
        assert!(remainder.is_empty());
    }

    #[test]
    fn test_split_at_every_offset() {
        let original = "κόσμε €uro 𝄞 ok";
        let bytes = original.as_bytes();
        for at in 0..=bytes.len() {
            assert_eq!(decode_split(bytes, at).unwrap(), original, "split at {at}");
        }
    }

    #[test]
    fn test_remainder_is_carried() {
        // "€" is E2 82 AC
        let (text, remainder) = decode(&Remainder::default(), b"a\xE2\x82", false).unwrap();
        assert_eq!(text, "a");
        assert_eq!(remainder.as_bytes(), b"\xE2\x82");

        let (text, remainder) = decode(&remainder, b"\xAC!", true).unwrap();
        assert_eq!(text, "€!");
        assert!(remainder.is_empty());
    }

    #[test]
    fn test_code_point_spread_over_three_fragments() {
        // U+1D11E is F0 9D 84 9E
        let (text, remainder) = decode(&Remainder::default(), b"\xF0", false).unwrap();
        assert!(text.is_empty());
        let (text, remainder) = decode(&remainder, b"\x9D", false).unwrap();
        assert!(text.is_empty());
        assert_eq!(remainder.as_bytes(), b"\xF0\x9D");
        let (text, remainder) = decode(&remainder, b"\x84\x9E", true).unwrap();
        assert_eq!(text, "𝄞");
        assert!(remainder.is_empty());
    }

    #[test]
    fn test_incomplete_final_fragment() {
        assert_eq!(
            decode(&Remainder::default(), b"ok\xE2\x82", true).unwrap_err(),
            ProtocolError::InvalidUtf8
        );

        let (_, remainder) = decode(&Remainder::default(), b"\xE2", false).unwrap();
        assert_eq!(
            decode(&remainder, b"\x82", true).unwrap_err(),
            ProtocolError::InvalidUtf8
        );
    }

    #[test]
    fn test_invalid_sequences_fail_early() {
        // overlong encoding and a lone continuation byte
        for bytes in [&b"\xC0\xAF"[..], b"abc\x80", b"\xED\xA0\x80", b"\xF5\x80\x80\x80"] {
            assert_eq!(
                decode(&Remainder::default(), bytes, false).unwrap_err(),
                ProtocolError::InvalidUtf8,
                "{bytes:?}"
            );
        }

        // the carried lead byte is followed by something that is not a continuation
        let (_, remainder) = decode(&Remainder::default(), b"\xE2", false).unwrap();
        assert_eq!(
            decode(&remainder, b"A", false).unwrap_err(),
            ProtocolError::InvalidUtf8
        );
    }
}
