//! String/byte-slice/rune conversions and slice growth. UTF-8 codec and the
//! `growslice` capacity policy, the primitives compiler-emitted code for
//! `[]byte(s)`, `string(b)`, `[]rune(s)`, `string(runes)`, and `append`
//! lowers to.

use alloc::string::String;
use alloc::vec::Vec;

/// Replacement character used for invalid UTF-8 sequences.
pub const RUNE_ERROR: char = '\u{FFFD}';

/// Decode one rune starting at `bytes[0]`, returning `(rune, width)`.
/// Invalid or truncated encodings decode as `(RUNE_ERROR, 1)`, resyncing one
/// byte at a time.
#[must_use]
pub fn decode_rune(bytes: &[u8]) -> (char, usize) {
    if bytes.is_empty() {
        return (RUNE_ERROR, 0);
    }
    match core::str::from_utf8(&bytes[..bytes.len().min(4)]) {
        Ok(s) => {
            let c = s.chars().next().unwrap_or(RUNE_ERROR);
            (c, c.len_utf8())
        }
        Err(e) => {
            if e.valid_up_to() > 0 {
                let s = core::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default();
                if let Some(c) = s.chars().next() {
                    return (c, c.len_utf8());
                }
            }
            (RUNE_ERROR, 1)
        }
    }
}

/// Build a `String` by copying `bytes`, replacing invalid UTF-8 with
/// [`RUNE_ERROR`] the way a `string([]byte)` conversion does (never fails,
/// unlike [`core::str::from_utf8`]).
#[must_use]
pub fn slicebytetostring(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// The UTF-8 bytes backing `s`, copied into a fresh owned buffer.
#[must_use]
pub fn stringtoslicebyte(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

/// Decode `s` into its sequence of runes.
#[must_use]
pub fn stringtoslicerune(s: &str) -> Vec<char> {
    s.chars().collect()
}

/// Re-encode a rune sequence as UTF-8.
#[must_use]
pub fn slicerunetostring(runes: &[char]) -> String {
    runes.iter().collect()
}

/// Capacity growth policy used by `append`: double below 256 elements, then
/// grow by roughly 1.25x, rounded up to the old capacity plus the requested
/// minimum growth if that policy would undershoot it.
#[must_use]
pub fn grow_capacity(old_cap: usize, min_needed: usize) -> usize {
    if old_cap == 0 {
        return min_needed.max(1);
    }
    let mut new_cap = old_cap;
    if old_cap < 256 {
        while new_cap < min_needed {
            new_cap *= 2;
        }
        return new_cap;
    }
    while new_cap < min_needed {
        // (old + 3*old) / 4 == old * 1.25, computed to avoid overflow on
        // modest-sized slices; a 32-bit target never sees capacities large
        // enough for this to matter, but the computation is kept overflow
        // safe regardless via saturating arithmetic.
        new_cap = new_cap
            .saturating_add(new_cap.saturating_add(3 * new_cap) / 4)
            .max(new_cap + 1);
    }
    new_cap
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_ascii() {
        let (c, w) = decode_rune(b"hello");
        assert_eq!(c, 'h');
        assert_eq!(w, 1);
    }

    #[test]
    fn decode_multibyte() {
        let bytes = "日".as_bytes();
        let (c, w) = decode_rune(bytes);
        assert_eq!(c, '日');
        assert_eq!(w, 3);
    }

    #[test]
    fn decode_invalid_byte_resyncs() {
        let (c, w) = decode_rune(&[0xFF, b'a']);
        assert_eq!(c, RUNE_ERROR);
        assert_eq!(w, 1);
    }

    #[test]
    fn byte_string_roundtrip() {
        let s = "hello, world";
        let bytes = stringtoslicebyte(s);
        assert_eq!(slicebytetostring(&bytes), s);
    }

    #[test]
    fn rune_string_roundtrip() {
        let s = "héllo";
        let runes = stringtoslicerune(s);
        assert_eq!(slicerunetostring(&runes), s);
    }

    #[test]
    fn grow_capacity_doubles_below_threshold() {
        assert_eq!(grow_capacity(4, 5), 8);
        assert_eq!(grow_capacity(0, 0), 1);
    }

    #[test]
    fn grow_capacity_reaches_minimum() {
        assert!(grow_capacity(300, 1000) >= 1000);
    }
}
