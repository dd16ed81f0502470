//! Human verification codes.
//!
//! Both ends of a handshake derive the same auth string from the transcript.
//! A short numeric rendering of it is shown on the phone and on the head unit
//! so the user can confirm no one sits in the middle. For out-of-band
//! verification the raw bytes travel over another channel instead, and are
//! rendered as hex when they have to be displayed.

use subtle::ConstantTimeEq;

/// Maximum supported number of digits in a numeric code.
pub const MAX_CODE_DIGITS: u8 = 9;

/// Derive a zero-padded numeric code from an auth string.
///
/// Uses the first four bytes as a big-endian `u32` reduced modulo
/// `10^digits`. `digits` is clamped to `1..=MAX_CODE_DIGITS`. Returns `None`
/// when fewer than four bytes are available.
pub fn numeric_code(auth: &[u8], digits: u8) -> Option<String> {
    let prefix: [u8; 4] = auth.get(..4)?.try_into().ok()?;
    let digits = digits.clamp(1, MAX_CODE_DIGITS);
    let modulus = 10u32.pow(u32::from(digits));
    let value = u32::from_be_bytes(prefix) % modulus;
    Some(format!("{value:0width$}", width = usize::from(digits)))
}

/// Render out-of-band verification bytes for display.
pub fn oob_code_display(code: &[u8]) -> String {
    hex::encode(code)
}

/// Group a code into blocks of three for easier reading (`"123 456"`).
pub fn format_code_display(code: &str) -> String {
    let chars: Vec<char> = code.chars().collect();
    chars
        .chunks(3)
        .map(|chunk| chunk.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compare two byte strings without leaking the position of the first difference.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn numeric_code_is_zero_padded() {
        // 0x00000007 -> 7 -> "000007"
        let code = numeric_code(&[0, 0, 0, 7, 0xff], 6).unwrap();
        assert_eq!(code, "000007");
    }

    #[test]
    fn numeric_code_reduces_modulo_digits() {
        // 0xFFFFFFFF = 4294967295 -> last six digits
        let code = numeric_code(&[0xff; 4], 6).unwrap();
        assert_eq!(code, "967295");
    }

    #[test]
    fn numeric_code_is_deterministic_and_sensitive() {
        let auth = [0x12, 0x34, 0x56, 0x78, 0x9a];
        assert_eq!(numeric_code(&auth, 6), numeric_code(&auth, 6));
        assert_ne!(numeric_code(&auth, 6), numeric_code(&[0x12, 0x34, 0x56, 0x79], 6));
    }

    #[test]
    fn numeric_code_requires_four_bytes() {
        assert!(numeric_code(&[1, 2, 3], 6).is_none());
        assert!(numeric_code(&[], 6).is_none());
    }

    #[test]
    fn numeric_code_clamps_digits() {
        assert_eq!(numeric_code(&[0xff; 4], 0).unwrap().len(), 1);
        assert_eq!(numeric_code(&[0xff; 4], 20).unwrap().len(), 9);
    }

    #[test]
    fn oob_code_is_hex() {
        assert_eq!(oob_code_display(&[0xde, 0xad, 0x01]), "dead01");
    }

    #[test]
    fn format_groups_in_threes() {
        assert_eq!(format_code_display("123456"), "123 456");
        assert_eq!(format_code_display("1234"), "123 4");
        assert_eq!(format_code_display(""), "");
    }

    #[test]
    fn constant_time_eq_handles_length_mismatch() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
