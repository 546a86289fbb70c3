//! Single-byte character encoding for the terminal link.
//!
//! The terminal speaks ISO-8859-15; ISO-8859-1 serves as the fallback for
//! code points outside the Latin-9 replacement set. The two encodings differ
//! in exactly eight positions, so both directions fold into one table pair.

/// The eight positions where ISO-8859-15 deviates from ISO-8859-1.
const LATIN9_REPLACEMENTS: [(u8, char); 8] = [
    (0xA4, '\u{20AC}'), // €
    (0xA6, '\u{0160}'), // Š
    (0xA8, '\u{0161}'), // š
    (0xB4, '\u{017D}'), // Ž
    (0xB8, '\u{017E}'), // ž
    (0xBC, '\u{0152}'), // Œ
    (0xBD, '\u{0153}'), // œ
    (0xBE, '\u{0178}'), // Ÿ
];

/// Byte substituted for characters that fit neither encoding.
const SUBSTITUTE: u8 = b'?';

/// Encode a string into terminal bytes.
///
/// Characters in the Latin-9 replacement set use their ISO-8859-15 byte;
/// everything else at or below U+00FF falls back to its ISO-8859-1 byte;
/// the rest encode as `?`.
#[must_use]
pub fn encode(s: &str) -> Vec<u8> {
    s.chars().map(encode_char).collect()
}

/// Decode terminal bytes into a string.
#[must_use]
pub fn decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| decode_byte(b)).collect()
}

fn encode_char(c: char) -> u8 {
    if let Some(&(byte, _)) = LATIN9_REPLACEMENTS.iter().find(|&&(_, ch)| ch == c) {
        return byte;
    }
    let cp = c as u32;
    if cp <= 0xFF { cp as u8 } else { SUBSTITUTE }
}

fn decode_byte(b: u8) -> char {
    if let Some(&(_, ch)) = LATIN9_REPLACEMENTS.iter().find(|&&(byte, _)| byte == b) {
        return ch;
    }
    b as char
}
