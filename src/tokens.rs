//! Byte-level token helpers
//!
//! The model reads raw bytes: token id `b` is byte `b`, and id `0` doubles as
//! the seed (beginning-of-sequence) token and the end/padding token.

/// Seed, end-of-sequence and padding token
pub const PAD_TOKEN: u32 = 0;

/// Size of the byte vocabulary
pub const BYTE_VOCAB: usize = 256;

/// Encode a word as byte tokens
pub fn encode(word: &[u8]) -> Vec<u32> {
    word.iter().map(|&b| u32::from(b)).collect()
}

/// Decode tokens to a string, trimming leading and trailing padding
///
/// Ids outside the byte range are rendered as U+FFFD.
pub fn decode(tokens: &[u32]) -> String {
    let text: String = tokens
        .iter()
        .map(|&t| {
            u8::try_from(t)
                .map(char::from)
                .unwrap_or(char::REPLACEMENT_CHARACTER)
        })
        .collect();
    text.trim_matches('\0').to_string()
}

/// Number of occurrences of `symbol` in a token sequence
pub fn count_symbol(tokens: &[u32], symbol: u8) -> usize {
    tokens.iter().filter(|&&t| t == u32::from(symbol)).count()
}

/// Whether `symbol` occurs an even number of times
pub fn has_even_count(tokens: &[u32], symbol: u8) -> bool {
    count_symbol(tokens, symbol) % 2 == 0
}
