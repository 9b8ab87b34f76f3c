//! The tokenizer boundary.
//!
//! The engine consumes tokenizers by interface only; the loader constructs
//! the concrete implementation. The one hard requirement beyond encode and
//! decode is incremental safety: decoding successive token slices and
//! concatenating the results must equal decoding the concatenation. Stop
//! sequence matching on streamed bytes depends on it.

use thiserror::Error;

use crate::model::TokenId;

#[derive(Error, Debug)]
pub enum TokenizerError {
    /// Input text cannot be represented in this vocabulary.
    #[error("cannot tokenize: {0}")]
    Unrepresentable(String),
    /// A token id outside the vocabulary was supplied.
    #[error("token id {0} out of range")]
    IdOutOfRange(TokenId),
}

/// A byte-level or character-level tokenizer over a fixed vocabulary.
pub trait Tokenizer: Send + Sync {
    /// Append the encoding of `text` to `out`, returning the number of
    /// tokens written. Must not allocate beyond growing `out`.
    fn encode_into(&self, text: &str, out: &mut Vec<TokenId>) -> Result<usize, TokenizerError>;

    /// Append the decoded bytes of `tokens` to `out`, returning the number
    /// of bytes written.
    fn decode_into(&self, tokens: &[TokenId], out: &mut Vec<u8>) -> usize;

    /// The raw bytes of a single token. Streaming emits these through a
    /// UTF-8 boundary buffer.
    fn token_bytes(&self, id: TokenId) -> &[u8];

    fn vocab_size(&self) -> usize;
    fn bos_id(&self) -> Option<TokenId>;
    fn eos_id(&self) -> Option<TokenId>;
    fn pad_id(&self) -> Option<TokenId>;
    fn unk_id(&self) -> Option<TokenId>;

    /// Whether unknown text falls back to raw byte tokens rather than an
    /// `unk` placeholder.
    fn supports_byte_fallback(&self) -> bool;

    /// Owning convenience wrapper over [`Tokenizer::encode_into`].
    fn encode(&self, text: &str) -> Result<Vec<TokenId>, TokenizerError> {
        let mut out = Vec::with_capacity(text.len());
        self.encode_into(text, &mut out)?;
        Ok(out)
    }

    /// Owning convenience wrapper over [`Tokenizer::decode_into`].
    fn decode(&self, tokens: &[TokenId]) -> String {
        let mut out = Vec::with_capacity(tokens.len() * 2);
        self.decode_into(tokens, &mut out);
        String::from_utf8_lossy(&out).into_owned()
    }
}

const BYTE_SPECIALS: usize = 4;

/// Byte-level tokenizer: four reserved specials followed by the 256 byte
/// values. Trivially incremental-safe, and the default vocabulary for the
/// synthetic loaders used in tests.
pub struct ByteTokenizer {
    byte_table: Vec<Vec<u8>>,
}

pub const BYTE_PAD: TokenId = 0;
pub const BYTE_UNK: TokenId = 1;
pub const BYTE_BOS: TokenId = 2;
pub const BYTE_EOS: TokenId = 3;

impl ByteTokenizer {
    pub fn new() -> Self {
        let mut byte_table = Vec::with_capacity(BYTE_SPECIALS + 256);
        for _ in 0..BYTE_SPECIALS {
            byte_table.push(Vec::new());
        }
        for b in 0..=255u8 {
            byte_table.push(vec![b]);
        }
        ByteTokenizer { byte_table }
    }
}

impl Default for ByteTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode_into(&self, text: &str, out: &mut Vec<TokenId>) -> Result<usize, TokenizerError> {
        let before = out.len();
        out.extend(text.bytes().map(|b| b as TokenId + BYTE_SPECIALS as TokenId));
        Ok(out.len() - before)
    }

    fn decode_into(&self, tokens: &[TokenId], out: &mut Vec<u8>) -> usize {
        let before = out.len();
        for &t in tokens {
            out.extend_from_slice(self.token_bytes(t));
        }
        out.len() - before
    }

    fn token_bytes(&self, id: TokenId) -> &[u8] {
        self.byte_table
            .get(id as usize)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    fn vocab_size(&self) -> usize {
        self.byte_table.len()
    }

    fn bos_id(&self) -> Option<TokenId> {
        Some(BYTE_BOS)
    }

    fn eos_id(&self) -> Option<TokenId> {
        Some(BYTE_EOS)
    }

    fn pad_id(&self) -> Option<TokenId> {
        Some(BYTE_PAD)
    }

    fn unk_id(&self) -> Option<TokenId> {
        Some(BYTE_UNK)
    }

    fn supports_byte_fallback(&self) -> bool {
        true
    }
}

/// Buffers raw token bytes until they form valid UTF-8.
///
/// Byte-level vocabularies can split a multi-byte scalar across tokens;
/// pushing each token's bytes here and emitting only complete sequences
/// keeps the streamed text valid without ever stalling more than three
/// bytes behind.
#[derive(Default, Debug, Clone)]
pub struct TokenBuffer {
    held: Vec<u8>,
}

impl TokenBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push token bytes; returns the longest valid-UTF-8 prefix now
    /// available, or `None` when everything is still mid-sequence.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.held.extend_from_slice(bytes);
        match std::str::from_utf8(&self.held) {
            Ok(s) => {
                let out = s.to_owned();
                self.held.clear();
                Some(out)
            }
            Err(err) => {
                let valid = err.valid_up_to();
                if valid == 0 {
                    // A malformed sequence longer than any scalar will
                    // never complete; flush it lossily rather than stall.
                    if self.held.len() > 4 {
                        let out = String::from_utf8_lossy(&self.held).into_owned();
                        self.held.clear();
                        return Some(out);
                    }
                    None
                } else {
                    let out = String::from_utf8_lossy(&self.held[..valid]).into_owned();
                    self.held.drain(..valid);
                    Some(out)
                }
            }
        }
    }

    /// Flush whatever is held, lossily. Call at end of stream.
    pub fn flush(&mut self) -> Option<String> {
        if self.held.is_empty() {
            return None;
        }
        let out = String::from_utf8_lossy(&self.held).into_owned();
        self.held.clear();
        Some(out)
    }
}
