//! Tokenizer seam
//!
//! The engine consumes subword tokenizers through the [`Tokenizer`] trait:
//! encode text into int64 ids plus the normalized text, decode ids back into
//! text. [`HfTokenizer`] adapts HuggingFace `tokenizer.json` files (the
//! BPE/tiktoken-style LM tokenizers and the SentencePiece-BPE embedder
//! tokenizers both ship in that format); [`ByteTokenizer`] is the
//! deterministic byte-level vocabulary used by the simulated runtime.

use std::path::Path;

use crate::error::{ConversarError, Result};

/// Subword tokenizer consumed by the engine.
pub trait Tokenizer: Send + Sync {
    /// Encode text into token ids.
    ///
    /// Returns the ids together with the normalized text the tokenizer
    /// actually consumed (identical to the input when the tokenizer applies
    /// no normalization).
    fn encode(&self, text: &str) -> Result<(Vec<i64>, String)>;

    /// Decode token ids back into text.
    fn decode(&self, ids: &[i64]) -> Result<String>;
}

// ============================================================================
// HuggingFace tokenizer adapter
// ============================================================================

/// Adapter over a HuggingFace `tokenizer.json` file.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    add_special_tokens: bool,
}

impl HfTokenizer {
    /// Load a tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`ConversarError::NotFound`] when the file does not exist and
    /// [`ConversarError::InvalidArgument`] when it fails to parse.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConversarError::NotFound {
                path: path.display().to_string(),
            });
        }
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            ConversarError::invalid_argument(format!("failed to load tokenizer: {e}"))
        })?;
        Ok(Self {
            inner,
            add_special_tokens: true,
        })
    }

    /// Control whether encoding inserts the tokenizer's special tokens.
    ///
    /// LM prompts carry their control tokens in the rendered template text,
    /// so the LM tokenizer is configured with `false`; encoder models keep
    /// the default `true`.
    #[must_use]
    pub fn with_special_tokens(mut self, add: bool) -> Self {
        self.add_special_tokens = add;
        self
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<(Vec<i64>, String)> {
        let encoding = self
            .inner
            .encode(text, self.add_special_tokens)
            .map_err(|e| ConversarError::invalid_argument(format!("encoding failed: {e}")))?;
        let ids = encoding.get_ids().iter().map(|&id| i64::from(id)).collect();
        Ok((ids, text.to_string()))
    }

    fn decode(&self, ids: &[i64]) -> Result<String> {
        let ids: Vec<u32> = ids
            .iter()
            .map(|&id| {
                u32::try_from(id).map_err(|_| {
                    ConversarError::invalid_argument(format!("negative token id {id}"))
                })
            })
            .collect::<Result<_>>()?;
        self.inner
            .decode(&ids, true)
            .map_err(|e| ConversarError::invalid_argument(format!("decoding failed: {e}")))
    }
}

// ============================================================================
// Byte-level tokenizer (simulated models)
// ============================================================================

/// Offset separating reserved control ids from byte ids.
///
/// Ids 0..3 are reserved (0 and 2 are the default stop-token ids); byte `b`
/// maps to id `b + 3`.
const BYTE_ID_OFFSET: i64 = 3;

/// Byte-level tokenizer with a 259-entry vocabulary, paired with the
/// simulated runtime. Encoding is the identity over bytes, so round-trips
/// are exact.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    /// Create a byte tokenizer
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Vocabulary size including the reserved control ids
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        256 + BYTE_ID_OFFSET as usize
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<(Vec<i64>, String)> {
        let ids = text
            .bytes()
            .map(|b| i64::from(b) + BYTE_ID_OFFSET)
            .collect();
        Ok((ids, text.to_string()))
    }

    fn decode(&self, ids: &[i64]) -> Result<String> {
        let bytes: Vec<u8> = ids
            .iter()
            .filter(|&&id| id >= BYTE_ID_OFFSET && id < BYTE_ID_OFFSET + 256)
            .map(|&id| (id - BYTE_ID_OFFSET) as u8)
            .collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
