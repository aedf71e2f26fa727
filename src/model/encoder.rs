//! Single-input model hosts: embedder and reranker
//!
//! Both wrappers share one "encode one text into one vector" path
//! ([`EncoderModel::execute`]): tokenize, build `[1, L]` id and mask
//! tensors, run a single forward pass, widen the declared-dtype output to
//! `f32`, optionally L2-normalize.

use std::sync::Arc;

use crate::error::{ConversarError, Result};
use crate::runtime::{RuntimeSession, TensorValue};
use crate::tokenizer::Tokenizer;

/// Default cap on encoder input length, in tokens.
const DEFAULT_MAX_INPUT_TOKENS: usize = 512;

/// Separator used when a reranker scores a query/document pair.
const RERANK_SEPARATOR: &str = "[SEP]";

/// Shared host for any single-input encoder-style model.
pub struct EncoderModel {
    session: Box<dyn RuntimeSession>,
    tokenizer: Arc<dyn Tokenizer>,
    max_input_tokens: usize,
}

impl EncoderModel {
    /// Wrap a loaded session and its tokenizer.
    #[must_use]
    pub fn new(session: Box<dyn RuntimeSession>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            session,
            tokenizer,
            max_input_tokens: DEFAULT_MAX_INPUT_TOKENS,
        }
    }

    /// Override the maximum accepted input length, in tokens.
    #[must_use]
    pub fn with_max_input_tokens(mut self, max: usize) -> Self {
        self.max_input_tokens = max;
        self
    }

    /// Dimensionality of the named output vector.
    ///
    /// # Errors
    ///
    /// Returns [`ConversarError::InvalidArgument`] for an undeclared output
    /// name and [`ConversarError::InvariantViolation`] when the declared
    /// dimension is symbolic.
    pub fn output_dim(&self, output_name: &str) -> Result<usize> {
        self.output_spec(output_name).map(|(dim, _)| dim)
    }

    fn output_spec(&self, output_name: &str) -> Result<(usize, crate::runtime::ElementType)> {
        let spec = self
            .session
            .outputs()
            .iter()
            .find(|s| s.name == output_name)
            .ok_or_else(|| {
                ConversarError::invalid_argument(format!(
                    "model declares no '{output_name}' output"
                ))
            })?;
        let dim = spec.shape.last().copied().unwrap_or(-1);
        if dim <= 0 {
            return Err(ConversarError::invariant(format!(
                "output '{output_name}' declares a symbolic dimension"
            )));
        }
        Ok((dim as usize, spec.dtype))
    }

    /// Run one forward pass over `text` and return the named output widened
    /// to `f32`, together with the tokenizer-normalized text.
    ///
    /// # Errors
    ///
    /// - [`ConversarError::InvalidArgument`] for empty input or input over
    ///   the configured token maximum.
    /// - [`ConversarError::RuntimeFailure`] for runtime errors, message
    ///   preserved.
    pub fn execute(
        &mut self,
        text: &str,
        output_name: &str,
        normalize: bool,
    ) -> Result<(Vec<f32>, String)> {
        if text.is_empty() {
            return Err(ConversarError::invalid_argument("input text is empty"));
        }
        let (dim, dtype) = self.output_spec(output_name)?;

        let (ids, normalized_text) = self.tokenizer.encode(text)?;
        if ids.is_empty() {
            return Err(ConversarError::invalid_argument(
                "input text produced no tokens",
            ));
        }
        if ids.len() > self.max_input_tokens {
            return Err(ConversarError::invalid_argument(format!(
                "input is {} tokens, maximum is {}",
                ids.len(),
                self.max_input_tokens
            )));
        }

        let ids_tensor = TensorValue::from_i64_row(&ids)?;
        let mask_tensor = TensorValue::from_i64_row(&vec![1i64; ids.len()])?;
        let out = TensorValue::zeros(dtype, &[1, dim as i64])?;

        let produced = self.session.run(
            &[("input_ids", &ids_tensor), ("attention_mask", &mask_tensor)],
            vec![(output_name.to_string(), out)],
        )?;
        let tensor = produced
            .into_iter()
            .find(|(name, _)| name == output_name)
            .map(|(_, t)| t)
            .ok_or_else(|| {
                ConversarError::invariant(format!("run returned no '{output_name}' output"))
            })?;

        let mut vector = tensor.to_f32_vec()?;
        if normalize {
            l2_normalize(&mut vector);
        }
        Ok((vector, normalized_text))
    }
}

/// Normalize in place to unit L2 length, with an epsilon floor under the
/// root so a zero vector passes through unchanged.
pub(crate) fn l2_normalize(v: &mut [f32]) {
    let norm = (v.iter().map(|x| x * x).sum::<f32>() + 1e-9).sqrt();
    for x in v.iter_mut() {
        *x /= norm;
    }
}

// ============================================================================
// Embedder
// ============================================================================

/// Text embedder producing unit-length dense vectors for retrieval.
pub struct Embedder {
    inner: EncoderModel,
    output_name: String,
}

impl Embedder {
    /// Wrap an encoder host with the default `sentence_embedding` output.
    #[must_use]
    pub fn new(session: Box<dyn RuntimeSession>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            inner: EncoderModel::new(session, tokenizer),
            output_name: "sentence_embedding".to_string(),
        }
    }

    /// Override the embedding output slot name.
    #[must_use]
    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = name.into();
        self
    }

    /// Embedding dimensionality declared by the model.
    pub fn dimension(&self) -> Result<usize> {
        self.inner.output_dim(&self.output_name)
    }

    /// Embed one text into an L2-normalized vector.
    pub fn embed(&mut self, text: &str) -> Result<Vec<f32>> {
        let (vector, _) = self.inner.execute(text, &self.output_name, true)?;
        Ok(vector)
    }

    /// Embed several texts, preserving order.
    pub fn embed_batch<T: AsRef<str>>(&mut self, texts: &[T]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t.as_ref())).collect()
    }
}

// ============================================================================
// Reranker
// ============================================================================

/// Cross-encoder reranker scoring query/document pairs into `[0, 1]`.
pub struct Reranker {
    inner: EncoderModel,
}

impl Reranker {
    /// Wrap an encoder host whose `logits` output scores the pair.
    #[must_use]
    pub fn new(session: Box<dyn RuntimeSession>, tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            inner: EncoderModel::new(session, tokenizer),
        }
    }

    /// Score how well `document` answers `query`.
    ///
    /// Runs `query[SEP]document` through the model, takes the first logit,
    /// and maps it through the logistic function.
    pub fn score(&mut self, query: &str, document: &str) -> Result<f32> {
        let pair = format!("{query}{RERANK_SEPARATOR}{document}");
        let (logits, _) = self.inner.execute(&pair, "logits", false)?;
        let raw = logits.first().copied().ok_or_else(|| {
            ConversarError::invariant("reranker produced an empty logits vector")
        })?;
        Ok(1.0 / (1.0 + (-raw).exp()))
    }
}
