//! Per-conversation session
//!
//! Owns the KV state and transcript of one conversation and drives the step
//! driver token by token. Generation is exposed as a pull-based
//! [`TokenStream`]: the consumer drives the loop, so the producer can never
//! outrun it.
//!
//! A session is single-threaded by construction; the step driver is never
//! invoked concurrently on the same session. A fatal invariant violation
//! poisons the session: every later call fails until it is disposed.

use std::sync::Arc;

use crate::error::{ConversarError, Result};
use crate::model::decoder::DecoderModel;
use crate::model::kv::KvState;
use crate::runtime::CancelToken;
use crate::sample::{Sampler, SamplingConfig};
use crate::tokenizer::Tokenizer;

/// Size of the rolling decoded-tail window the stop sequences are checked
/// against, in characters.
const STOP_TAIL_CHARS: usize = 100;

/// One conversation's generation state.
pub struct ConversationSession {
    decoder: DecoderModel,
    tokenizer: Arc<dyn Tokenizer>,
    config: SamplingConfig,
    sampler: Sampler,
    kv: KvState,
    transcript: String,
    tail: String,
    generated: Vec<i64>,
    pending: Option<Vec<i64>>,
    produced_this_turn: usize,
    turn_done: bool,
    poisoned: bool,
    cancel: CancelToken,
}

impl ConversationSession {
    /// Create a session over a loaded decoder and its tokenizer.
    #[must_use]
    pub fn new(
        decoder: DecoderModel,
        tokenizer: Arc<dyn Tokenizer>,
        config: SamplingConfig,
    ) -> Self {
        let sampler = Sampler::new(&config);
        Self {
            decoder,
            tokenizer,
            config,
            sampler,
            kv: KvState::empty(),
            transcript: String::new(),
            tail: String::new(),
            generated: Vec::new(),
            pending: None,
            produced_this_turn: 0,
            turn_done: true,
            poisoned: false,
            cancel: CancelToken::new(),
        }
    }

    /// The append-only transcript: every prompt fed in and every fragment
    /// emitted, in order.
    #[must_use]
    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Whether any turn has run yet
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.transcript.is_empty()
    }

    /// Accumulated KV sequence length
    #[must_use]
    pub fn kv_seq_len(&self) -> usize {
        self.kv.seq_len()
    }

    /// The sampling configuration in force
    #[must_use]
    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// A handle that cancels this session's generation loop
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Start a turn: append `prompt` to the transcript and queue it as the
    /// next step's input.
    ///
    /// # Errors
    ///
    /// Fails on a poisoned session or a prompt that encodes to no tokens.
    pub fn begin_turn(&mut self, prompt: &str) -> Result<()> {
        self.ensure_usable()?;
        let (ids, _) = self.tokenizer.encode(prompt)?;
        if ids.is_empty() {
            return Err(ConversarError::invalid_argument(
                "prompt encoded to no tokens",
            ));
        }
        self.transcript.push_str(prompt);
        self.pending = Some(ids);
        self.produced_this_turn = 0;
        self.turn_done = false;
        Ok(())
    }

    /// Generate the whole turn for `prompt` as a lazy fragment stream.
    pub fn generate(&mut self, prompt: &str) -> Result<TokenStream<'_>> {
        self.begin_turn(prompt)?;
        Ok(TokenStream {
            session: self,
            fused: false,
        })
    }

    /// Splice additional context (a tool-result block) into the running
    /// turn: it becomes part of the next step's input ids and generation
    /// continues with it visible.
    ///
    /// A token already queued from the previous step (the just-sampled id)
    /// stays at the front, so the model's own output remains in context.
    pub fn inject(&mut self, text: &str) -> Result<()> {
        self.ensure_usable()?;
        let (ids, _) = self.tokenizer.encode(text)?;
        if ids.is_empty() {
            return Err(ConversarError::invalid_argument(
                "injected text encoded to no tokens",
            ));
        }
        self.transcript.push_str(text);
        let mut pending = self.pending.take().unwrap_or_default();
        pending.extend(ids);
        self.pending = Some(pending);
        self.turn_done = false;
        Ok(())
    }

    /// Advance the turn by one token and return its decoded fragment, or
    /// `None` when the turn is over (stop condition, token budget, or no
    /// turn in progress).
    ///
    /// # Errors
    ///
    /// Step and sampling errors end the turn and surface here; an
    /// [`ConversarError::InvariantViolation`] additionally poisons the
    /// session.
    pub fn next_fragment(&mut self) -> Result<Option<String>> {
        self.ensure_usable()?;
        if self.turn_done {
            return Ok(None);
        }
        if self.produced_this_turn >= self.config.max_tokens {
            self.turn_done = true;
            self.pending = None;
            return Ok(None);
        }
        let Some(input_ids) = self.pending.take() else {
            self.turn_done = true;
            return Ok(None);
        };

        // Between-step cancellation: the loop halts, the KV is untouched.
        if let Err(e) = self.cancel.check() {
            self.turn_done = true;
            return Err(e);
        }

        let step = match self.decoder.run_step(&input_ids, &self.kv, &self.cancel) {
            Ok(step) => step,
            Err(e) => {
                self.turn_done = true;
                if matches!(e, ConversarError::InvariantViolation { .. }) {
                    self.poisoned = true;
                }
                return Err(e);
            }
        };
        // Commit the new state first; the previous KV tensors drop here.
        self.kv = step.kv;

        let logits = self.decoder.last_position_logits(&step.logits)?;
        let next_id = self.sampler.sample(&logits, &self.config, &self.generated)?;

        let fragment = self.tokenizer.decode(&[next_id])?;
        self.transcript.push_str(&fragment);
        self.push_tail(&fragment);
        self.generated.push(next_id);
        self.produced_this_turn += 1;

        if self.config.stop_token_ids.contains(&next_id) || self.tail_hits_stop_sequence() {
            self.turn_done = true;
            self.pending = None;
        } else {
            self.pending = Some(vec![next_id]);
        }
        Ok(Some(fragment))
    }

    /// Drop all conversation state and start over with an empty KV.
    ///
    /// Does not clear poisoning: a poisoned session stays unusable.
    pub fn reset(&mut self) {
        self.kv = KvState::empty();
        self.transcript.clear();
        self.tail.clear();
        self.generated.clear();
        self.pending = None;
        self.produced_this_turn = 0;
        self.turn_done = true;
        self.sampler = Sampler::new(&self.config);
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(ConversarError::invariant(
                "session is poisoned and must be disposed",
            ));
        }
        Ok(())
    }

    fn push_tail(&mut self, fragment: &str) {
        self.tail.push_str(fragment);
        let excess = self.tail.chars().count().saturating_sub(STOP_TAIL_CHARS);
        if excess > 0 {
            let cut = self
                .tail
                .char_indices()
                .nth(excess)
                .map_or(0, |(byte, _)| byte);
            self.tail.drain(..cut);
        }
    }

    fn tail_hits_stop_sequence(&self) -> bool {
        self.config
            .stop_sequences
            .iter()
            .any(|s| !s.is_empty() && self.tail.contains(s))
    }
}

/// Lazy fragment stream for one turn.
///
/// Yields `Ok(fragment)` per generated token; a failing turn yields the
/// fragments produced so far followed by exactly one terminal `Err`.
pub struct TokenStream<'a> {
    session: &'a mut ConversationSession,
    fused: bool,
}

impl Iterator for TokenStream<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        match self.session.next_fragment() {
            Ok(Some(fragment)) => Some(Ok(fragment)),
            Ok(None) => {
                self.fused = true;
                None
            }
            Err(e) => {
                self.fused = true;
                Some(Err(e))
            }
        }
    }
}
