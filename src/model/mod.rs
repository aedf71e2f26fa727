//! Model hosts
//!
//! Wrappers that own a runtime session and drive it step by step:
//!
//! - [`kv`] — discovery of the past/present KV tensor pairing and the
//!   move-only KV state carried across steps
//! - [`decoder`] — the causal-LM step driver (one forward pass, KV in, KV
//!   out)
//! - [`encoder`] — the shared single-input host behind the embedder and the
//!   reranker

pub mod decoder;
pub mod encoder;
pub mod kv;

pub use decoder::{DecoderModel, StepOutput};
pub use encoder::{Embedder, EncoderModel, Reranker};
pub use kv::{KvLayout, KvSlot, KvState};
