//! # Conversar
//!
//! Local, single-process streaming inference engine for decoder-only causal
//! language models exported to a tensor-graph runtime, with optional
//! retrieval augmentation and in-stream tool calling.
//!
//! The heart of the crate is the token-streaming generation core:
//!
//! - a step driver that binds a growing key/value attention cache across
//!   forward passes ([`model::decoder`], [`model::kv`])
//! - a composable logit-shaping sampling pipeline ([`sample`])
//! - per-conversation sessions that keep KV state across turns and stream
//!   decoded fragments lazily ([`session`])
//! - a tool-call scanner that recognizes delimited blocks in the stream and
//!   splices executor results back into generation ([`tools`], [`agent`])
//! - embedder and reranker hosts sharing the same step-bound runtime
//!   abstraction, feeding cosine retrieval ([`model::encoder`],
//!   [`retrieval`])
//!
//! The tensor-graph runtime itself is an external collaborator, consumed
//! through the [`runtime`] facade; [`runtime::sim`] ships a deterministic
//! simulated runtime for the demo binary and the tests.
//!
//! ## Example
//!
//! ```
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use conversar::model::decoder::DecoderModel;
//! use conversar::runtime::sim::{SimLmConfig, SimModel, SimRuntime};
//! use conversar::runtime::{ExecutionProvider, TensorRuntime};
//! use conversar::sample::SamplingConfig;
//! use conversar::session::ConversationSession;
//! use conversar::tokenizer::ByteTokenizer;
//!
//! let mut runtime = SimRuntime::new();
//! runtime.register("demo://llm", SimModel::CausalLm(SimLmConfig::default()));
//!
//! let session = runtime
//!     .load_session(Path::new("demo://llm"), &[ExecutionProvider::Cpu])
//!     .unwrap();
//! let decoder = DecoderModel::new(session).unwrap();
//! let mut session = ConversationSession::new(
//!     decoder,
//!     Arc::new(ByteTokenizer::new()),
//!     SamplingConfig::greedy().with_max_tokens(4),
//! );
//!
//! let reply: String = session
//!     .generate("abc")
//!     .unwrap()
//!     .map(|fragment| fragment.unwrap())
//!     .collect();
//! assert_eq!(reply, "defg");
//! ```

pub mod agent;
pub mod chat_template;
pub mod cli;
pub mod error;
pub mod model;
pub mod retrieval;
pub mod runtime;
pub mod sample;
pub mod session;
pub mod tokenizer;
pub mod tools;

// Re-exports for convenience
pub use agent::Agent;
pub use error::{ConversarError, Result};
pub use sample::{ModelFamily, SamplingConfig};
pub use session::ConversationSession;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
