//! Agent orchestrator
//!
//! The per-turn entry point tying the pieces together: retrieval
//! (embedding → top-k → optional rerank), chat-template prompt rendering,
//! fragment streaming through the conversation session, and in-stream tool
//! execution with results spliced back into generation.

use crate::chat_template::{ChatTemplate, TOOL_CALL_CLOSE, TOOL_CALL_OPEN};
use crate::error::{ConversarError, Result};
use crate::model::encoder::{Embedder, Reranker};
use crate::retrieval::VectorStore;
use crate::session::ConversationSession;
use crate::tools::{ToolCall, ToolCallParser, ToolCallStatus};

/// Number of candidates fetched from the vector store per turn.
const DEFAULT_RETRIEVE_K: usize = 10;
/// Number of candidates kept for the prompt after (optional) reranking.
const DEFAULT_KEEP_K: usize = 5;

/// Tool executor callback: `(name, args) -> result`.
///
/// Executor errors are recovered locally, never propagated: the failure is
/// recorded on the call record as a [`ConversarError::ToolFailure`] message
/// and fed back into generation as an `Error:`-prefixed result block.
pub type ToolExecutor = Box<dyn FnMut(&str, &str) -> Result<String> + Send>;

/// Retrieval-augmented, tool-calling conversational agent over one session.
pub struct Agent {
    session: ConversationSession,
    template: ChatTemplate,
    embedder: Option<Embedder>,
    reranker: Option<Reranker>,
    store: Option<Box<dyn VectorStore + Send>>,
    executor: Option<ToolExecutor>,
    parser: ToolCallParser,
    calls: Vec<ToolCall>,
    retrieve_k: usize,
    keep_k: usize,
}

impl Agent {
    /// Create an agent over a conversation session, with no retrieval and
    /// no tools.
    #[must_use]
    pub fn new(session: ConversationSession) -> Self {
        Self {
            session,
            template: ChatTemplate::new(),
            embedder: None,
            reranker: None,
            store: None,
            executor: None,
            parser: ToolCallParser::with_delimiters(TOOL_CALL_OPEN, TOOL_CALL_CLOSE),
            calls: Vec::new(),
            retrieve_k: DEFAULT_RETRIEVE_K,
            keep_k: DEFAULT_KEEP_K,
        }
    }

    /// Replace the chat template
    #[must_use]
    pub fn with_template(mut self, template: ChatTemplate) -> Self {
        self.template = template;
        self
    }

    /// Enable retrieval augmentation
    #[must_use]
    pub fn with_retrieval(
        mut self,
        embedder: Embedder,
        store: Box<dyn VectorStore + Send>,
    ) -> Self {
        self.embedder = Some(embedder);
        self.store = Some(store);
        self
    }

    /// Enable candidate reranking
    #[must_use]
    pub fn with_reranker(mut self, reranker: Reranker) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Enable tool calling with the given executor
    #[must_use]
    pub fn with_tool_executor(mut self, executor: ToolExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Override how many candidates are fetched per turn
    #[must_use]
    pub fn with_retrieve_k(mut self, k: usize) -> Self {
        self.retrieve_k = k;
        self
    }

    /// The underlying session
    #[must_use]
    pub fn session(&self) -> &ConversationSession {
        &self.session
    }

    /// Every tool call executed so far, oldest first
    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.calls
    }

    /// Run one conversational turn, yielding decoded fragments lazily.
    ///
    /// The first turn renders the full system prompt (with retrieved
    /// context and, when a tool executor is configured, the tool-use
    /// instructions); later turns render only the new user message and its
    /// context.
    pub fn chat_turn(&mut self, user_text: &str) -> Result<TurnStream<'_>> {
        if user_text.is_empty() {
            return Err(ConversarError::invalid_argument("user text is empty"));
        }

        let sources = self.retrieve(user_text)?;
        let prompt = if self.session.is_fresh() {
            self.template
                .render_first_turn(user_text, &sources, self.executor.is_some())
        } else {
            self.template.render_turn(user_text, &sources)
        };

        self.session.begin_turn(&prompt)?;
        Ok(TurnStream {
            agent: self,
            fused: false,
        })
    }

    /// Embed the query, fetch candidates, optionally rerank, keep the best.
    fn retrieve(&mut self, user_text: &str) -> Result<Vec<String>> {
        let (Some(embedder), Some(store)) = (self.embedder.as_mut(), self.store.as_mut()) else {
            return Ok(Vec::new());
        };
        let query = embedder.embed(user_text)?;
        let mut hits = store.top_k(&query, self.retrieve_k)?;

        if let Some(reranker) = self.reranker.as_mut() {
            let mut scored = Vec::with_capacity(hits.len());
            for (item, _) in hits {
                let score = reranker.score(user_text, &item.text)?;
                scored.push((item, score));
            }
            scored.sort_by(|a, b| b.1.total_cmp(&a.1));
            hits = scored;
        }

        hits.truncate(self.keep_k);
        Ok(hits.into_iter().map(|(item, _)| item.text).collect())
    }

    /// Feed a fragment to the tool parser; execute and splice back every
    /// completed call.
    fn handle_tools(&mut self, fragment: &str) -> Result<()> {
        let Some(executor) = self.executor.as_mut() else {
            return Ok(());
        };
        for mut call in self.parser.push(fragment) {
            call.status = ToolCallStatus::Executing;
            let block = match executor(&call.name, &call.arguments) {
                Ok(result) => {
                    call.status = ToolCallStatus::Completed;
                    call.result = Some(result.clone());
                    self.template.render_tool_result(&result)
                }
                Err(e) => {
                    let message = match e {
                        ConversarError::ToolFailure { message } => message,
                        other => other.to_string(),
                    };
                    call.status = ToolCallStatus::Failed;
                    call.error = Some(message.clone());
                    self.template.render_tool_result(&format!("Error: {message}"))
                }
            };
            self.calls.push(call);
            self.session.inject(&block)?;
        }
        Ok(())
    }
}

/// Lazy fragment stream for one agent turn.
pub struct TurnStream<'a> {
    agent: &'a mut Agent,
    fused: bool,
}

impl Iterator for TurnStream<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        match self.agent.session.next_fragment() {
            Ok(Some(fragment)) => {
                if let Err(e) = self.agent.handle_tools(&fragment) {
                    self.fused = true;
                    return Some(Err(e));
                }
                Some(Ok(fragment))
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::model::decoder::DecoderModel;
    use crate::model::encoder::Embedder;
    use crate::retrieval::{MemoryVectorStore, RetrievalItem};
    use crate::runtime::sim::{SimCausalLm, SimEncoder, SimLmConfig};
    use crate::runtime::ElementType;
    use crate::sample::SamplingConfig;
    use crate::session::ConversationSession;
    use crate::tokenizer::ByteTokenizer;

    fn sim_session(max_tokens: usize) -> ConversationSession {
        let decoder =
            DecoderModel::new(Box::new(SimCausalLm::new(SimLmConfig::default()))).expect("driver");
        ConversationSession::new(
            decoder,
            Arc::new(ByteTokenizer::new()),
            SamplingConfig::greedy().with_max_tokens(max_tokens),
        )
    }

    fn sim_embedder(dim: usize) -> Embedder {
        Embedder::new(
            Box::new(SimEncoder::new("sentence_embedding", dim, ElementType::F32)),
            Arc::new(ByteTokenizer::new()),
        )
    }

    fn seeded_store(embedder: &mut Embedder, docs: &[(&str, &str)]) -> MemoryVectorStore {
        let mut store = MemoryVectorStore::new();
        for (id, text) in docs {
            let vector = embedder.embed(text).expect("embed doc");
            store
                .upsert(RetrievalItem::new(*id, vector, *text))
                .expect("upsert");
        }
        store
    }

    #[test]
    fn test_first_turn_renders_system_prompt_with_context() {
        let mut embedder = sim_embedder(16);
        let store = seeded_store(
            &mut embedder,
            &[("d1", "rust is fast"), ("d2", "cats sleep a lot")],
        );
        let mut agent =
            Agent::new(sim_session(2)).with_retrieval(embedder, Box::new(store));

        let fragments: Vec<_> = agent
            .chat_turn("tell me about rust")
            .expect("turn")
            .collect();
        assert!(fragments.iter().all(|f| f.is_ok()));

        let transcript = agent.session().transcript();
        assert!(transcript.contains("<|begin_of_text|>"));
        assert!(transcript.contains("**Source 1:**"));
        assert!(transcript.contains("tell me about rust"));
    }

    #[test]
    fn test_follow_up_turn_skips_system_prompt() {
        let mut agent = Agent::new(sim_session(2));
        let _: Vec<_> = agent.chat_turn("first").expect("turn one").collect();
        let _: Vec<_> = agent.chat_turn("second").expect("turn two").collect();

        let transcript = agent.session().transcript();
        assert_eq!(transcript.matches("<|begin_of_text|>").count(), 1);
        assert!(transcript.contains("second"));
    }

    #[test]
    fn test_retrieval_keeps_at_most_five_sources() {
        let mut embedder = sim_embedder(16);
        let docs: Vec<(String, String)> = (0..8)
            .map(|i| (format!("d{i}"), format!("document number {i}")))
            .collect();
        let doc_refs: Vec<(&str, &str)> = docs
            .iter()
            .map(|(id, text)| (id.as_str(), text.as_str()))
            .collect();
        let store = seeded_store(&mut embedder, &doc_refs);
        let mut agent =
            Agent::new(sim_session(1)).with_retrieval(embedder, Box::new(store));

        let _: Vec<_> = agent.chat_turn("query").expect("turn").collect();
        let transcript = agent.session().transcript();
        assert!(transcript.contains("**Source 5:**"));
        assert!(!transcript.contains("**Source 6:**"));
    }

    #[test]
    fn test_reranker_orders_sources() {
        let mut embedder = sim_embedder(16);
        let store = seeded_store(
            &mut embedder,
            &[("d1", "first doc"), ("d2", "second doc"), ("d3", "third doc")],
        );
        let reranker = crate::model::encoder::Reranker::new(
            Box::new(SimEncoder::new("logits", 1, ElementType::F32)),
            Arc::new(ByteTokenizer::new()),
        );
        let mut agent = Agent::new(sim_session(1))
            .with_retrieval(embedder, Box::new(store))
            .with_reranker(reranker);

        let fragments: Vec<_> = agent.chat_turn("which doc").expect("turn").collect();
        assert!(fragments.iter().all(|f| f.is_ok()));
        assert!(agent.session().transcript().contains("**Source 1:**"));
    }

    #[test]
    fn test_tool_instructions_rendered_only_with_executor() {
        let mut plain = Agent::new(sim_session(1));
        let _: Vec<_> = plain.chat_turn("hi").expect("turn").collect();
        assert!(!plain.session().transcript().contains("TOOL_CALL"));

        let mut tooled = Agent::new(sim_session(1))
            .with_tool_executor(Box::new(|_, _| Ok("unused".to_string())));
        let _: Vec<_> = tooled.chat_turn("hi").expect("turn").collect();
        assert!(tooled.session().transcript().contains("TOOL_CALL"));
    }

    #[test]
    fn test_empty_user_text_rejected() {
        let mut agent = Agent::new(sim_session(1));
        assert!(matches!(
            agent.chat_turn(""),
            Err(ConversarError::InvalidArgument { .. })
        ));
    }
}
