//! Chat prompt rendering
//!
//! Renders turns as UTF-8 text using the header-token role markers the
//! model was trained on:
//!
//! ```text
//! <|begin_of_text|><|start_header_id|>system<|end_header_id|>
//!
//! ...system message...<|eot_id|><|start_header_id|>user<|end_header_id|>
//! ...
//! ```
//!
//! The system message carries a short instruction line, optional numbered
//! retrieved context, and an optional tool-use block describing the
//! `TOOL_CALL` / `END_TOOL_CALL` markers. Tool results are wrapped in
//! `TOOL_RESULT` / `END_TOOL_RESULT`.
//!
//! User content is sanitized so it cannot smuggle control tokens into the
//! prompt.

use std::fmt::Write;

/// Start-of-prompt marker
pub const BEGIN_OF_TEXT: &str = "<|begin_of_text|>";
/// Role header opening marker
pub const START_HEADER: &str = "<|start_header_id|>";
/// Role header closing marker
pub const END_HEADER: &str = "<|end_header_id|>";
/// End-of-turn marker
pub const EOT: &str = "<|eot_id|>";

/// Opening marker the model emits to call a tool
pub const TOOL_CALL_OPEN: &str = "TOOL_CALL";
/// Closing marker of a tool call
pub const TOOL_CALL_CLOSE: &str = "END_TOOL_CALL";
/// Opening marker of a spliced tool result
pub const TOOL_RESULT_OPEN: &str = "TOOL_RESULT";
/// Closing marker of a spliced tool result
pub const TOOL_RESULT_CLOSE: &str = "END_TOOL_RESULT";

/// Escape control-token introducers in user-supplied content.
///
/// A zero-width space after `<` breaks the `<|…|>` pattern without changing
/// the rendered text, so user input cannot override the system prompt.
#[must_use]
pub fn sanitize_special_tokens(content: &str) -> String {
    content.replace("<|", "<\u{200B}|")
}

/// Prompt renderer for one conversation.
#[derive(Debug, Clone)]
pub struct ChatTemplate {
    instruction: String,
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self {
            instruction: "You are a helpful assistant. Answer using the provided context when \
                          it is relevant."
                .to_string(),
        }
    }
}

impl ChatTemplate {
    /// Create a template with the default instruction line
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the system instruction line
    #[must_use]
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    /// Render the opening prompt of a conversation: system message (with
    /// retrieved context and, when `tools` is set, the tool-use block)
    /// followed by the first user message and the assistant header.
    #[must_use]
    pub fn render_first_turn<S: AsRef<str>>(
        &self,
        user_text: &str,
        sources: &[S],
        tools: bool,
    ) -> String {
        let mut prompt = String::new();
        prompt.push_str(BEGIN_OF_TEXT);
        push_header(&mut prompt, "system");
        prompt.push_str(&self.instruction);
        if !sources.is_empty() {
            prompt.push_str("\n\n");
            push_sources(&mut prompt, sources);
        }
        if tools {
            prompt.push_str("\n\n");
            push_tool_instructions(&mut prompt);
        }
        prompt.push_str(EOT);

        push_header(&mut prompt, "user");
        prompt.push_str(&sanitize_special_tokens(user_text));
        prompt.push_str(EOT);

        push_header(&mut prompt, "assistant");
        prompt
    }

    /// Render a follow-up turn: the new user message (with its retrieved
    /// context) and the assistant header.
    #[must_use]
    pub fn render_turn<S: AsRef<str>>(&self, user_text: &str, sources: &[S]) -> String {
        let mut prompt = String::new();
        push_header(&mut prompt, "user");
        if !sources.is_empty() {
            push_sources(&mut prompt, sources);
            prompt.push('\n');
        }
        prompt.push_str(&sanitize_special_tokens(user_text));
        prompt.push_str(EOT);

        push_header(&mut prompt, "assistant");
        prompt
    }

    /// Wrap a tool result for splicing back into generation.
    #[must_use]
    pub fn render_tool_result(&self, result: &str) -> String {
        format!("\n{TOOL_RESULT_OPEN}\n{result}\n{TOOL_RESULT_CLOSE}\n")
    }
}

fn push_header(prompt: &mut String, role: &str) {
    let _ = write!(prompt, "{START_HEADER}{role}{END_HEADER}\n\n");
}

fn push_sources<S: AsRef<str>>(prompt: &mut String, sources: &[S]) {
    for (i, source) in sources.iter().enumerate() {
        let _ = writeln!(
            prompt,
            "**Source {}:**\n> {}",
            i + 1,
            sanitize_special_tokens(source.as_ref())
        );
    }
}

fn push_tool_instructions(prompt: &mut String) {
    let _ = write!(
        prompt,
        "You may call tools. To call one, emit a block of this exact form:\n\
         {TOOL_CALL_OPEN}\n\
         name: <tool name>\n\
         args: <arguments>\n\
         {TOOL_CALL_CLOSE}\n\
         The result will be returned wrapped in {TOOL_RESULT_OPEN} and {TOOL_RESULT_CLOSE}."
    );
}
