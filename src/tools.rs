//! In-stream tool calling
//!
//! The model requests a tool by emitting a delimited block inside its
//! generated text. [`ToolCallParser`] is an incremental scanner over the
//! decoded fragments: it accumulates text, recognizes the opening
//! delimiter, collects until the closing delimiter, and parses the body as
//! `key: value` lines into a [`ToolCall`] record. Malformed bodies reset
//! the scanner without producing a record.
//!
//! Status transitions after `Pending` are the orchestrator's business; the
//! parser only mints records.

use serde::{Deserialize, Serialize};

/// Default opening delimiter.
pub const DEFAULT_OPEN_DELIMITER: &str = "<tool_call>";
/// Default closing delimiter.
pub const DEFAULT_CLOSE_DELIMITER: &str = "</tool_call>";

/// Lifecycle of one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    /// Parsed and waiting for the orchestrator
    Pending,
    /// Still being accumulated by the scanner
    Parsing,
    /// Handed to the executor
    Executing,
    /// Executor returned a result
    Completed,
    /// Executor failed
    Failed,
}

/// One parsed tool-call record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Monotonic id minted by the parser
    pub id: u64,
    /// Tool name from the required `name:` line
    pub name: String,
    /// Raw argument string from the optional `args:` line
    pub arguments: String,
    /// Current lifecycle status
    pub status: ToolCallStatus,
    /// Executor result, set on completion
    pub result: Option<String>,
    /// Executor error message, set on failure
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Outside,
    Inside,
}

/// Incremental scanner for delimited tool-call blocks.
#[derive(Debug)]
pub struct ToolCallParser {
    open: String,
    close: String,
    buffer: String,
    body: String,
    state: ScanState,
    next_id: u64,
}

impl Default for ToolCallParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallParser {
    /// Create a parser with the default angle-bracket delimiters.
    #[must_use]
    pub fn new() -> Self {
        Self::with_delimiters(DEFAULT_OPEN_DELIMITER, DEFAULT_CLOSE_DELIMITER)
    }

    /// Create a parser with custom delimiter strings.
    #[must_use]
    pub fn with_delimiters(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
            buffer: String::new(),
            body: String::new(),
            state: ScanState::Outside,
            next_id: 1,
        }
    }

    /// Whether the scanner is currently inside a delimited block.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        self.state == ScanState::Inside
    }

    /// Feed one decoded fragment; returns every tool call completed by it.
    pub fn push(&mut self, fragment: &str) -> Vec<ToolCall> {
        let mut calls = Vec::new();
        match self.state {
            ScanState::Outside => self.buffer.push_str(fragment),
            ScanState::Inside => self.body.push_str(fragment),
        }

        loop {
            match self.state {
                ScanState::Outside => {
                    if let Some(pos) = self.buffer.find(&self.open) {
                        let rest = self.buffer.split_off(pos + self.open.len());
                        self.buffer.clear();
                        self.body = rest;
                        self.state = ScanState::Inside;
                    } else {
                        self.trim_outside_buffer();
                        break;
                    }
                }
                ScanState::Inside => {
                    if let Some(pos) = self.body.find(&self.close) {
                        let rest = self.body.split_off(pos + self.close.len());
                        self.body.truncate(pos);
                        if let Some(call) = self.parse_body() {
                            calls.push(call);
                        }
                        self.body.clear();
                        self.buffer = rest;
                        self.state = ScanState::Outside;
                    } else {
                        break;
                    }
                }
            }
        }
        calls
    }

    /// Reset the scanner state, discarding any partial block.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.body.clear();
        self.state = ScanState::Outside;
    }

    /// Parse the accumulated body as `key: value` lines. Keys are
    /// case-insensitive and whitespace-trimmed; `name` is required, `args`
    /// optional. A malformed body yields no record.
    fn parse_body(&mut self) -> Option<ToolCall> {
        let mut name = None;
        let mut args = None;
        for line in self.body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once(':')?;
            match key.trim().to_ascii_lowercase().as_str() {
                "name" => name = Some(value.trim().to_string()),
                "args" => args = Some(value.trim().to_string()),
                _ => {}
            }
        }
        let name = name.filter(|n| !n.is_empty())?;
        let id = self.next_id;
        self.next_id += 1;
        Some(ToolCall {
            id,
            name,
            arguments: args.unwrap_or_default(),
            status: ToolCallStatus::Pending,
            result: None,
            error: None,
        })
    }

    /// Outside a block only a partial opening delimiter can matter; keep
    /// just enough buffer tail to match one across fragment boundaries.
    fn trim_outside_buffer(&mut self) {
        let keep = self.open.len().saturating_sub(1);
        if self.buffer.len() <= keep {
            return;
        }
        let mut cut = self.buffer.len() - keep;
        while cut < self.buffer.len() && !self.buffer.is_char_boundary(cut) {
            cut += 1;
        }
        self.buffer.drain(..cut);
    }
}
