//! Command-line surface
//!
//! Argument parsing and the interactive REPL. The REPL reads one user turn
//! per line from standard input, streams the agent's fragments to standard
//! output, and exits cleanly on an empty line.
//!
//! Real model files require a tensor-graph runtime adapter linked into the
//! host binary; `--demo` runs the full pipeline against the in-process
//! simulated runtime instead.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use crate::agent::Agent;
use crate::error::{ConversarError, Result};
use crate::model::decoder::DecoderModel;
use crate::model::encoder::{Embedder, Reranker};
use crate::retrieval::{MemoryVectorStore, RetrievalItem, VectorStore};
use crate::runtime::sim::{SimLmConfig, SimModel, SimRuntime};
use crate::runtime::{ElementType, ExecutionProvider, TensorRuntime};
use crate::sample::{ModelFamily, SamplingConfig};
use crate::session::ConversationSession;
use crate::tokenizer::ByteTokenizer;

/// Conversar - streaming conversational inference for ONNX-exported LLMs
#[derive(Debug, Parser)]
#[command(name = "conversar")]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Causal LM model file
    #[arg(required_unless_present = "demo")]
    pub llm_model: Option<PathBuf>,

    /// Causal LM tokenizer file
    #[arg(required_unless_present = "demo")]
    pub llm_tokenizer: Option<PathBuf>,

    /// Embedding model file
    #[arg(required_unless_present = "demo")]
    pub embedding_model: Option<PathBuf>,

    /// Embedding tokenizer file
    #[arg(required_unless_present = "demo")]
    pub embedding_tokenizer: Option<PathBuf>,

    /// Optional reranker model file
    pub reranker_model: Option<PathBuf>,

    /// Optional reranker tokenizer file
    pub reranker_tokenizer: Option<PathBuf>,

    /// Run against the in-process simulated runtime
    #[arg(long)]
    pub demo: bool,
}

/// Entry point behind `main`: build the agent and run the REPL.
///
/// # Errors
///
/// Any initialization failure surfaces here; the binary maps it to a
/// non-zero exit code.
pub fn run(args: &CliArgs) -> Result<()> {
    let mut agent = if args.demo {
        build_demo_agent()?
    } else {
        build_agent(args)?
    };
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    run_repl(&mut agent, stdin.lock(), stdout.lock())
}

fn require_exists(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(ConversarError::NotFound {
            path: path.display().to_string(),
        })
    }
}

/// The real-model path. Checks the files, then reports that no runtime
/// adapter is linked; hosts embedding this crate plug their adapter in
/// here.
fn build_agent(args: &CliArgs) -> Result<Agent> {
    for path in [
        args.llm_model.as_deref(),
        args.llm_tokenizer.as_deref(),
        args.embedding_model.as_deref(),
        args.embedding_tokenizer.as_deref(),
        args.reranker_model.as_deref(),
        args.reranker_tokenizer.as_deref(),
    ]
    .into_iter()
    .flatten()
    {
        require_exists(path)?;
    }
    Err(ConversarError::runtime(
        "no tensor-graph runtime adapter is linked into this binary; use --demo",
    ))
}

/// Wire the full pipeline over the simulated runtime: LM, embedder,
/// reranker, and a small seeded document store.
pub fn build_demo_agent() -> Result<Agent> {
    let mut runtime = SimRuntime::new();
    runtime.register("demo://llm", SimModel::CausalLm(SimLmConfig::default()));
    runtime.register(
        "demo://embedder",
        SimModel::Encoder("sentence_embedding".to_string(), 64, ElementType::F32),
    );
    runtime.register(
        "demo://reranker",
        SimModel::Encoder("logits".to_string(), 1, ElementType::F32),
    );
    let providers = [ExecutionProvider::Cpu];

    let tokenizer = Arc::new(ByteTokenizer::new());
    let lm = runtime.load_session(Path::new("demo://llm"), &providers)?;
    let decoder = DecoderModel::new(lm)?;
    let config = ModelFamily::detect("demo://llm")
        .apply_defaults(SamplingConfig::greedy().with_max_tokens(48));
    let session = ConversationSession::new(decoder, tokenizer.clone(), config);

    let mut embedder = Embedder::new(
        runtime.load_session(Path::new("demo://embedder"), &providers)?,
        tokenizer.clone(),
    );
    let reranker = Reranker::new(
        runtime.load_session(Path::new("demo://reranker"), &providers)?,
        tokenizer,
    );

    let mut store = MemoryVectorStore::new();
    for (id, text) in [
        ("demo/engine.md", "The generation core binds a growing KV cache across steps."),
        ("demo/sampling.md", "Sampling applies penalties, temperature, min-p, top-k and top-p."),
        ("demo/tools.md", "Tool calls are delimited blocks parsed out of the token stream."),
    ] {
        let vector = embedder.embed(text)?;
        store.upsert(RetrievalItem::new(id, vector, text))?;
    }

    Ok(Agent::new(session)
        .with_retrieval(embedder, Box::new(store))
        .with_reranker(reranker)
        .with_tool_executor(Box::new(|name, args| {
            Ok(format!("demo executor received {name}({args})"))
        })))
}

/// Interactive loop: one turn per input line, empty line exits.
///
/// A failed turn prints the fragments produced so far followed by a
/// terminal error line, then the REPL continues with the next line.
pub fn run_repl<R: BufRead, W: Write>(agent: &mut Agent, input: R, mut out: W) -> Result<()> {
    let io_err = |e: std::io::Error| ConversarError::runtime(e.to_string());

    for line in input.lines() {
        let line = line.map_err(io_err)?;
        let text = line.trim_end_matches(['\r', '\n']);
        if text.is_empty() {
            break;
        }

        match agent.chat_turn(text) {
            Ok(stream) => {
                let mut failed = None;
                for fragment in stream {
                    match fragment {
                        Ok(fragment) => {
                            out.write_all(fragment.as_bytes()).map_err(io_err)?;
                            out.flush().map_err(io_err)?;
                        }
                        Err(e) => {
                            failed = Some(e);
                            break;
                        }
                    }
                }
                match failed {
                    Some(e) => writeln!(out, "\nerror: {e}").map_err(io_err)?,
                    None => writeln!(out).map_err(io_err)?,
                }
            }
            Err(e) => writeln!(out, "error: {e}").map_err(io_err)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_args_require_models_unless_demo() {
        assert!(CliArgs::try_parse_from(["conversar"]).is_err());
        assert!(CliArgs::try_parse_from(["conversar", "--demo"]).is_ok());

        let args = CliArgs::try_parse_from([
            "conversar",
            "llm.onnx",
            "llm-tok.json",
            "embed.onnx",
            "embed-tok.json",
        ])
        .expect("full positional set");
        assert_eq!(args.llm_model.as_deref(), Some(Path::new("llm.onnx")));
        assert!(args.reranker_model.is_none());
        assert!(!args.demo);
    }

    #[test]
    fn test_missing_model_file_reports_not_found() {
        let args = CliArgs::try_parse_from([
            "conversar",
            "/nonexistent/llm.onnx",
            "/nonexistent/tok.json",
            "/nonexistent/embed.onnx",
            "/nonexistent/etok.json",
        ])
        .expect("parse");
        assert!(matches!(
            build_agent(&args),
            Err(ConversarError::NotFound { .. })
        ));
    }

    #[test]
    fn test_repl_exits_on_empty_line() {
        let mut agent = build_demo_agent().expect("demo agent");
        let mut out = Vec::new();
        run_repl(&mut agent, Cursor::new(b"\n".to_vec()), &mut out).expect("repl");
        assert!(out.is_empty());
    }

    #[test]
    fn test_repl_streams_one_turn() {
        let mut agent = build_demo_agent().expect("demo agent");
        let mut out = Vec::new();
        run_repl(&mut agent, Cursor::new(b"abc\n\n".to_vec()), &mut out).expect("repl");
        let text = String::from_utf8_lossy(&out);
        assert!(!text.is_empty());
        assert!(!text.contains("error:"));
    }
}
