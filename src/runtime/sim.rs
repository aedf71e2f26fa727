//! Simulated tensor runtime
//!
//! A deterministic, in-process stand-in for the external tensor-graph
//! runtime, exercising the exact facade contract the real adapters
//! implement: named KV past/present slots, growing sequence dimensions,
//! fp32/fp16/bf16 element types, caller-allocated outputs, and strict shape
//! validation. It backs the binary's demo mode and the test suite.
//!
//! The simulated causal LM is a toy next-token machine: the logit peak for
//! a position holding token `t` sits at `t + 1` (wrapping to the
//! end-of-sequence id at the vocabulary edge), so greedy decoding walks the
//! vocabulary deterministically and terminates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use half::{bf16, f16};

use crate::error::{ConversarError, Result};
use crate::runtime::{
    ElementType, ExecutionProvider, IoSpec, RuntimeSession, TensorData, TensorValue, TensorRuntime,
};

/// End-of-sequence id the simulated LM steers into at the vocabulary edge.
/// Matches the default `stop_token_ids` so sessions terminate naturally.
pub const SIM_EOS_ID: i64 = 2;

// ============================================================================
// Simulated causal LM
// ============================================================================

/// Shape and dtype configuration for a [`SimCausalLm`].
#[derive(Debug, Clone)]
pub struct SimLmConfig {
    /// Vocabulary size
    pub vocab_size: usize,
    /// Number of transformer layers (one key/value slot pair each)
    pub num_layers: usize,
    /// Number of KV attention heads
    pub num_kv_heads: usize,
    /// Per-head dimension
    pub head_dim: usize,
    /// Element type of the KV tensors
    pub kv_dtype: ElementType,
    /// Element type of the logits output
    pub logits_dtype: ElementType,
    /// Whether the graph declares a `position_ids` input
    pub with_position_ids: bool,
}

impl Default for SimLmConfig {
    fn default() -> Self {
        Self {
            vocab_size: 259,
            num_layers: 2,
            num_kv_heads: 4,
            head_dim: 8,
            kv_dtype: ElementType::F16,
            logits_dtype: ElementType::F32,
            with_position_ids: false,
        }
    }
}

/// Deterministic simulated decoder-only LM session.
pub struct SimCausalLm {
    config: SimLmConfig,
    inputs: Vec<IoSpec>,
    outputs: Vec<IoSpec>,
}

impl SimCausalLm {
    /// Build a simulated LM session from a configuration.
    #[must_use]
    pub fn new(config: SimLmConfig) -> Self {
        let h = config.num_kv_heads as i64;
        let d = config.head_dim as i64;
        let v = config.vocab_size as i64;

        let mut inputs = vec![
            IoSpec::new("input_ids", ElementType::I64, vec![1, -1]),
            IoSpec::new("attention_mask", ElementType::I64, vec![1, -1]),
        ];
        if config.with_position_ids {
            inputs.push(IoSpec::new("position_ids", ElementType::I64, vec![1, -1]));
        }
        for layer in 0..config.num_layers {
            inputs.push(IoSpec::new(
                format!("past_key_values.{layer}.key"),
                config.kv_dtype,
                vec![1, h, -1, d],
            ));
            inputs.push(IoSpec::new(
                format!("past_key_values.{layer}.value"),
                config.kv_dtype,
                vec![1, h, -1, d],
            ));
        }

        let mut outputs = vec![IoSpec::new(
            "logits",
            config.logits_dtype,
            vec![1, -1, v],
        )];
        for layer in 0..config.num_layers {
            outputs.push(IoSpec::new(
                format!("present.{layer}.key"),
                config.kv_dtype,
                vec![1, h, -1, d],
            ));
            outputs.push(IoSpec::new(
                format!("present.{layer}.value"),
                config.kv_dtype,
                vec![1, h, -1, d],
            ));
        }

        Self {
            config,
            inputs,
            outputs,
        }
    }

    /// The logit assigned to vocabulary entry `v` when the attended position
    /// holds token `t`. A single dominant peak plus deterministic ripple.
    fn logit_for(&self, t: i64, v: i64) -> f32 {
        let vocab = self.config.vocab_size as i64;
        let peak = if t + 1 >= vocab { SIM_EOS_ID } else { t + 1 };
        if v == peak {
            8.0
        } else {
            ((t * 31 + v * 17).rem_euclid(13)) as f32 * 0.01 - 0.06
        }
    }

    fn expect_input<'a>(
        inputs: &'a [(&str, &TensorValue)],
        name: &str,
    ) -> Result<&'a TensorValue> {
        inputs
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| *t)
            .ok_or_else(|| {
                ConversarError::invalid_argument(format!("missing input binding '{name}'"))
            })
    }
}

/// Write an f32 value sequence into tagged storage of any float dtype.
fn fill_floats(data: &mut TensorData, values: impl Iterator<Item = f32>) -> Result<()> {
    match data {
        TensorData::F32(out) => {
            for (slot, v) in out.iter_mut().zip(values) {
                *slot = v;
            }
        }
        TensorData::F16(out) => {
            for (slot, v) in out.iter_mut().zip(values) {
                *slot = f16::from_f32(v);
            }
        }
        TensorData::Bf16(out) => {
            for (slot, v) in out.iter_mut().zip(values) {
                *slot = bf16::from_f32(v);
            }
        }
        TensorData::I64(_) => {
            return Err(ConversarError::invalid_argument(
                "float output bound to an int64 tensor",
            ))
        }
    }
    Ok(())
}

impl RuntimeSession for SimCausalLm {
    fn inputs(&self) -> &[IoSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[IoSpec] {
        &self.outputs
    }

    fn run(
        &mut self,
        inputs: &[(&str, &TensorValue)],
        mut outputs: Vec<(String, TensorValue)>,
    ) -> Result<Vec<(String, TensorValue)>> {
        let cfg = &self.config;
        let ids_tensor = Self::expect_input(inputs, "input_ids")?;
        let ids = ids_tensor.as_i64()?;
        let l = ids.len();
        if ids_tensor.shape() != [1, l as i64] {
            return Err(ConversarError::invalid_argument(format!(
                "input_ids must be [1, L], got {:?}",
                ids_tensor.shape()
            )));
        }
        if l == 0 {
            return Err(ConversarError::invalid_argument("input_ids is empty"));
        }

        let mask = Self::expect_input(inputs, "attention_mask")?;
        let s_total = mask.as_i64()?.len();

        if cfg.with_position_ids {
            let pos = Self::expect_input(inputs, "position_ids")?;
            if pos.as_i64()?.len() != l {
                return Err(ConversarError::invalid_argument(
                    "position_ids length must match input_ids",
                ));
            }
        }

        // Every past slot must be bound with a consistent sequence length.
        let s_past = s_total
            .checked_sub(l)
            .ok_or_else(|| ConversarError::invalid_argument("attention_mask shorter than input"))?;
        for layer in 0..cfg.num_layers {
            for part in ["key", "value"] {
                let name = format!("past_key_values.{layer}.{part}");
                let past = Self::expect_input(inputs, &name)?;
                let shape = past.shape();
                let expected = [
                    1,
                    cfg.num_kv_heads as i64,
                    s_past as i64,
                    cfg.head_dim as i64,
                ];
                if shape != expected {
                    return Err(ConversarError::invalid_argument(format!(
                        "{name} has shape {shape:?}, expected {expected:?}"
                    )));
                }
                if past.dtype() != cfg.kv_dtype {
                    return Err(ConversarError::invalid_argument(format!(
                        "{name} bound with wrong dtype"
                    )));
                }
            }
        }

        // Fill caller-allocated outputs.
        for (name, tensor) in &mut outputs {
            if name == "logits" {
                let expected = [1, l as i64, cfg.vocab_size as i64];
                if tensor.shape() != expected {
                    return Err(ConversarError::invalid_argument(format!(
                        "logits allocated as {:?}, expected {expected:?}",
                        tensor.shape()
                    )));
                }
                let vocab = cfg.vocab_size as i64;
                let values = ids.to_vec();
                let this = &*self;
                fill_floats(
                    tensor.data_mut(),
                    values
                        .iter()
                        .flat_map(|&t| (0..vocab).map(move |v| (t, v)))
                        .map(|(t, v)| this.logit_for(t, v)),
                )?;
            } else if let Some(rest) = name.strip_prefix("present.") {
                let layer: usize = rest
                    .split('.')
                    .next()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        ConversarError::invalid_argument(format!("unknown output '{name}'"))
                    })?;
                let expected = [
                    1,
                    cfg.num_kv_heads as i64,
                    s_total as i64,
                    cfg.head_dim as i64,
                ];
                if tensor.shape() != expected {
                    return Err(ConversarError::invalid_argument(format!(
                        "{name} allocated as {:?}, expected {expected:?}",
                        tensor.shape()
                    )));
                }
                let heads = cfg.num_kv_heads;
                let dim = cfg.head_dim;
                fill_floats(
                    tensor.data_mut(),
                    (0..heads * s_total * dim).map(move |i| {
                        let pos = (i / dim) % s_total;
                        layer as f32 + pos as f32 * 0.001
                    }),
                )?;
            } else {
                return Err(ConversarError::invalid_argument(format!(
                    "unknown output binding '{name}'"
                )));
            }
        }

        Ok(outputs)
    }
}

// ============================================================================
// Simulated encoder (embedder / reranker)
// ============================================================================

/// Deterministic simulated single-output encoder session.
///
/// Produces a fixed-dimension float vector from the token ids. With
/// `output_name = "logits"` and `dim = 1` it doubles as a reranker model.
pub struct SimEncoder {
    dim: usize,
    inputs: Vec<IoSpec>,
    outputs: Vec<IoSpec>,
}

impl SimEncoder {
    /// Build a simulated encoder with the given output slot name, dimension
    /// and output element type.
    #[must_use]
    pub fn new(output_name: &str, dim: usize, dtype: ElementType) -> Self {
        Self {
            dim,
            inputs: vec![
                IoSpec::new("input_ids", ElementType::I64, vec![1, -1]),
                IoSpec::new("attention_mask", ElementType::I64, vec![1, -1]),
            ],
            outputs: vec![IoSpec::new(output_name, dtype, vec![1, dim as i64])],
        }
    }

    fn component(ids: &[i64], j: usize) -> f32 {
        let mut acc = 0.0f32;
        for &id in ids {
            acc += ((id * (j as i64 + 7)).rem_euclid(101) - 50) as f32 / 50.0;
        }
        acc / ids.len() as f32
    }
}

impl RuntimeSession for SimEncoder {
    fn inputs(&self) -> &[IoSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[IoSpec] {
        &self.outputs
    }

    fn run(
        &mut self,
        inputs: &[(&str, &TensorValue)],
        mut outputs: Vec<(String, TensorValue)>,
    ) -> Result<Vec<(String, TensorValue)>> {
        let ids = SimCausalLm::expect_input(inputs, "input_ids")?.as_i64()?;
        if ids.is_empty() {
            return Err(ConversarError::invalid_argument("input_ids is empty"));
        }
        let mask = SimCausalLm::expect_input(inputs, "attention_mask")?.as_i64()?;
        if mask.len() != ids.len() {
            return Err(ConversarError::invalid_argument(
                "attention_mask length must match input_ids",
            ));
        }

        let expected_name = &self.outputs[0].name;
        for (name, tensor) in &mut outputs {
            if name != expected_name {
                return Err(ConversarError::invalid_argument(format!(
                    "unknown output binding '{name}'"
                )));
            }
            if tensor.shape() != [1, self.dim as i64] {
                return Err(ConversarError::invalid_argument(format!(
                    "{name} allocated as {:?}, expected [1, {}]",
                    tensor.shape(),
                    self.dim
                )));
            }
            fill_floats(
                tensor.data_mut(),
                (0..self.dim).map(|j| Self::component(ids, j)),
            )?;
        }
        Ok(outputs)
    }
}

// ============================================================================
// Session factory
// ============================================================================

/// Which simulated model a registered path maps to.
#[derive(Debug, Clone)]
pub enum SimModel {
    /// A causal LM with the given configuration
    CausalLm(SimLmConfig),
    /// An encoder: (output name, dimension, dtype)
    Encoder(String, usize, ElementType),
}

/// Simulated [`TensorRuntime`]: a registry from model paths to simulated
/// sessions. Unregistered paths fail with `NotFound`; the only supported
/// execution provider is CPU.
#[derive(Debug, Default)]
pub struct SimRuntime {
    models: HashMap<PathBuf, SimModel>,
}

impl SimRuntime {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a simulated model under a path
    pub fn register(&mut self, path: impl Into<PathBuf>, model: SimModel) {
        self.models.insert(path.into(), model);
    }
}

impl TensorRuntime for SimRuntime {
    fn load_session(
        &self,
        model_path: &Path,
        providers: &[ExecutionProvider],
    ) -> Result<Box<dyn RuntimeSession>> {
        if !providers.contains(&ExecutionProvider::Cpu) {
            return Err(ConversarError::invalid_argument(
                "simulated runtime supports only the CPU execution provider",
            ));
        }
        match self.models.get(model_path) {
            Some(SimModel::CausalLm(config)) => Ok(Box::new(SimCausalLm::new(config.clone()))),
            Some(SimModel::Encoder(name, dim, dtype)) => {
                Ok(Box::new(SimEncoder::new(name, *dim, *dtype)))
            }
            None => Err(ConversarError::NotFound {
                path: model_path.display().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_lm(
        session: &mut SimCausalLm,
        ids: &[i64],
        s_past: usize,
    ) -> Result<Vec<(String, TensorValue)>> {
        let cfg = session.config.clone();
        let l = ids.len();
        let s_total = s_past + l;
        let ids_t = TensorValue::from_i64_row(ids).expect("ids");
        let mask = TensorValue::from_i64_row(&vec![1i64; s_total]).expect("mask");
        let pasts: Vec<TensorValue> = (0..cfg.num_layers * 2)
            .map(|_| {
                TensorValue::zeros(
                    cfg.kv_dtype,
                    &[1, cfg.num_kv_heads as i64, s_past as i64, cfg.head_dim as i64],
                )
                .expect("past")
            })
            .collect();

        let mut inputs: Vec<(&str, &TensorValue)> =
            vec![("input_ids", &ids_t), ("attention_mask", &mask)];
        let mut names = Vec::new();
        for layer in 0..cfg.num_layers {
            names.push(format!("past_key_values.{layer}.key"));
            names.push(format!("past_key_values.{layer}.value"));
        }
        for (name, tensor) in names.iter().zip(&pasts) {
            inputs.push((name.as_str(), tensor));
        }

        let mut outputs = vec![(
            "logits".to_string(),
            TensorValue::zeros(
                cfg.logits_dtype,
                &[1, l as i64, cfg.vocab_size as i64],
            )
            .expect("logits"),
        )];
        for layer in 0..cfg.num_layers {
            for part in ["key", "value"] {
                outputs.push((
                    format!("present.{layer}.{part}"),
                    TensorValue::zeros(
                        cfg.kv_dtype,
                        &[
                            1,
                            cfg.num_kv_heads as i64,
                            s_total as i64,
                            cfg.head_dim as i64,
                        ],
                    )
                    .expect("present"),
                ));
            }
        }

        session.run(&inputs, outputs)
    }

    #[test]
    fn test_sim_lm_logit_peak_is_next_token() {
        let mut lm = SimCausalLm::new(SimLmConfig::default());
        let outputs = run_lm(&mut lm, &[10], 0).expect("run");
        let logits = outputs[0].1.to_f32_vec().expect("widen");
        let argmax = logits
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .expect("argmax");
        assert_eq!(argmax, 11);
    }

    #[test]
    fn test_sim_lm_rejects_inconsistent_mask() {
        let mut lm = SimCausalLm::new(SimLmConfig::default());
        // mask shorter than input ids
        let ids = TensorValue::from_i64_row(&[1, 2, 3]).expect("ids");
        let mask = TensorValue::from_i64_row(&[1]).expect("mask");
        let result = lm.run(&[("input_ids", &ids), ("attention_mask", &mask)], vec![]);
        assert!(result.is_err());
    }

    #[test]
    fn test_sim_encoder_is_deterministic() {
        let mut enc = SimEncoder::new("sentence_embedding", 16, ElementType::F32);
        let ids = TensorValue::from_i64_row(&[5, 9, 13]).expect("ids");
        let mask = TensorValue::from_i64_row(&[1, 1, 1]).expect("mask");
        let out = TensorValue::zeros(ElementType::F32, &[1, 16]).expect("out");
        let inputs = [("input_ids", &ids), ("attention_mask", &mask)];

        let a = enc
            .run(&inputs, vec![("sentence_embedding".to_string(), out.clone())])
            .expect("run a");
        let b = enc
            .run(&inputs, vec![("sentence_embedding".to_string(), out)])
            .expect("run b");
        assert_eq!(a[0].1, b[0].1);
    }

    #[test]
    fn test_sim_runtime_not_found_and_provider_check() {
        let mut runtime = SimRuntime::new();
        runtime.register("demo.onnx", SimModel::CausalLm(SimLmConfig::default()));

        assert!(matches!(
            runtime.load_session(Path::new("missing.onnx"), &[ExecutionProvider::Cpu]),
            Err(ConversarError::NotFound { .. })
        ));
        assert!(matches!(
            runtime.load_session(Path::new("demo.onnx"), &[ExecutionProvider::Cuda]),
            Err(ConversarError::InvalidArgument { .. })
        ));
        assert!(runtime
            .load_session(Path::new("demo.onnx"), &[ExecutionProvider::Cpu])
            .is_ok());
    }
}
