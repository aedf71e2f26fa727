//! Causal-LM step driver
//!
//! One synchronous forward pass of the loaded decoder-only model: assemble
//! the input vector (token ids, attention mask, optional position ids, KV
//! past tensors), allocate the output tensors (logits, KV present), invoke
//! the runtime, and return the logits together with the new KV state.
//!
//! Calls are strictly sequential per session; the underlying runtime is not
//! assumed reentrant. The driver owns no KV tensors between steps: the
//! returned [`KvState`] does, and the caller replaces its previous state
//! with it (dropping the old tensors only after the new state is committed).

use std::collections::HashMap;

use crate::error::{ConversarError, Result};
use crate::model::kv::{KvLayout, KvState};
use crate::runtime::{CancelToken, ElementType, RuntimeSession, TensorData, TensorValue};

/// The result of one forward pass.
#[derive(Debug)]
pub struct StepOutput {
    /// Raw logits tensor in the model's declared dtype
    pub logits: TensorValue,
    /// The new KV state, owning every present tensor
    pub kv: KvState,
}

/// Step driver for a loaded causal LM.
pub struct DecoderModel {
    session: Box<dyn RuntimeSession>,
    layout: KvLayout,
    vocab_size: usize,
    logits_dtype: ElementType,
    logits_has_seq_axis: bool,
    binds_position_ids: bool,
}

impl DecoderModel {
    /// Wrap a loaded session, discovering the KV layout and the logits
    /// geometry from the declared IO metadata.
    ///
    /// # Errors
    ///
    /// Returns [`ConversarError::InvariantViolation`] when the graph does
    /// not declare the expected slots (`input_ids`, `attention_mask`,
    /// `logits`), when the logits vocabulary dimension is symbolic, or when
    /// any KV tensor is unpaired.
    pub fn new(session: Box<dyn RuntimeSession>) -> Result<Self> {
        let has_input = |name: &str| session.inputs().iter().any(|s| s.name == name);
        for required in ["input_ids", "attention_mask"] {
            if !has_input(required) {
                return Err(ConversarError::invariant(format!(
                    "model declares no '{required}' input"
                )));
            }
        }
        let binds_position_ids = has_input("position_ids");

        let logits = session
            .outputs()
            .iter()
            .find(|s| s.name == "logits")
            .ok_or_else(|| ConversarError::invariant("model declares no 'logits' output"))?;
        let vocab = logits.shape.last().copied().unwrap_or(-1);
        if vocab <= 0 {
            return Err(ConversarError::invariant(
                "logits vocabulary dimension must be concrete",
            ));
        }
        let logits_dtype = logits.dtype;
        let logits_has_seq_axis = logits.shape.len() == 3;

        let layout = KvLayout::discover(session.inputs(), session.outputs())?;

        Ok(Self {
            session,
            layout,
            vocab_size: vocab as usize,
            logits_dtype,
            logits_has_seq_axis,
            binds_position_ids,
        })
    }

    /// Vocabulary size `V` declared by the logits output
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// The discovered KV layout
    #[must_use]
    pub fn kv_layout(&self) -> &KvLayout {
        &self.layout
    }

    /// Run one forward pass over `input_ids` on top of `past`.
    ///
    /// Advances the accumulated sequence length by `input_ids.len()`. The
    /// previous state is only borrowed: its tensors stay alive as the bound
    /// past inputs for the duration of the call, and the caller disposes
    /// them by replacing its state with the returned one.
    ///
    /// # Errors
    ///
    /// - [`ConversarError::Cancelled`] when `cancel` trips before assembly
    ///   or before dispatch; `past` is untouched.
    /// - [`ConversarError::InvalidArgument`] for an empty `input_ids`.
    /// - [`ConversarError::InvariantViolation`] when the produced present
    ///   tensors disagree with the accumulated sequence length.
    /// - [`ConversarError::RuntimeFailure`] for runtime errors, message
    ///   preserved.
    pub fn run_step(
        &mut self,
        input_ids: &[i64],
        past: &KvState,
        cancel: &CancelToken,
    ) -> Result<StepOutput> {
        cancel.check()?;

        let l = input_ids.len();
        if l == 0 {
            return Err(ConversarError::invalid_argument("input_ids is empty"));
        }
        let s_before = past.seq_len();
        let s_total = s_before + l;

        let layout = &self.layout;
        let session = &mut self.session;

        let ids_tensor = TensorValue::from_i64_row(input_ids)?;
        let mask_tensor = TensorValue::from_i64_row(&vec![1i64; s_total])?;
        let pos_tensor = if self.binds_position_ids {
            let positions: Vec<i64> = (s_before as i64..s_total as i64).collect();
            Some(TensorValue::from_i64_row(&positions)?)
        } else {
            None
        };

        // First step: zero-length placeholders, one per past slot.
        let placeholders: Vec<TensorValue> = if past.is_empty() {
            layout
                .slots()
                .iter()
                .map(|slot| {
                    TensorValue::zeros(slot.dtype, &[1, slot.num_kv_heads, 0, slot.head_dim])
                })
                .collect::<Result<_>>()?
        } else {
            Vec::new()
        };

        let mut inputs: Vec<(&str, &TensorValue)> = Vec::with_capacity(3 + layout.len());
        inputs.push(("input_ids", &ids_tensor));
        inputs.push(("attention_mask", &mask_tensor));
        if let Some(pos) = &pos_tensor {
            inputs.push(("position_ids", pos));
        }
        for (idx, slot) in layout.slots().iter().enumerate() {
            let tensor = if past.is_empty() {
                &placeholders[idx]
            } else {
                past.entry(idx).ok_or_else(|| {
                    ConversarError::invariant(format!(
                        "KV state holds no tensor for slot '{}'",
                        slot.input_name
                    ))
                })?
            };
            inputs.push((slot.input_name.as_str(), tensor));
        }

        // Caller-allocated outputs: logits plus one present tensor per slot.
        let logits_shape: Vec<i64> = if self.logits_has_seq_axis {
            vec![1, l as i64, self.vocab_size as i64]
        } else {
            vec![1, self.vocab_size as i64]
        };
        let mut outputs = vec![(
            "logits".to_string(),
            TensorValue::zeros(self.logits_dtype, &logits_shape)?,
        )];
        for slot in layout.slots() {
            outputs.push((
                slot.output_name.clone(),
                TensorValue::zeros(
                    slot.dtype,
                    &[1, slot.num_kv_heads, s_total as i64, slot.head_dim],
                )?,
            ));
        }

        cancel.check()?;
        let produced = session.run(&inputs, outputs)?;

        let mut logits = None;
        let mut presents = HashMap::with_capacity(layout.len());
        for (name, tensor) in produced {
            if name == "logits" {
                logits = Some(tensor);
            } else {
                presents.insert(name, tensor);
            }
        }
        let logits =
            logits.ok_or_else(|| ConversarError::invariant("step returned no logits tensor"))?;
        let kv = KvState::assemble(layout, s_total, presents)?;

        Ok(StepOutput { logits, kv })
    }

    /// Slice the last-position logits out of a step's logits tensor,
    /// widening to `f32`.
    ///
    /// Works for `[1, L, V]` tensors (prefill allocates every position but
    /// only the last is read) and for models whose logits lack the sequence
    /// axis entirely.
    pub fn last_position_logits(&self, logits: &TensorValue) -> Result<Vec<f32>> {
        let v = self.vocab_size;
        let n = logits.len();
        if n < v {
            return Err(ConversarError::invariant(format!(
                "logits tensor holds {n} elements, vocabulary is {v}"
            )));
        }
        let start = n - v;
        let row = match logits.data() {
            TensorData::F32(data) => data[start..].to_vec(),
            TensorData::F16(data) => data[start..].iter().map(|x| x.to_f32()).collect(),
            TensorData::Bf16(data) => data[start..].iter().map(|x| x.to_f32()).collect(),
            TensorData::I64(_) => {
                return Err(ConversarError::invariant("logits tensor is int64"))
            }
        };
        Ok(row)
    }
}
