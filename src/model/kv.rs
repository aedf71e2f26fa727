//! KV tensor mapping and state
//!
//! A causal LM declares a family of "past" input tensors and "present"
//! output tensors, one key/value pair per layer. The pairing is discovered
//! once per loaded model by regex over the declared slot names; the result
//! is a static [`KvLayout`]. The tensors produced by one step become the
//! next step's past through a [`KvState`], which owns them exclusively.

use std::collections::HashMap;

use regex::Regex;

use crate::error::{ConversarError, Result};
use crate::runtime::{ElementType, IoSpec, TensorValue};

/// Dimension convention for KV tensors: `[batch, num_kv_heads, seq, head_dim]`.
const KV_RANK: usize = 4;
/// Index of the growing sequence dimension.
pub(crate) const KV_SEQ_AXIS: usize = 2;

// ============================================================================
// Layout discovery
// ============================================================================

/// Descriptor for one past/present tensor pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvSlot {
    /// Name of the past-side input tensor
    pub input_name: String,
    /// Name of the present-side output tensor
    pub output_name: String,
    /// Declared element type
    pub dtype: ElementType,
    /// Number of KV heads (dimension 1)
    pub num_kv_heads: i64,
    /// Per-head dimension (dimension 3)
    pub head_dim: i64,
    /// Offset of the past tensor within the model's input vector
    pub slot: usize,
}

/// The static past/present mapping for a loaded model.
#[derive(Debug, Clone)]
pub struct KvLayout {
    slots: Vec<KvSlot>,
    by_output: HashMap<String, usize>,
    by_input: HashMap<String, usize>,
}

impl KvLayout {
    /// Discover the KV mapping from the declared inputs and outputs.
    ///
    /// Inputs matching `past…<index><suffix>` pair with outputs matching
    /// `present…<index><suffix>` on identical `(index, suffix)` keys.
    ///
    /// # Errors
    ///
    /// Returns [`ConversarError::InvariantViolation`] when any KV tensor is
    /// unpaired, when a KV tensor is not rank 4, or when the head
    /// dimensions are symbolic (they are needed to allocate the zero-length
    /// first-step tensors).
    pub fn discover(inputs: &[IoSpec], outputs: &[IoSpec]) -> Result<Self> {
        let past_re = Regex::new(r"^past.*?(\d+)(.*)$").expect("static regex");
        let present_re = Regex::new(r"^present.*?(\d+)(.*)$").expect("static regex");

        let mut past_by_key: HashMap<(String, String), (usize, &IoSpec)> = HashMap::new();
        for (slot, spec) in inputs.iter().enumerate() {
            if let Some(caps) = past_re.captures(&spec.name) {
                let key = (caps[1].to_string(), caps[2].to_string());
                past_by_key.insert(key, (slot, spec));
            }
        }

        let mut slots = Vec::new();
        for spec in outputs {
            let Some(caps) = present_re.captures(&spec.name) else {
                continue;
            };
            let key = (caps[1].to_string(), caps[2].to_string());
            let (slot, past) = past_by_key.remove(&key).ok_or_else(|| {
                ConversarError::invariant(format!(
                    "present tensor '{}' has no matching past input",
                    spec.name
                ))
            })?;
            if past.shape.len() != KV_RANK {
                return Err(ConversarError::invariant(format!(
                    "KV tensor '{}' is rank {}, expected {KV_RANK}",
                    past.name,
                    past.shape.len()
                )));
            }
            let num_kv_heads = past.shape[1];
            let head_dim = past.shape[3];
            if num_kv_heads < 0 || head_dim < 0 {
                return Err(ConversarError::invariant(format!(
                    "KV tensor '{}' declares symbolic head dimensions",
                    past.name
                )));
            }
            slots.push(KvSlot {
                input_name: past.name.clone(),
                output_name: spec.name.clone(),
                dtype: past.dtype,
                num_kv_heads,
                head_dim,
                slot,
            });
        }

        if let Some((_, (_, orphan))) = past_by_key.iter().next() {
            return Err(ConversarError::invariant(format!(
                "past tensor '{}' has no matching present output",
                orphan.name
            )));
        }

        // Keep declared input order so slot offsets are monotonic.
        slots.sort_by_key(|s| s.slot);
        let by_output = slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.output_name.clone(), i))
            .collect();
        let by_input = slots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.input_name.clone(), i))
            .collect();

        Ok(Self {
            slots,
            by_output,
            by_input,
        })
    }

    /// The discovered slots, in input order
    #[must_use]
    pub fn slots(&self) -> &[KvSlot] {
        &self.slots
    }

    /// Number of past/present pairs
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the model declares no KV tensors
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Look up a slot by its present-side output name
    #[must_use]
    pub fn slot_for_output(&self, name: &str) -> Option<&KvSlot> {
        self.by_output.get(name).map(|&i| &self.slots[i])
    }

    /// Look up a slot by its past-side input name
    #[must_use]
    pub fn slot_for_input(&self, name: &str) -> Option<&KvSlot> {
        self.by_input.get(name).map(|&i| &self.slots[i])
    }
}

// ============================================================================
// KV state
// ============================================================================

/// Accumulated KV state of one session.
///
/// Owns the present tensors produced by the latest step, one per past slot,
/// plus the authoritative accumulated sequence length. Deliberately not
/// `Clone`: KV tensors belong to exactly one state at any moment, and the
/// previous state is dropped only after the next one is committed.
#[derive(Debug)]
pub struct KvState {
    seq_len: usize,
    entries: Vec<TensorValue>,
}

impl KvState {
    /// The empty state a session starts from (`S = 0`, no tensors).
    #[must_use]
    pub fn empty() -> Self {
        Self {
            seq_len: 0,
            entries: Vec::new(),
        }
    }

    /// Assemble a state from the present tensors of a completed step.
    ///
    /// `by_output` maps present output names to their tensors. Totality and
    /// per-tensor sequence length are enforced here: exactly one tensor per
    /// layout slot, each with `seq` dimension equal to `seq_len`.
    ///
    /// # Errors
    ///
    /// Returns [`ConversarError::InvariantViolation`] on a missing present
    /// tensor or a sequence-length disagreement.
    pub fn assemble(
        layout: &KvLayout,
        seq_len: usize,
        mut by_output: HashMap<String, TensorValue>,
    ) -> Result<Self> {
        let mut entries = Vec::with_capacity(layout.len());
        for slot in layout.slots() {
            let tensor = by_output.remove(&slot.output_name).ok_or_else(|| {
                ConversarError::invariant(format!(
                    "step produced no present tensor for '{}'",
                    slot.output_name
                ))
            })?;
            let declared_seq = tensor.shape().get(KV_SEQ_AXIS).copied().unwrap_or(-1);
            if declared_seq != seq_len as i64 {
                return Err(ConversarError::invariant(format!(
                    "present tensor '{}' has seq {declared_seq}, accumulated length is {seq_len}",
                    slot.output_name
                )));
            }
            entries.push(tensor);
        }
        Ok(Self { seq_len, entries })
    }

    /// Accumulated sequence length `S`
    #[must_use]
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Whether this is the pre-first-step empty state
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The present tensor for layout slot index `idx`
    #[must_use]
    pub fn entry(&self, idx: usize) -> Option<&TensorValue> {
        self.entries.get(idx)
    }

    /// Iterate the present tensors in layout slot order
    pub fn iter(&self) -> impl Iterator<Item = &TensorValue> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lm_io(layers: usize) -> (Vec<IoSpec>, Vec<IoSpec>) {
        let mut inputs = vec![
            IoSpec::new("input_ids", ElementType::I64, vec![1, -1]),
            IoSpec::new("attention_mask", ElementType::I64, vec![1, -1]),
        ];
        let mut outputs = vec![IoSpec::new("logits", ElementType::F32, vec![1, -1, 100])];
        for i in 0..layers {
            for part in ["key", "value"] {
                inputs.push(IoSpec::new(
                    format!("past_key_values.{i}.{part}"),
                    ElementType::F16,
                    vec![1, 4, -1, 8],
                ));
                outputs.push(IoSpec::new(
                    format!("present.{i}.{part}"),
                    ElementType::F16,
                    vec![1, 4, -1, 8],
                ));
            }
        }
        (inputs, outputs)
    }

    #[test]
    fn test_discover_pairs_all_layers() {
        let (inputs, outputs) = lm_io(3);
        let layout = KvLayout::discover(&inputs, &outputs).expect("layout");
        assert_eq!(layout.len(), 6);

        let slot = layout
            .slot_for_output("present.1.value")
            .expect("slot lookup");
        assert_eq!(slot.input_name, "past_key_values.1.value");
        assert_eq!(slot.num_kv_heads, 4);
        assert_eq!(slot.head_dim, 8);
        // Offsets start after input_ids and attention_mask.
        assert!(slot.slot >= 2);
        assert_eq!(
            layout.slot_for_input("past_key_values.1.value").map(|s| s.slot),
            Some(slot.slot)
        );
    }

    #[test]
    fn test_discover_rejects_unpaired_present() {
        let (inputs, mut outputs) = lm_io(1);
        outputs.push(IoSpec::new(
            "present.7.key",
            ElementType::F16,
            vec![1, 4, -1, 8],
        ));
        let err = KvLayout::discover(&inputs, &outputs);
        assert!(matches!(err, Err(ConversarError::InvariantViolation { .. })));
    }

    #[test]
    fn test_discover_rejects_unpaired_past() {
        let (mut inputs, outputs) = lm_io(1);
        inputs.push(IoSpec::new(
            "past_key_values.9.key",
            ElementType::F16,
            vec![1, 4, -1, 8],
        ));
        let err = KvLayout::discover(&inputs, &outputs);
        assert!(matches!(err, Err(ConversarError::InvariantViolation { .. })));
    }

    #[test]
    fn test_assemble_enforces_seq_and_totality() {
        let (inputs, outputs) = lm_io(1);
        let layout = KvLayout::discover(&inputs, &outputs).expect("layout");

        let mut tensors = HashMap::new();
        tensors.insert(
            "present.0.key".to_string(),
            TensorValue::zeros(ElementType::F16, &[1, 4, 5, 8]).expect("tensor"),
        );
        tensors.insert(
            "present.0.value".to_string(),
            TensorValue::zeros(ElementType::F16, &[1, 4, 5, 8]).expect("tensor"),
        );
        let state = KvState::assemble(&layout, 5, tensors).expect("assemble");
        assert_eq!(state.seq_len(), 5);
        assert!(!state.is_empty());

        // Wrong seq dimension
        let mut tensors = HashMap::new();
        tensors.insert(
            "present.0.key".to_string(),
            TensorValue::zeros(ElementType::F16, &[1, 4, 4, 8]).expect("tensor"),
        );
        tensors.insert(
            "present.0.value".to_string(),
            TensorValue::zeros(ElementType::F16, &[1, 4, 5, 8]).expect("tensor"),
        );
        assert!(KvState::assemble(&layout, 5, tensors).is_err());

        // Missing slot
        let mut tensors = HashMap::new();
        tensors.insert(
            "present.0.key".to_string(),
            TensorValue::zeros(ElementType::F16, &[1, 4, 5, 8]).expect("tensor"),
        );
        assert!(KvState::assemble(&layout, 5, tensors).is_err());
    }

    #[test]
    fn test_empty_state() {
        let state = KvState::empty();
        assert_eq!(state.seq_len(), 0);
        assert!(state.is_empty());
        assert!(state.entry(0).is_none());
    }
}
