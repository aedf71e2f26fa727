//! Tensor-runtime facade
//!
//! Thin abstraction over the external tensor-graph runtime. The facade
//! covers exactly what the generation core needs: session construction with
//! execution-provider preferences, enumeration of input/output metadata,
//! tensor allocation of a given dtype and shape, and a synchronous
//! bind-and-run call against named slots.
//!
//! Tensor ownership never rests with the runtime: the caller allocates every
//! output tensor, passes inputs by reference, and receives the filled
//! outputs back.
//!
//! Concrete adapters (ONNX Runtime et al.) implement [`RuntimeSession`] and
//! [`TensorRuntime`] out of tree; the in-tree [`sim`] module provides a
//! deterministic simulated runtime for the demo binary and the test suite.

pub mod sim;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use half::{bf16, f16};

use crate::error::{ConversarError, Result};

// ============================================================================
// Execution providers
// ============================================================================

/// Execution providers a runtime session may be asked to prefer, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionProvider {
    /// Plain CPU execution
    Cpu,
    /// NVIDIA CUDA
    Cuda,
    /// AMD ROCm
    Rocm,
    /// DirectML (Windows)
    DirectMl,
    /// Intel OpenVINO
    OpenVino,
    /// Apple CoreML
    CoreMl,
    /// AMD MIGraphX
    MiGraphX,
    /// NVIDIA TensorRT
    TensorRt,
    /// Android NNAPI
    Nnapi,
    /// Intel oneDNN
    OneDnn,
}

// ============================================================================
// Element types and tensor values
// ============================================================================

/// Element type of a tensor as declared by the model graph.
///
/// Only the types the generation core actually consumes are represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    /// 32-bit IEEE float
    F32,
    /// 16-bit IEEE float
    F16,
    /// bfloat16
    Bf16,
    /// 64-bit signed integer (token ids, attention masks)
    I64,
}

/// Tagged element storage for a [`TensorValue`].
///
/// The tag is switched exactly once per tensor, at read time; widened `f32`
/// data is what flows into sampling.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    /// fp32 elements
    F32(Vec<f32>),
    /// fp16 elements
    F16(Vec<f16>),
    /// bf16 elements
    Bf16(Vec<bf16>),
    /// int64 elements
    I64(Vec<i64>),
}

impl TensorData {
    /// Number of elements held
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F16(v) => v.len(),
            TensorData::Bf16(v) => v.len(),
            TensorData::I64(v) => v.len(),
        }
    }

    /// Whether the storage holds zero elements
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The element type tag
    #[must_use]
    pub fn dtype(&self) -> ElementType {
        match self {
            TensorData::F32(_) => ElementType::F32,
            TensorData::F16(_) => ElementType::F16,
            TensorData::Bf16(_) => ElementType::Bf16,
            TensorData::I64(_) => ElementType::I64,
        }
    }
}

/// A dense tensor: concrete shape plus tagged element storage.
///
/// The element count must always equal the product of the shape dimensions;
/// [`TensorValue::new`] enforces this. Symbolic (`-1`) dimensions never
/// appear in a concrete value, only in declared [`IoSpec`] shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorValue {
    shape: Vec<i64>,
    data: TensorData,
}

impl TensorValue {
    /// Create a tensor from a shape and element storage.
    ///
    /// # Errors
    ///
    /// Returns [`ConversarError::InvalidArgument`] if any dimension is
    /// negative or the element count does not match the shape product.
    pub fn new(shape: Vec<i64>, data: TensorData) -> Result<Self> {
        if shape.iter().any(|&d| d < 0) {
            return Err(ConversarError::invalid_argument(format!(
                "concrete tensor shape must be non-negative, got {shape:?}"
            )));
        }
        let expected: i64 = shape.iter().product();
        if expected as usize != data.len() {
            return Err(ConversarError::invalid_argument(format!(
                "tensor data has {} elements but shape {shape:?} implies {expected}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Allocate a zero-filled tensor of the given dtype and shape.
    ///
    /// A shape with a zero dimension yields a valid zero-element tensor;
    /// this is how first-step KV placeholders are produced.
    ///
    /// # Errors
    ///
    /// Returns [`ConversarError::InvalidArgument`] on negative dimensions.
    pub fn zeros(dtype: ElementType, shape: &[i64]) -> Result<Self> {
        if shape.iter().any(|&d| d < 0) {
            return Err(ConversarError::invalid_argument(format!(
                "cannot allocate tensor with symbolic shape {shape:?}"
            )));
        }
        let n = shape.iter().product::<i64>() as usize;
        let data = match dtype {
            ElementType::F32 => TensorData::F32(vec![0.0; n]),
            ElementType::F16 => TensorData::F16(vec![f16::ZERO; n]),
            ElementType::Bf16 => TensorData::Bf16(vec![bf16::ZERO; n]),
            ElementType::I64 => TensorData::I64(vec![0; n]),
        };
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Build a `[1, len]` int64 tensor from a slice (token ids, masks).
    pub fn from_i64_row(values: &[i64]) -> Result<Self> {
        Self::new(
            vec![1, values.len() as i64],
            TensorData::I64(values.to_vec()),
        )
    }

    /// The concrete shape
    #[must_use]
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    /// The element type
    #[must_use]
    pub fn dtype(&self) -> ElementType {
        self.data.dtype()
    }

    /// Number of elements
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor holds zero elements
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrow the tagged storage
    #[must_use]
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Mutably borrow the tagged storage
    pub fn data_mut(&mut self) -> &mut TensorData {
        &mut self.data
    }

    /// Widen the element storage to `f32`, element by element.
    ///
    /// This is the single dtype switch on the read path: fp16 and bf16 are
    /// converted once here and the tag never leaks further downstream.
    ///
    /// # Errors
    ///
    /// Returns [`ConversarError::InvalidArgument`] for int64 tensors, which
    /// have no float interpretation.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match &self.data {
            TensorData::F32(v) => Ok(v.clone()),
            TensorData::F16(v) => Ok(v.iter().map(|x| x.to_f32()).collect()),
            TensorData::Bf16(v) => Ok(v.iter().map(|x| x.to_f32()).collect()),
            TensorData::I64(_) => Err(ConversarError::invalid_argument(
                "int64 tensor cannot be widened to f32",
            )),
        }
    }

    /// Borrow the int64 elements, if this is an int64 tensor.
    pub fn as_i64(&self) -> Result<&[i64]> {
        match &self.data {
            TensorData::I64(v) => Ok(v),
            other => Err(ConversarError::invalid_argument(format!(
                "expected int64 tensor, got {:?}",
                other.dtype()
            ))),
        }
    }
}

// ============================================================================
// IO metadata
// ============================================================================

/// Declared metadata for one model input or output slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoSpec {
    /// Slot name as declared by the graph
    pub name: String,
    /// Declared element type
    pub dtype: ElementType,
    /// Declared shape; symbolic dimensions are `-1`
    pub shape: Vec<i64>,
}

impl IoSpec {
    /// Create an IO spec
    #[must_use]
    pub fn new(name: impl Into<String>, dtype: ElementType, shape: Vec<i64>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
        }
    }
}

// ============================================================================
// Session traits
// ============================================================================

/// One loaded model graph, ready to run.
///
/// A session is not assumed reentrant: callers serialize their run calls.
/// Input tensors are bound by reference; output tensors are allocated by the
/// caller and handed over by value, returning filled.
pub trait RuntimeSession: Send {
    /// Declared input slots, in graph order
    fn inputs(&self) -> &[IoSpec];

    /// Declared output slots, in graph order
    fn outputs(&self) -> &[IoSpec];

    /// Bind the named inputs and outputs, run the graph, block until
    /// completion, and return the filled output tensors.
    ///
    /// # Errors
    ///
    /// Returns [`ConversarError::InvalidArgument`] for unknown slot names or
    /// shape/dtype mismatches and [`ConversarError::RuntimeFailure`] for
    /// runtime-internal errors, with the original message preserved.
    fn run(
        &mut self,
        inputs: &[(&str, &TensorValue)],
        outputs: Vec<(String, TensorValue)>,
    ) -> Result<Vec<(String, TensorValue)>>;
}

/// Factory for runtime sessions.
///
/// Implementations map a model file path plus a preference-ordered provider
/// list onto a loaded [`RuntimeSession`].
pub trait TensorRuntime {
    /// Load a model file into a session.
    ///
    /// # Errors
    ///
    /// Returns [`ConversarError::NotFound`] when the model file does not
    /// resolve, [`ConversarError::InvalidArgument`] when none of the
    /// requested providers is supported, and
    /// [`ConversarError::RuntimeFailure`] for loader-internal errors.
    fn load_session(
        &self,
        model_path: &Path,
        providers: &[ExecutionProvider],
    ) -> Result<Box<dyn RuntimeSession>>;
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation signal.
///
/// Cloned handles share one flag. The step driver checks the token before
/// tensor assembly and before dispatching the runtime call; once dispatched,
/// a step either completes or the runtime aborts it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a fresh, un-cancelled token
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation on every clone of this token
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Fail with [`ConversarError::Cancelled`] if cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ConversarError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_value_shape_validation() {
        let ok = TensorValue::new(vec![2, 3], TensorData::F32(vec![0.0; 6]));
        assert!(ok.is_ok());

        let bad = TensorValue::new(vec![2, 3], TensorData::F32(vec![0.0; 5]));
        assert!(matches!(
            bad,
            Err(ConversarError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_zeros_with_zero_dim_is_empty() {
        let t = TensorValue::zeros(ElementType::F16, &[1, 4, 0, 64]).expect("zero-seq tensor");
        assert!(t.is_empty());
        assert_eq!(t.shape(), &[1, 4, 0, 64]);
        assert_eq!(t.dtype(), ElementType::F16);
    }

    #[test]
    fn test_widening_f16_and_bf16() {
        let t = TensorValue::new(
            vec![3],
            TensorData::F16(vec![
                f16::from_f32(1.5),
                f16::from_f32(-2.0),
                f16::from_f32(0.25),
            ]),
        )
        .expect("f16 tensor");
        assert_eq!(t.to_f32_vec().expect("widen"), vec![1.5, -2.0, 0.25]);

        let t = TensorValue::new(vec![2], TensorData::Bf16(vec![bf16::from_f32(4.0), bf16::ZERO]))
            .expect("bf16 tensor");
        assert_eq!(t.to_f32_vec().expect("widen"), vec![4.0, 0.0]);
    }

    #[test]
    fn test_widening_rejects_i64() {
        let t = TensorValue::from_i64_row(&[1, 2, 3]).expect("id row");
        assert!(t.to_f32_vec().is_err());
    }

    #[test]
    fn test_cancel_token_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());

        clone.cancel();
        assert!(token.is_cancelled());
        assert_eq!(token.check(), Err(ConversarError::Cancelled));
    }
}
