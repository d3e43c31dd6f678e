//! Error types for the denoise step.
//!
//! Errors fall into three groups: configuration problems detected before the
//! loop starts, resource problems with upstream collaborators, and numeric or
//! device failures raised while stepping.

use std::fmt;

/// Error codes identifying the failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A denoise parameter is malformed or inconsistent.
    /// Trigger: zero steps, bad cfg_scale length, denoising_start without latents.
    InvalidParameter,

    /// No transformer is registered under the requested identifier.
    ModelNotFound,

    /// The transformer could not be placed on the compute device.
    /// Trigger: poisoned model lock, device load failure.
    ModelLoadFailed,

    /// A conditioning record has the wrong arity or variant.
    ConditioningMismatch,

    /// No tensor is stored under the requested name.
    TensorNotFound,

    /// Reading or writing a persisted tensor failed.
    TensorIo,

    /// Two tensors that must agree in shape do not.
    /// Trigger: embedding batch vs latent batch, model output vs input.
    ShapeMismatch,

    /// The transformer forward pass failed.
    /// Trigger: out-of-memory, device mismatch.
    ModelInferenceFailed,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParameter => "INVALID_PARAMETER",
            ErrorCode::ModelNotFound => "MODEL_NOT_FOUND",
            ErrorCode::ModelLoadFailed => "MODEL_LOAD_FAILED",
            ErrorCode::ConditioningMismatch => "CONDITIONING_MISMATCH",
            ErrorCode::TensorNotFound => "TENSOR_NOT_FOUND",
            ErrorCode::TensorIo => "TENSOR_IO",
            ErrorCode::ShapeMismatch => "SHAPE_MISMATCH",
            ErrorCode::ModelInferenceFailed => "MODEL_INFERENCE_FAILED",
        }
    }

    /// Returns a human-readable description of the error.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParameter => "A denoise parameter is malformed or inconsistent",
            ErrorCode::ModelNotFound => "Requested transformer is not registered",
            ErrorCode::ModelLoadFailed => "Failed to place the transformer on the compute device",
            ErrorCode::ConditioningMismatch => "Conditioning record has the wrong arity or variant",
            ErrorCode::TensorNotFound => "Requested tensor is not in the tensor store",
            ErrorCode::TensorIo => "Failed to read or write a persisted tensor",
            ErrorCode::ShapeMismatch => "Tensor shapes are incompatible",
            ErrorCode::ModelInferenceFailed => "Transformer forward pass failed",
        }
    }

    /// Returns a recovery hint suggesting how to resolve this error.
    pub fn recovery_hint(&self) -> &'static str {
        match self {
            ErrorCode::InvalidParameter => {
                "Check the named field: steps must be > 0, width/height multiples of 16, \
                 cfg_scale lists must have one entry per step"
            }
            ErrorCode::ModelNotFound => {
                "Register the transformer with the model registry before invoking the denoise step"
            }
            ErrorCode::ModelLoadFailed => {
                "Free device memory or choose another device with COGVIEW_DEVICE"
            }
            ErrorCode::ConditioningMismatch => {
                "Re-run the text encoder stage; it must store exactly one GLM conditioning record"
            }
            ErrorCode::TensorNotFound => {
                "Make sure the upstream stage saved the tensor to the same tensor store"
            }
            ErrorCode::TensorIo => {
                "Verify the tensor directory exists, is writable and has free disk space"
            }
            ErrorCode::ShapeMismatch => {
                "Ensure latents, masks and conditioning come from the same image size and batch"
            }
            ErrorCode::ModelInferenceFailed => {
                "Reduce image size or switch precision; the loop does not retry on its own"
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for denoise operations.
#[derive(Debug)]
pub struct DenoiseError {
    /// The error code identifying the type of error.
    pub code: ErrorCode,
    /// Human-readable error message with context.
    pub message: String,
    /// Offending parameter, for configuration errors.
    pub field: Option<&'static str>,
    /// Optional underlying cause of the error.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl DenoiseError {
    /// Creates a new DenoiseError with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            source: None,
        }
    }

    /// Creates a new DenoiseError with an underlying cause.
    pub fn with_source(
        code: ErrorCode,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            field: None,
            source: Some(Box::new(source)),
        }
    }

    /// Creates an INVALID_PARAMETER error naming the offending field.
    pub fn invalid_param(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidParameter,
            message: format!("Invalid {}: {}", field, reason.into()),
            field: Some(field),
            source: None,
        }
    }

    /// Creates a MODEL_NOT_FOUND error.
    pub fn model_not_found(id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::ModelNotFound,
            format!("No model registered for {}", id),
        )
    }

    /// Creates a MODEL_LOAD_FAILED error.
    pub fn model_load_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ModelLoadFailed,
            format!("Failed to load model: {}", reason.into()),
        )
    }

    /// Creates a CONDITIONING_MISMATCH error.
    pub fn conditioning_mismatch(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ConditioningMismatch,
            format!("Conditioning mismatch: {}", reason.into()),
        )
    }

    /// Creates a TENSOR_NOT_FOUND error.
    pub fn tensor_not_found(name: &str) -> Self {
        Self::new(
            ErrorCode::TensorNotFound,
            format!("Tensor not found: {}", name),
        )
    }

    /// Creates a TENSOR_IO error wrapping an I/O failure.
    pub fn tensor_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::with_source(ErrorCode::TensorIo, context, source)
    }

    /// Creates a SHAPE_MISMATCH error.
    pub fn shape_mismatch(what: &str, expected: &[usize], actual: &[usize]) -> Self {
        Self::new(
            ErrorCode::ShapeMismatch,
            format!("{}: expected shape {:?}, got {:?}", what, expected, actual),
        )
    }

    /// Creates a MODEL_INFERENCE_FAILED error.
    pub fn model_inference_failed(reason: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::ModelInferenceFailed,
            format!("Inference failed: {}", reason.into()),
        )
    }
}

impl fmt::Display for DenoiseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}. Recovery: {}",
            self.code,
            self.message,
            self.code.recovery_hint()
        )
    }
}

impl std::error::Error for DenoiseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<ndarray::ShapeError> for DenoiseError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::with_source(ErrorCode::ShapeMismatch, "Incompatible tensor shapes", err)
    }
}

/// Result type alias using DenoiseError.
pub type Result<T> = std::result::Result<T, DenoiseError>;
