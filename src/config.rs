//! Runtime configuration for the denoise step.
//!
//! Contains execution device and numeric precision selection, the
//! [`ExecutionContext`] chooser, and path configuration for persisted tensors.

use half::{bf16, f16};
use ndarray::{Array, Dimension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{DenoiseError, ErrorCode, Result};

/// Execution device for transformer inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// Pick the best available device. Resolves to CPU for the ndarray backend.
    #[default]
    Auto,

    /// Force CPU execution.
    Cpu,

    /// NVIDIA GPU.
    Cuda,

    /// Apple Silicon GPU.
    Metal,
}

impl Device {
    /// Returns the string representation of the device.
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Auto => "auto",
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Metal => "metal",
        }
    }

    /// Parses a device from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Device::Auto),
            "cpu" => Some(Device::Cpu),
            "cuda" => Some(Device::Cuda),
            "metal" | "mps" => Some(Device::Metal),
            _ => None,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Numeric precision of the working tensors.
///
/// Tensors are always stored as `f32`; a reduced precision is emulated by
/// rounding every value through the narrower format, which reproduces the
/// values a native fp16/bf16 run would hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// Choose from the device: F32 on CPU, F16 on accelerators.
    #[default]
    Auto,
    F32,
    F16,
    Bf16,
}

impl Precision {
    /// Returns the string representation of the precision.
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Auto => "auto",
            Precision::F32 => "f32",
            Precision::F16 => "f16",
            Precision::Bf16 => "bf16",
        }
    }

    /// Parses a precision from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Some(Precision::Auto),
            "f32" | "float32" | "fp32" => Some(Precision::F32),
            "f16" | "float16" | "fp16" => Some(Precision::F16),
            "bf16" | "bfloat16" => Some(Precision::Bf16),
            _ => None,
        }
    }

    /// Rounds a single value to this precision.
    pub fn round(&self, v: f32) -> f32 {
        match self {
            Precision::Auto | Precision::F32 => v,
            Precision::F16 => f16::from_f32(v).to_f32(),
            Precision::Bf16 => bf16::from_f32(v).to_f32(),
        }
    }

    /// Returns a copy of `tensor` rounded to this precision.
    pub fn cast<D: Dimension>(&self, tensor: &Array<f32, D>) -> Array<f32, D> {
        match self {
            Precision::Auto | Precision::F32 => tensor.clone(),
            _ => tensor.mapv(|v| self.round(v)),
        }
    }

    /// Rounds `tensor` to this precision in place.
    pub fn cast_in_place<D: Dimension>(&self, tensor: &mut Array<f32, D>) {
        if matches!(self, Precision::F16 | Precision::Bf16) {
            tensor.mapv_inplace(|v| self.round(v));
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Resolved device and precision for a whole run.
///
/// Passed explicitly to every stage that allocates or casts tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    pub device: Device,
    pub precision: Precision,
}

impl ExecutionContext {
    /// Creates a context from concrete values, resolving `Auto` entries.
    pub fn new(device: Device, precision: Precision) -> Self {
        let device = match device {
            Device::Auto => Device::Cpu,
            other => other,
        };
        let precision = match precision {
            Precision::Auto => match device {
                Device::Cuda | Device::Metal => Precision::F16,
                _ => Precision::F32,
            },
            other => other,
        };
        Self { device, precision }
    }

    /// Chooses the device and precision from configuration.
    pub fn choose(config: &DenoiseConfig) -> Self {
        Self::new(config.device, config.precision)
    }

    /// CPU with full precision.
    pub fn cpu() -> Self {
        Self::new(Device::Cpu, Precision::F32)
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::cpu()
    }
}

/// Runtime configuration for the denoise step.
///
/// Loaded from environment variables or a JSON file at startup.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DenoiseConfig {
    /// Execution device for inference.
    pub device: Device,

    /// Working precision for latents and model outputs.
    pub precision: Precision,

    /// Directory holding persisted tensors.
    /// If None, uses the platform-specific default cache location.
    pub tensor_path: Option<PathBuf>,
}

impl DenoiseConfig {
    /// Creates a new DenoiseConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a DenoiseConfig from environment variables.
    ///
    /// Reads the following environment variables:
    /// - `COGVIEW_DEVICE` - Device selection (auto, cpu, cuda, metal)
    /// - `COGVIEW_PRECISION` - Precision (auto, f32, f16, bf16)
    /// - `COGVIEW_TENSOR_PATH` - Directory for persisted tensors
    ///
    /// Falls back to defaults for unset or unparseable variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(device_str) = std::env::var("COGVIEW_DEVICE") {
            if let Some(device) = Device::parse(&device_str) {
                config.device = device;
            }
        }

        if let Ok(precision_str) = std::env::var("COGVIEW_PRECISION") {
            if let Some(precision) = Precision::parse(&precision_str) {
                config.precision = precision;
            }
        }

        if let Ok(path) = std::env::var("COGVIEW_TENSOR_PATH") {
            config.tensor_path = Some(PathBuf::from(path));
        }

        config
    }

    /// Loads configuration from a JSON file. Missing keys take defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DenoiseError::with_source(
                ErrorCode::InvalidParameter,
                format!("Cannot read config file {}", path.display()),
                e,
            )
        })?;
        serde_json::from_str(&text).map_err(|e| {
            DenoiseError::with_source(
                ErrorCode::InvalidParameter,
                format!("Malformed config file {}", path.display()),
                e,
            )
        })
    }

    /// Returns the effective tensor path, using platform defaults if not specified.
    pub fn effective_tensor_path(&self) -> PathBuf {
        if let Some(ref path) = self.tensor_path {
            path.clone()
        } else {
            default_tensor_path()
        }
    }

    /// Validates the configuration.
    ///
    /// Returns an error message if validation fails, None otherwise.
    pub fn validate(&self) -> Option<String> {
        if let Some(ref path) = self.tensor_path {
            if path.as_os_str().is_empty() {
                return Some("tensor_path must not be empty".to_string());
            }
        }

        // bf16 has no Metal kernels for most transformer ops
        if self.device == Device::Metal && self.precision == Precision::Bf16 {
            return Some("bf16 is not supported on metal".to_string());
        }

        None
    }
}

/// Returns the platform-specific default tensor storage path.
///
/// - macOS: ~/Library/Caches/cogview4-denoise/tensors
/// - Linux: ~/.cache/cogview4-denoise/tensors
/// - Windows: C:\Users\<user>\AppData\Local\cogview4-denoise\cache\tensors
fn default_tensor_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "cogview4-denoise") {
        proj_dirs.cache_dir().join("tensors")
    } else {
        PathBuf::from("./tensors")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    #[test]
    fn device_parsing() {
        assert_eq!(Device::parse("auto"), Some(Device::Auto));
        assert_eq!(Device::parse("CPU"), Some(Device::Cpu));
        assert_eq!(Device::parse("cuda"), Some(Device::Cuda));
        assert_eq!(Device::parse("mps"), Some(Device::Metal));
        assert_eq!(Device::parse("invalid"), None);
    }

    #[test]
    fn precision_parsing() {
        assert_eq!(Precision::parse("fp16"), Some(Precision::F16));
        assert_eq!(Precision::parse("bfloat16"), Some(Precision::Bf16));
        assert_eq!(Precision::parse("F32"), Some(Precision::F32));
        assert_eq!(Precision::parse("f64"), None);
    }

    #[test]
    fn context_resolves_auto() {
        let cpu = ExecutionContext::new(Device::Auto, Precision::Auto);
        assert_eq!(cpu.device, Device::Cpu);
        assert_eq!(cpu.precision, Precision::F32);

        let cuda = ExecutionContext::new(Device::Cuda, Precision::Auto);
        assert_eq!(cuda.precision, Precision::F16);

        let explicit = ExecutionContext::new(Device::Cuda, Precision::Bf16);
        assert_eq!(explicit.precision, Precision::Bf16);
    }

    #[test]
    fn f16_rounding_is_lossy() {
        let x = Array1::from(vec![0.1_f32, 1.0, 65504.0]);
        let y = Precision::F16.cast(&x);
        assert_ne!(y[0], 0.1);
        assert_eq!(y[1], 1.0);
        assert_eq!(y[2], 65504.0);
        assert_eq!(Precision::F32.cast(&x), x);
    }

    #[test]
    fn cast_in_place_matches_cast() {
        let x = Array1::from(vec![0.1_f32, -2.7, 3.3333]);
        let mut y = x.clone();
        Precision::Bf16.cast_in_place(&mut y);
        assert_eq!(y, Precision::Bf16.cast(&x));
    }

    #[test]
    fn config_validation() {
        let mut config = DenoiseConfig::new();
        assert!(config.validate().is_none());

        config.device = Device::Metal;
        config.precision = Precision::Bf16;
        assert!(config.validate().is_some());
    }

    #[test]
    fn config_from_json_defaults_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"precision": "bf16"}"#).unwrap();

        let config = DenoiseConfig::from_json_file(&path).unwrap();
        assert_eq!(config.precision, Precision::Bf16);
        assert_eq!(config.device, Device::Auto);
        assert!(config.tensor_path.is_none());
    }

    #[test]
    fn effective_tensor_path_not_empty() {
        let config = DenoiseConfig::new();
        assert!(!config.effective_tensor_path().as_os_str().is_empty());
    }
}
