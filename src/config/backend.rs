// Backend configuration - execution target and numeric precision

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

/// Where tensors live during training and generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionTarget {
    /// CUDA if compiled in and present, otherwise Metal, otherwise CPU
    #[default]
    Auto,
    Cpu,
    Cuda,
    Metal,
}

impl ExecutionTarget {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionTarget::Auto => "auto",
            ExecutionTarget::Cpu => "cpu",
            ExecutionTarget::Cuda => "cuda",
            ExecutionTarget::Metal => "metal",
        }
    }

    /// Get Candle device for this target
    pub fn device(&self) -> Result<Device> {
        match self {
            ExecutionTarget::Cpu => Ok(Device::Cpu),
            ExecutionTarget::Cuda => Device::new_cuda(0).context("Failed to initialize CUDA device"),
            ExecutionTarget::Metal => {
                Device::new_metal(0).context("Failed to initialize Metal device")
            }
            ExecutionTarget::Auto => {
                if candle_core::utils::cuda_is_available() {
                    return Device::new_cuda(0).context("Failed to initialize CUDA device");
                }
                if candle_core::utils::metal_is_available() {
                    return Device::new_metal(0).context("Failed to initialize Metal device");
                }
                Ok(Device::Cpu)
            }
        }
    }
}

/// Floating point type used for arithmetic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDType {
    F32,
    F16,
    Bf16,
}

impl ComputeDType {
    pub fn dtype(&self) -> DType {
        match self {
            ComputeDType::F32 => DType::F32,
            ComputeDType::F16 => DType::F16,
            ComputeDType::Bf16 => DType::BF16,
        }
    }
}

/// How the frozen base weights are stored.
///
/// ```toml
/// [model.precision]
/// mode = "4bit"
/// compute_dtype = "bf16"
/// ```
///
/// The 4-bit variant has no default compute dtype: a mismatched one degrades
/// numerical stability without failing, so it must be chosen explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Precision {
    /// f32 weights and arithmetic
    Full,
    /// bf16 weights and arithmetic
    Half,
    /// Q4_0 blocks, de-quantized to `compute_dtype` for every matmul
    #[serde(rename = "4bit")]
    Quantized4Bit { compute_dtype: ComputeDType },
}

impl Default for Precision {
    /// 4-bit weights with bf16 arithmetic
    fn default() -> Self {
        Precision::Quantized4Bit {
            compute_dtype: ComputeDType::Bf16,
        }
    }
}

impl Precision {
    /// Dtype activations flow through
    pub fn compute_dtype(&self) -> DType {
        match self {
            Precision::Full => DType::F32,
            Precision::Half => DType::BF16,
            Precision::Quantized4Bit { compute_dtype } => compute_dtype.dtype(),
        }
    }

    /// Dtype activations flow through on `device`.
    ///
    /// The CPU backend has no bf16 matmul, so bf16 is widened to f32 there.
    pub fn compute_dtype_on(&self, device: &Device) -> DType {
        match self.compute_dtype() {
            DType::BF16 if device.is_cpu() => DType::F32,
            dtype => dtype,
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, Precision::Quantized4Bit { .. })
    }

    pub fn name(&self) -> String {
        match self {
            Precision::Full => "full (f32)".to_string(),
            Precision::Half => "half (bf16)".to_string(),
            Precision::Quantized4Bit { compute_dtype } => {
                format!("4-bit (compute {:?})", compute_dtype.dtype())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Wrapper {
        precision: Precision,
    }

    #[test]
    fn test_precision_parses_from_toml() {
        let w: Wrapper = toml::from_str("[precision]\nmode = \"half\"\n").unwrap();
        assert_eq!(w.precision, Precision::Half);

        let w: Wrapper =
            toml::from_str("[precision]\nmode = \"4bit\"\ncompute_dtype = \"bf16\"\n").unwrap();
        assert_eq!(
            w.precision,
            Precision::Quantized4Bit {
                compute_dtype: ComputeDType::Bf16
            }
        );
        assert_eq!(w.precision.compute_dtype(), DType::BF16);
    }

    #[test]
    fn test_4bit_requires_compute_dtype() {
        let result: Result<Wrapper, _> = toml::from_str("[precision]\nmode = \"4bit\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_default_precision_is_4bit_bf16() {
        assert_eq!(
            Precision::default(),
            Precision::Quantized4Bit {
                compute_dtype: ComputeDType::Bf16
            }
        );
    }

    #[test]
    fn test_bf16_widens_on_cpu() {
        let cpu = Device::Cpu;
        assert_eq!(Precision::Half.compute_dtype_on(&cpu), DType::F32);
        assert_eq!(Precision::default().compute_dtype_on(&cpu), DType::F32);
        assert_eq!(Precision::Full.compute_dtype_on(&cpu), DType::F32);
        let f16 = Precision::Quantized4Bit {
            compute_dtype: ComputeDType::F16,
        };
        assert_eq!(f16.compute_dtype_on(&cpu), DType::F16);
    }

    #[test]
    fn test_cpu_target() {
        let device = ExecutionTarget::Cpu.device().unwrap();
        assert!(device.is_cpu());
    }
}
