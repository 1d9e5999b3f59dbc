#![warn(clippy::cast_lossless)]
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Error, Result};
use tracing::warn;

pub mod api;
pub mod backend;
pub mod config;
pub mod openai;
pub mod state;

pub fn new_device(ordinal: usize, cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Device::new_cuda(ordinal)
    } else if metal_is_available() {
        Device::new_metal(ordinal)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            warn!("Running on CPU, to run on GPU(metal), build this example with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            warn!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

/// Parse a dtype name. Without one, half precision is used on accelerators
/// and f32 on the CPU.
pub fn get_dtype(dtype: Option<String>, device: &Device) -> Result<DType> {
    match dtype.as_deref() {
        Some("f16") => Ok(DType::F16),
        Some("bf16") => Ok(DType::BF16),
        Some("f32") => Ok(DType::F32),
        Some(dtype) => Err(Error::msg(format!("Unsupported dtype {dtype}"))),
        None if device.is_cpu() => Ok(DType::F32),
        None => Ok(DType::BF16),
    }
}
