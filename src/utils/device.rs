//! Device and data type utilities.

use candle_core::{DType as CandleDType, Device as CandleDevice};

/// Re-export candle Device for convenience
pub type Device = CandleDevice;

/// Re-export candle DType for convenience
pub type DType = CandleDType;

/// Get the best available device (CUDA > Metal > CPU)
pub fn get_device(device_id: Option<usize>) -> crate::Result<Device> {
    #[cfg(feature = "cuda")]
    {
        let id = device_id.unwrap_or(0);
        match CandleDevice::new_cuda(id) {
            Ok(device) => {
                tracing::info!("Using CUDA device {}", id);
                return Ok(device);
            }
            Err(e) => {
                tracing::warn!("CUDA not available: {}", e);
            }
        }
    }

    #[cfg(feature = "metal")]
    {
        match CandleDevice::new_metal(device_id.unwrap_or(0)) {
            Ok(device) => {
                tracing::info!("Using Metal device");
                return Ok(device);
            }
            Err(e) => {
                tracing::warn!("Metal not available: {}", e);
            }
        }
    }

    let _ = device_id;
    tracing::info!("Using CPU device");
    Ok(CandleDevice::Cpu)
}

/// Half precision on accelerators, F32 on the CPU
pub fn default_dtype(device: &Device) -> DType {
    if device.is_cpu() {
        CandleDType::F32
    } else {
        CandleDType::F16
    }
}

/// Parse dtype string to candle DType
pub fn parse_dtype(dtype_str: &str) -> crate::Result<DType> {
    match dtype_str.to_lowercase().as_str() {
        "f32" | "float32" | "float" => Ok(CandleDType::F32),
        "f16" | "float16" | "half" => Ok(CandleDType::F16),
        "bf16" | "bfloat16" => Ok(CandleDType::BF16),
        other => Err(crate::EmbeeError::InvalidConfig(format!(
            "unknown dtype '{other}' (expected f32, f16 or bf16)"
        ))),
    }
}
