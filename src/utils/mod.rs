//! Utility modules for device selection and memory accounting.

mod device;
mod memory;

pub use device::{default_dtype, get_device, parse_dtype, Device, DType};
pub use memory::{format_bytes, kv_cache_bytes, weight_bytes};
