//! Memory-mapped safetensors weight loading.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;

/// Loads safetensors files onto a device in the requested dtype.
pub struct WeightLoader {
    /// Device to load tensors to
    device: Device,
    /// Data type for floating point tensors
    dtype: DType,
}

impl WeightLoader {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    /// Load every tensor of every file, keyed by tensor name
    pub fn load_all(&self, files: &[PathBuf]) -> crate::Result<HashMap<String, Tensor>> {
        let mut tensors = HashMap::new();
        for file in files {
            for (name, tensor) in self.load_file(file)? {
                if tensors.insert(name.clone(), tensor).is_some() {
                    return Err(crate::EmbeeError::ModelLoad(format!(
                        "tensor {name} appears in more than one shard"
                    )));
                }
            }
        }

        tracing::info!("Loaded {} tensors from {} file(s)", tensors.len(), files.len());
        Ok(tensors)
    }

    /// Load one safetensors file
    pub fn load_file(&self, path: impl AsRef<Path>) -> crate::Result<HashMap<String, Tensor>> {
        let path = path.as_ref();
        tracing::debug!("Loading weight file: {:?}", path);

        // Memory-map the file
        let file = std::fs::File::open(path)?;
        // SAFETY: the mapping is read-only and dropped before this function returns;
        // every tensor is copied out of it.
        let mmap = unsafe { memmap2::Mmap::map(&file)? };

        let safetensors = SafeTensors::deserialize(&mmap).map_err(|e| {
            crate::EmbeeError::ModelLoad(format!("{}: {}", path.display(), e))
        })?;

        let mut tensors = HashMap::new();
        for (tensor_name, tensor_view) in safetensors.tensors() {
            let tensor = self.load_tensor(&tensor_name, &tensor_view)?;
            tensors.insert(tensor_name, tensor);
        }

        Ok(tensors)
    }

    fn load_tensor(
        &self,
        name: &str,
        view: &safetensors::tensor::TensorView<'_>,
    ) -> crate::Result<Tensor> {
        let dtype = convert_safetensor_dtype(view.dtype()).ok_or_else(|| {
            crate::EmbeeError::ModelLoad(format!(
                "tensor {name} has unsupported dtype {:?}",
                view.dtype()
            ))
        })?;

        let tensor = Tensor::from_raw_buffer(view.data(), dtype, view.shape(), &Device::Cpu)?;

        // Only floating point weights follow the requested dtype
        let tensor = if dtype.is_float() {
            tensor.to_dtype(self.dtype)?
        } else {
            tensor
        };

        Ok(tensor.to_device(&self.device)?)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }
}

/// Weight files for a model path: the file itself, or the sorted weight
/// files of a directory
pub fn weight_files(path: impl AsRef<Path>) -> crate::Result<Vec<PathBuf>> {
    let path = path.as_ref();
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|file| {
            file.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| matches!(ext, "safetensors" | "gguf" | "onnx" | "amb"))
        })
        .collect();
    files.sort();

    if files.is_empty() {
        return Err(crate::EmbeeError::ModelLoad(format!(
            "no weight files found in {}",
            path.display()
        )));
    }
    Ok(files)
}

/// Convert safetensor dtype to candle dtype
fn convert_safetensor_dtype(dtype: safetensors::Dtype) -> Option<DType> {
    match dtype {
        safetensors::Dtype::F16 => Some(DType::F16),
        safetensors::Dtype::BF16 => Some(DType::BF16),
        safetensors::Dtype::F32 => Some(DType::F32),
        safetensors::Dtype::F64 => Some(DType::F64),
        safetensors::Dtype::I64 => Some(DType::I64),
        safetensors::Dtype::U8 => Some(DType::U8),
        safetensors::Dtype::U32 => Some(DType::U32),
        _ => None,
    }
}
