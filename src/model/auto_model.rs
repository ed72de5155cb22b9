//! Auto model detection and loading.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device};

use super::base::ForwardPass;
use super::format::ModelFormat;
use super::loader::weight_files;
use super::transformer::TransformerModel;
use crate::config::{ModelArchitecture, ModelConfig};
use crate::utils::{default_dtype, get_device};

/// Automatic model loader that detects the weight format and architecture.
pub struct AutoModel;

impl AutoModel {
    /// Load a model from a weight file or a directory of shards.
    ///
    /// `config.json` must sit beside the weights. `device` defaults to the
    /// best available accelerator, `dtype` to F16 there and F32 on the CPU.
    pub fn from_path(
        path: impl AsRef<Path>,
        device: Option<Device>,
        dtype: Option<DType>,
    ) -> crate::Result<Box<dyn ForwardPass>> {
        let path = path.as_ref();
        let device = match device {
            Some(device) => device,
            None => get_device(None)?,
        };
        let dtype = dtype.unwrap_or_else(|| default_dtype(&device));

        let (format, config, files) = Self::inspect(path)?;
        tracing::info!("Detected {} weights, architecture {:?}", format, config.architecture());

        match format {
            ModelFormat::Safetensors => {}
            other => {
                return Err(crate::EmbeeError::UnsupportedFormat(format!(
                    "{other} weights cannot be loaded; convert the model to safetensors"
                )))
            }
        }

        match config.architecture() {
            ModelArchitecture::Llama | ModelArchitecture::Mistral => {}
            ModelArchitecture::Unknown(arch) => {
                tracing::warn!("Unknown architecture '{}', attempting to load as Llama", arch);
            }
            architecture => {
                tracing::warn!(
                    "Architecture {:?} not yet supported, attempting Llama fallback",
                    architecture
                );
            }
        }

        let model = TransformerModel::from_safetensors(config, &files, device, dtype)?;
        Ok(Box::new(model))
    }

    /// Weight format, validated config and weight files for a model path
    pub fn inspect(
        path: impl AsRef<Path>,
    ) -> crate::Result<(ModelFormat, ModelConfig, Vec<PathBuf>)> {
        let path = path.as_ref();
        let files = weight_files(path)?;
        let format = files
            .first()
            .map(ModelFormat::detect)
            .transpose()?
            .ok_or_else(|| crate::EmbeeError::ModelLoad("no weight files".to_string()))?;

        let config = ModelConfig::from_file(Self::model_dir(path).join("config.json"))?;
        Ok((format, config, files))
    }

    /// Get detected architecture for a model
    pub fn detect_architecture(path: impl AsRef<Path>) -> crate::Result<ModelArchitecture> {
        let config = ModelConfig::from_file(Self::model_dir(path.as_ref()).join("config.json"))?;
        Ok(config.architecture())
    }

    fn model_dir(path: &Path) -> &Path {
        if path.is_dir() {
            path
        } else {
            path.parent().unwrap_or_else(|| Path::new("."))
        }
    }
}
