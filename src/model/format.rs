//! Weight file format detection.

use std::io::Read;
use std::path::Path;

/// Container formats a model file may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFormat {
    Safetensors,
    Gguf,
    Onnx,
    /// Native AMBEE container
    Amb,
}

impl ModelFormat {
    /// Detect the format from magic bytes, falling back to the extension
    pub fn detect(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();

        let mut file = std::fs::File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut head = [0u8; 16];
        let n = read_up_to(&mut file, &mut head)?;

        if let Some(format) = Self::from_magic(&head[..n], file_len) {
            return Ok(format);
        }

        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("safetensors") => Ok(Self::Safetensors),
            Some("gguf") => Ok(Self::Gguf),
            Some("onnx") => Ok(Self::Onnx),
            Some("amb") => Ok(Self::Amb),
            _ => Err(crate::EmbeeError::UnsupportedFormat(format!(
                "cannot determine the format of {}",
                path.display()
            ))),
        }
    }

    fn from_magic(head: &[u8], file_len: u64) -> Option<Self> {
        if head.starts_with(b"GGUF") {
            return Some(Self::Gguf);
        }
        if head.starts_with(b"AMBEE") {
            return Some(Self::Amb);
        }

        // u64 LE header length, then the JSON header itself
        if let (Some(len), Some(b'{')) = (head.get(..8), head.get(8)) {
            let mut len_bytes = [0u8; 8];
            len_bytes.copy_from_slice(len);
            let header_len = u64::from_le_bytes(len_bytes);
            if header_len >= 2 && header_len.saturating_add(8) <= file_len {
                return Some(Self::Safetensors);
            }
        }

        // ModelProto: ir_version varint (field 1), then producer_name or graph
        if let [0x08, version, next, ..] = *head {
            if (1..=32).contains(&version) && matches!(next, 0x12 | 0x1a | 0x3a | 0x42) {
                return Some(Self::Onnx);
            }
        }

        None
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Safetensors => "safetensors",
            Self::Gguf => "gguf",
            Self::Onnx => "onnx",
            Self::Amb => "amb",
        }
    }
}

impl std::fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn read_up_to(file: &mut std::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
