//! Checkpoint tensor signatures (name -> shape/dtype) plus metadata.
//!
//! Only headers and initializer descriptions are read; weight bytes are never
//! materialised, so detection stays cheap even for multi-gigabyte files.

mod onnx;
mod safetensors;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use tracing::debug;

use crate::error::UpscaleError;

pub use onnx::{read_onnx, OnnxSummary};
pub use safetensors::{read_safetensors, MAX_HEADER_LEN};

#[cfg(test)]
pub(crate) use safetensors::tests::write_safetensors;

/// Container namespaces in unwrap priority order.
pub const CONTAINER_KEYS: [&str; 3] = ["params_ema", "params", "state_dict"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointFormat {
    Safetensors,
    Onnx,
    InMemory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorMeta {
    pub shape: Vec<usize>,
    pub dtype: String,
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub format: CheckpointFormat,
    tensors: BTreeMap<String, TensorMeta>,
    metadata: BTreeMap<String, String>,
}

impl Checkpoint {
    pub fn load(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let mut checkpoint = match ext.as_str() {
            "safetensors" => read_safetensors(path)?,
            "onnx" => read_onnx(path)?.checkpoint,
            "pth" | "pt" | "ckpt" | "bin" => {
                return Err(UpscaleError::UnsupportedCheckpoint {
                    path: path.to_path_buf(),
                    hint: "pickled PyTorch weights are not read; convert to .safetensors \
                           (safetensors.torch.save_file) or export to .onnx"
                        .to_string(),
                }
                .into())
            }
            other => {
                return Err(UpscaleError::UnsupportedCheckpoint {
                    path: path.to_path_buf(),
                    hint: format!("unknown extension '{other}', expected .safetensors or .onnx"),
                }
                .into())
            }
        };

        checkpoint.unwrap_container();
        checkpoint.strip_module_prefix();
        debug!(
            path = %path.display(),
            tensors = checkpoint.len(),
            metadata_keys = checkpoint.metadata.len(),
            "Loaded checkpoint signature"
        );
        Ok(checkpoint)
    }

    pub fn from_shapes<I, K>(shapes: I, metadata: BTreeMap<String, String>) -> Self
    where
        I: IntoIterator<Item = (K, Vec<usize>)>,
        K: Into<String>,
    {
        let tensors = shapes
            .into_iter()
            .map(|(name, shape)| {
                (
                    name.into(),
                    TensorMeta {
                        shape,
                        dtype: "F32".to_string(),
                    },
                )
            })
            .collect();
        Self {
            format: CheckpointFormat::InMemory,
            tensors,
            metadata,
        }
    }

    pub(crate) fn from_parts(
        format: CheckpointFormat,
        tensors: BTreeMap<String, TensorMeta>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            format,
            tensors,
            metadata,
        }
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.tensors.get(name).map(|t| t.shape.as_slice())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn tensors(&self) -> &BTreeMap<String, TensorMeta> {
        &self.tensors
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Keep only the highest-priority container namespace, if any is present.
    pub fn unwrap_container(&mut self) {
        let Some(container) = CONTAINER_KEYS.iter().find(|key| {
            let prefix = format!("{key}.");
            self.tensors.keys().any(|name| name.starts_with(&prefix))
        }) else {
            return;
        };

        let prefix = format!("{container}.");
        let tensors = std::mem::take(&mut self.tensors);
        self.tensors = tensors
            .into_iter()
            .filter_map(|(name, meta)| name.strip_prefix(&prefix).map(|n| (n.to_string(), meta)))
            .collect();
        debug!(container, "Unwrapped checkpoint container");
    }

    pub fn strip_module_prefix(&mut self) {
        if !self.tensors.keys().any(|k| k.starts_with("module.")) {
            return;
        }
        let tensors = std::mem::take(&mut self.tensors);
        self.tensors = tensors
            .into_iter()
            .map(|(name, meta)| {
                let mut stripped = name.as_str();
                while let Some(rest) = stripped.strip_prefix("module.") {
                    stripped = rest;
                }
                (stripped.to_string(), meta)
            })
            .collect();
    }

    /// `arch_name` + `arch_params` when both are present and parse.
    pub fn explicit_architecture(&self) -> Option<(String, BTreeMap<String, i64>)> {
        let name = self.metadata.get("arch_name")?.trim();
        if name.is_empty() {
            return None;
        }
        let raw = self.metadata.get("arch_params")?;
        let params: BTreeMap<String, serde_json::Value> = serde_json::from_str(raw).ok()?;
        let params = params
            .into_iter()
            .filter_map(|(k, v)| match v {
                serde_json::Value::Bool(b) => Some((k, i64::from(b))),
                other => other.as_i64().map(|n| (k, n)),
            })
            .collect();
        Some((name.to_string(), params))
    }
}
