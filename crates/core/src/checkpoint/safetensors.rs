use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use super::{Checkpoint, CheckpointFormat, TensorMeta};

/// Headers larger than this are treated as corrupt rather than allocated.
pub const MAX_HEADER_LEN: u64 = 100 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct HeaderEntry {
    dtype: String,
    shape: Vec<usize>,
    #[allow(dead_code)]
    data_offsets: [u64; 2],
}

pub fn read_safetensors(path: &Path) -> Result<Checkpoint> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let file_len = file.metadata()?.len();

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)
        .with_context(|| format!("{} is too short for a safetensors header", path.display()))?;
    let header_len = u64::from_le_bytes(len_bytes);
    if header_len > MAX_HEADER_LEN || header_len + 8 > file_len {
        bail!(
            "{}: safetensors header length {header_len} is implausible for a {file_len}-byte file",
            path.display()
        );
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)
        .with_context(|| format!("failed to read safetensors header of {}", path.display()))?;
    parse_header(&header).with_context(|| format!("invalid safetensors header in {}", path.display()))
}

fn parse_header(bytes: &[u8]) -> Result<Checkpoint> {
    let raw: BTreeMap<String, serde_json::Value> =
        serde_json::from_slice(bytes).context("header is not a JSON object")?;

    let mut tensors = BTreeMap::new();
    let mut metadata = BTreeMap::new();
    for (name, value) in raw {
        if name == "__metadata__" {
            metadata = serde_json::from_value(value).context("__metadata__ must map strings to strings")?;
            continue;
        }
        let entry: HeaderEntry = serde_json::from_value(value)
            .with_context(|| format!("tensor entry '{name}' is malformed"))?;
        tensors.insert(
            name,
            TensorMeta {
                shape: entry.shape,
                dtype: entry.dtype,
            },
        );
    }

    Ok(Checkpoint::from_parts(CheckpointFormat::Safetensors, tensors, metadata))
}
