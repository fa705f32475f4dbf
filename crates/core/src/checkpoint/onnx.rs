//! Minimal ONNX protobuf schema: just enough of `ModelProto` to list graph
//! initializers, IO element types and `metadata_props`. Unknown fields
//! (node list, raw tensor bytes) are skipped by the decoder.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use prost::Message;

use super::{Checkpoint, CheckpointFormat, TensorMeta};

#[derive(Clone, PartialEq, Message)]
pub struct ModelProto {
    #[prost(int64, tag = "1")]
    pub ir_version: i64,
    #[prost(string, tag = "2")]
    pub producer_name: String,
    #[prost(message, optional, tag = "7")]
    pub graph: Option<GraphProto>,
    #[prost(message, repeated, tag = "14")]
    pub metadata_props: Vec<StringStringEntryProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GraphProto {
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, repeated, tag = "5")]
    pub initializer: Vec<TensorProto>,
    #[prost(message, repeated, tag = "11")]
    pub input: Vec<ValueInfoProto>,
    #[prost(message, repeated, tag = "12")]
    pub output: Vec<ValueInfoProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorProto {
    #[prost(int64, repeated, tag = "1")]
    pub dims: Vec<i64>,
    #[prost(int32, tag = "2")]
    pub data_type: i32,
    #[prost(string, tag = "8")]
    pub name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ValueInfoProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub r#type: Option<TypeProto>,
}

/// `TypeProto.value` is a oneof; only its `tensor_type` arm (tag 1) matters here.
#[derive(Clone, PartialEq, Message)]
pub struct TypeProto {
    #[prost(message, optional, tag = "1")]
    pub tensor_type: Option<TensorTypeProto>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TensorTypeProto {
    #[prost(int32, tag = "1")]
    pub elem_type: i32,
}

#[derive(Clone, PartialEq, Message)]
pub struct StringStringEntryProto {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

const ELEM_FLOAT: i32 = 1;
const ELEM_FLOAT16: i32 = 10;

fn data_type_name(dt: i32) -> String {
    match dt {
        ELEM_FLOAT => "F32".into(),
        2 => "U8".into(),
        7 => "I64".into(),
        ELEM_FLOAT16 => "F16".into(),
        11 => "F64".into(),
        16 => "BF16".into(),
        _ => format!("onnx({dt})"),
    }
}

#[derive(Debug, Clone)]
pub struct OnnxSummary {
    pub checkpoint: Checkpoint,
    pub input_name: Option<String>,
    pub input_is_fp16: bool,
}

pub fn read_onnx(path: &Path) -> Result<OnnxSummary> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read ONNX file: {}", path.display()))?;
    summarize_onnx_bytes(&bytes).with_context(|| format!("invalid ONNX model: {}", path.display()))
}

pub fn summarize_onnx_bytes(bytes: &[u8]) -> Result<OnnxSummary> {
    let model = ModelProto::decode(bytes).context("failed to decode ONNX protobuf")?;

    let metadata: BTreeMap<String, String> = model
        .metadata_props
        .into_iter()
        .map(|entry| (entry.key, entry.value))
        .collect();

    let graph = model.graph.unwrap_or_default();
    let tensors: BTreeMap<String, TensorMeta> = graph
        .initializer
        .iter()
        .map(|t| {
            (
                t.name.clone(),
                TensorMeta {
                    shape: t.dims.iter().map(|&d| d.max(0) as usize).collect(),
                    dtype: data_type_name(t.data_type),
                },
            )
        })
        .collect();

    // Initializers may also be listed as graph inputs in older exports.
    let first_input = graph.input.iter().find(|vi| !tensors.contains_key(&vi.name));
    let input_is_fp16 = first_input
        .and_then(|vi| vi.r#type.as_ref())
        .and_then(|t| t.tensor_type.as_ref())
        .map(|t| t.elem_type == ELEM_FLOAT16)
        .unwrap_or(false);

    Ok(OnnxSummary {
        input_name: first_input.map(|vi| vi.name.clone()),
        input_is_fp16,
        checkpoint: Checkpoint::from_parts(CheckpointFormat::Onnx, tensors, metadata),
    })
}
