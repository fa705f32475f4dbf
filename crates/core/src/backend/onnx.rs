//! ONNX Runtime backend: CUDA or TensorRT execution provider, CPU fallback.
//!
//! FP32 and FP16 graphs are both accepted; the pixel value range comes from
//! the catalog entry, else FP16 graphs are assumed to work in 0–1 and FP32
//! graphs in 0–255.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{s, Array4, ArrayD};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use tracing::{debug, info, warn};

use super::{query_gpu_memory, Backend, BackendOptions, MemoryInfo};
use crate::arch::ArchitectureDetector;
use crate::error::UpscaleError;
use crate::model_store::{ModelFormat, ModelStore, ValueRange};
use crate::runtime::ort_library_path;
use crate::types::RgbImage;

/// Spatial dimensions are padded to a multiple of this before inference.
const PAD_ALIGN: usize = 4;
const PROBE_EDGE: usize = 16;
const CPU_MEMORY_MB: u64 = 4000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutionTarget {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl ExecutionTarget {
    /// Parse from string (case-insensitive). Returns `Cuda` for unknown values.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "tensorrt" | "trt" => Self::Tensorrt,
            "cpu" => Self::Cpu,
            _ => Self::Cuda,
        }
    }
}

impl std::fmt::Display for ExecutionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

/// Build a session for `model_path`. TensorRT registers CUDA as its fallback;
/// ort itself falls back to CPU when no provider registers.
pub fn build_session(
    model_path: &Path,
    target: ExecutionTarget,
    trt_cache_dir: Option<&Path>,
    fp16: bool,
) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let session = match target {
        ExecutionTarget::Tensorrt => {
            let cache_dir = trt_cache_dir.unwrap_or_else(|| Path::new("trt_cache"));
            if let Err(e) = std::fs::create_dir_all(cache_dir) {
                warn!(dir = %cache_dir.display(), error = %e, "Failed to create TRT cache directory");
            }
            info!(
                cache_dir = %cache_dir.display(),
                "Initializing TensorRT session (first run may take several minutes)"
            );
            let cache_path = cache_dir.to_string_lossy().to_string();
            builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(&cache_path)
                        .with_fp16(fp16)
                        .with_device_id(0)
                        .build(),
                    CUDAExecutionProvider::default().build(),
                ])?
                .commit_from_file(model_path)
        }
        ExecutionTarget::Cuda => {
            if !CUDAExecutionProvider::default().is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }
            builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])?
                .commit_from_file(model_path)
        }
        ExecutionTarget::Cpu => builder.commit_from_file(model_path),
    }
    .with_context(|| format!("Failed to load ONNX model: {}", model_path.display()))?;

    Ok(session)
}

pub struct OnnxBackend {
    options: BackendOptions,
    session: Option<Session>,
    input_name: String,
    output_name: String,
    is_fp16: bool,
    value_range: ValueRange,
    scale: u32,
    gpu: Option<MemoryInfo>,
}

impl OnnxBackend {
    pub fn new(options: BackendOptions) -> Self {
        let scale = options.scale;
        Self {
            options,
            session: None,
            input_name: String::new(),
            output_name: String::new(),
            is_fp16: false,
            value_range: ValueRange::Byte,
            scale,
            gpu: None,
        }
    }

    /// True when an ONNX Runtime shared library can be located.
    pub fn is_available() -> bool {
        ort_library_path().is_some()
    }

    /// Model file plus the catalog's value range when the model came from there.
    fn resolve_model(&self) -> Result<(PathBuf, Option<ValueRange>)> {
        let model = self.options.model.as_str();
        let as_path = Path::new(model);
        if as_path.is_file() {
            if as_path.extension().and_then(|e| e.to_str()) != Some("onnx") {
                bail!("the onnx backend needs an .onnx model, got {}", as_path.display());
            }
            return Ok((as_path.to_path_buf(), None));
        }

        let store = ModelStore::new(self.options.models_dir.clone());
        let entry = store
            .get(model)
            .with_context(|| format!("Unknown model: {model}"))?;
        if entry.format != ModelFormat::Onnx {
            bail!(
                "model {model} is a {:?} checkpoint; the onnx backend needs an ONNX export",
                entry.format
            );
        }
        let range = entry.value_range;
        Ok((store.get_model_path(model)?, Some(range)))
    }

    fn detect_scale(&mut self, model_path: &Path) -> Result<u32> {
        match ArchitectureDetector::new().detect(model_path) {
            Ok((descriptor, _)) if descriptor.is_trusted() => return Ok(descriptor.scale() as u32),
            Ok((descriptor, _)) => debug!(
                confidence = descriptor.confidence,
                "Architecture detection not trusted, probing scale"
            ),
            Err(e) => debug!("Architecture detection failed, probing scale: {e:#}"),
        }

        let probe = RgbImage::zeros(PROBE_EDGE, PROBE_EDGE);
        let output = self.upscale(&probe)?;
        if output.width % PROBE_EDGE != 0 || output.width != output.height {
            bail!(
                "model output {}x{} is not an integer multiple of the {PROBE_EDGE}x{PROBE_EDGE} probe",
                output.width,
                output.height
            );
        }
        Ok((output.width / PROBE_EDGE) as u32)
    }

    fn run(&mut self, input: Array4<f32>) -> Result<(Vec<f32>, Vec<usize>)> {
        let session = self
            .session
            .as_mut()
            .context("ONNX session not initialized")?;
        let input_name = self.input_name.as_str();
        let output_name = self.output_name.as_str();

        if self.is_fp16 {
            let shape = input.shape().to_vec();
            let mut fp16_data = vec![f16::ZERO; input.len()];
            match input.as_slice() {
                Some(slice) => fp16_data.convert_from_f32_slice(slice),
                None => {
                    for (dst, src) in fp16_data.iter_mut().zip(input.iter()) {
                        *dst = f16::from_f32(*src);
                    }
                }
            }
            let tensor = Tensor::from_array(ArrayD::from_shape_vec(shape, fp16_data)?)?;
            let outputs = session.run(ort::inputs![input_name => &tensor])?;
            let view = outputs[output_name].try_extract_array::<f16>()?;
            let shape = view.shape().to_vec();
            let contiguous = view.as_standard_layout();
            let mut data = vec![0.0f32; contiguous.len()];
            match contiguous.as_slice() {
                Some(slice) => slice.convert_to_f32_slice(&mut data),
                None => {
                    for (dst, src) in data.iter_mut().zip(contiguous.iter()) {
                        *dst = src.to_f32();
                    }
                }
            }
            Ok((data, shape))
        } else {
            let tensor = Tensor::from_array(input)?;
            let outputs = session.run(ort::inputs![input_name => &tensor])?;
            let view = outputs[output_name].try_extract_array::<f32>()?;
            let shape = view.shape().to_vec();
            Ok((view.iter().copied().collect(), shape))
        }
    }
}

impl Backend for OnnxBackend {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn initialize(&mut self) -> Result<()> {
        if !Self::is_available() {
            return Err(UpscaleError::BackendUnavailable("onnx".to_string()).into());
        }
        let (model_path, catalog_range) = self.resolve_model()?;
        let session = build_session(
            &model_path,
            self.options.execution,
            self.options.trt_cache_dir.as_deref(),
            self.options.fp16,
        )?;

        self.input_name = session.inputs()[0].name().to_string();
        self.output_name = session.outputs()[0].name().to_string();
        self.is_fp16 = match session.inputs()[0].dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };
        self.value_range = catalog_range.unwrap_or(if self.is_fp16 {
            ValueRange::Unit
        } else {
            ValueRange::Byte
        });
        self.session = Some(session);

        self.scale = self.detect_scale(&model_path)?;
        if self.options.execution != ExecutionTarget::Cpu {
            self.gpu = query_gpu_memory();
        }

        info!(
            model = %model_path.display(),
            execution = %self.options.execution,
            input = %self.input_name,
            output = %self.output_name,
            fp16 = self.is_fp16,
            range = ?self.value_range,
            scale = self.scale,
            "Loaded ONNX model"
        );
        Ok(())
    }

    fn upscale(&mut self, image: &RgbImage) -> Result<RgbImage> {
        let (h, w) = (image.height, image.width);
        let input = pad_nchw(&rgb_to_nchw(image, self.value_range), h, w);
        let (data, shape) = self
            .run(input)
            .map_err(|e| UpscaleError::inference(format!("{e:#}")))?;

        if shape.len() != 4 || shape[0] != 1 || shape[1] != 3 {
            return Err(UpscaleError::inference(format!("unexpected output shape {shape:?}")).into());
        }
        let (out_h, out_w) = (shape[2], shape[3]);
        let scale = out_h / (h + pad_amount(h)).max(1);
        nchw_to_rgb(&data, out_h, out_w, h * scale, w * scale, self.value_range)
    }

    fn memory_info(&self) -> MemoryInfo {
        self.gpu.clone().unwrap_or_else(|| MemoryInfo {
            available_mb: CPU_MEMORY_MB,
            device_name: "cpu".to_string(),
        })
    }

    fn scale(&self) -> u32 {
        self.scale
    }
}

fn pad_amount(dim: usize) -> usize {
    (PAD_ALIGN - (dim % PAD_ALIGN)) % PAD_ALIGN
}

/// Interleaved RGB u8 → NCHW `[1,3,H,W]` in the model's value range.
fn rgb_to_nchw(image: &RgbImage, range: ValueRange) -> Array4<f32> {
    let (h, w) = (image.height, image.width);
    let factor = range.max() / 255.0;
    let mut arr = Array4::<f32>::zeros((1, 3, h, w));
    for (i, px) in image.data.chunks_exact(3).enumerate() {
        let (y, x) = (i / w, i % w);
        for c in 0..3 {
            arr[[0, c, y, x]] = px[c] as f32 * factor;
        }
    }
    arr
}

/// Reflection-pad NCHW array so H and W are multiples of [`PAD_ALIGN`].
fn pad_nchw(arr: &Array4<f32>, h: usize, w: usize) -> Array4<f32> {
    let pad_h = pad_amount(h);
    let pad_w = pad_amount(w);
    if pad_h == 0 && pad_w == 0 {
        return arr.clone();
    }

    let new_h = h + pad_h;
    let new_w = w + pad_w;
    let mut padded = Array4::<f32>::zeros((1, 3, new_h, new_w));
    padded
        .slice_mut(s![.., .., ..h, ..w])
        .assign(&arr.slice(s![.., .., ..h, ..w]));

    let reflect = |i: usize, len: usize| if i < len { i } else { (len - 1).saturating_sub(i - len) };
    for c in 0..3 {
        for y in 0..new_h {
            for x in 0..new_w {
                if y < h && x < w {
                    continue;
                }
                padded[[0, c, y, x]] = arr[[0, c, reflect(y, h), reflect(x, w)]];
            }
        }
    }
    padded
}

/// NCHW `[1,3,out_h,out_w]` → interleaved RGB u8, keeping the top-left
/// `keep_h`×`keep_w` region.
fn nchw_to_rgb(
    data: &[f32],
    out_h: usize,
    out_w: usize,
    keep_h: usize,
    keep_w: usize,
    range: ValueRange,
) -> Result<RgbImage> {
    if keep_h > out_h || keep_w > out_w || data.len() != 3 * out_h * out_w {
        return Err(UpscaleError::inference(format!(
            "output {out_w}x{out_h} cannot hold the expected {keep_w}x{keep_h} result"
        ))
        .into());
    }
    let hw = out_h * out_w;
    let factor = 255.0 / range.max();
    let mut rgb = Vec::with_capacity(keep_h * keep_w * 3);
    for y in 0..keep_h {
        for x in 0..keep_w {
            let i = y * out_w + x;
            for c in 0..3 {
                rgb.push((data[c * hw + i] * factor).round().clamp(0.0, 255.0) as u8);
            }
        }
    }
    RgbImage::new(rgb, keep_w, keep_h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_target_from_str() {
        assert_eq!(ExecutionTarget::from_str_lossy("TRT"), ExecutionTarget::Tensorrt);
        assert_eq!(ExecutionTarget::from_str_lossy("cpu"), ExecutionTarget::Cpu);
        assert_eq!(ExecutionTarget::from_str_lossy("whatever"), ExecutionTarget::Cuda);
        assert_eq!(ExecutionTarget::Tensorrt.to_string(), "tensorrt");
    }

    #[test]
    fn pad_reflects_edges() {
        let mut arr = Array4::<f32>::zeros((1, 3, 2, 3));
        for y in 0..2 {
            for x in 0..3 {
                arr[[0, 0, y, x]] = (y * 10 + x) as f32;
            }
        }
        let padded = pad_nchw(&arr, 2, 3);
        assert_eq!(padded.shape(), &[1, 3, 4, 4]);
        assert_eq!(padded[[0, 0, 0, 3]], 2.0);
        assert_eq!(padded[[0, 0, 2, 0]], 10.0);
        assert_eq!(padded[[0, 0, 3, 1]], 1.0);
    }

    #[test]
    fn nchw_conversion_respects_value_range() {
        let image = RgbImage::new(vec![255, 0, 51, 0, 255, 102], 2, 1).unwrap();
        for range in [ValueRange::Unit, ValueRange::Byte] {
            let arr = rgb_to_nchw(&image, range);
            assert!((arr[[0, 0, 0, 0]] - range.max()).abs() < 1e-4);
            let data: Vec<f32> = arr.iter().copied().collect();
            let back = nchw_to_rgb(&data, 1, 2, 1, 2, range).unwrap();
            assert_eq!(back, image);
        }
    }

    #[test]
    fn nchw_crop_drops_padding() {
        let data: Vec<f32> = (0..3 * 4 * 4).map(|v| v as f32).collect();
        let out = nchw_to_rgb(&data, 4, 4, 2, 3, ValueRange::Byte).unwrap();
        assert_eq!((out.width, out.height), (3, 2));
        assert_eq!(out.pixel(2, 1), [6, 22, 38]);
        assert!(nchw_to_rgb(&data, 4, 4, 5, 1, ValueRange::Byte).is_err());
    }

    #[test]
    #[ignore]
    fn real_onnx_model_upscales() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = OnnxBackend::new(BackendOptions {
            model: "realesrgan-x4plus-anime-onnx".into(),
            models_dir: dir.path().to_path_buf(),
            execution: ExecutionTarget::Cpu,
            ..Default::default()
        });
        backend.initialize().unwrap();
        assert_eq!(backend.scale(), 4);
        let out = backend.upscale(&RgbImage::filled(10, 6, [120, 60, 30])).unwrap();
        assert_eq!((out.width, out.height), (40, 24));
    }
}
