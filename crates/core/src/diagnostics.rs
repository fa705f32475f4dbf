//! Environment report behind `upscaler doctor`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::backend::{query_gpu_memory, BackendKind, MemoryInfo, NCNN_BINARY};
use crate::ffmpeg::version_line;
use crate::runtime::{ort_library_path, resolve_binary};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolStatus {
    pub name: String,
    pub path: Option<PathBuf>,
    pub version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BackendStatus {
    pub kind: BackendKind,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoctorReport {
    pub version: String,
    pub ffmpeg: ToolStatus,
    pub ffprobe: ToolStatus,
    pub ncnn: ToolStatus,
    pub ort_library: Option<PathBuf>,
    /// In the order `auto` tries them.
    pub backends: Vec<BackendStatus>,
    pub gpu: Option<MemoryInfo>,
    pub ram_total_mb: Option<u64>,
    pub ram_available_mb: Option<u64>,
    pub data_dir: PathBuf,
    pub models_dir: PathBuf,
    pub models_dir_exists: bool,
}

impl ToolStatus {
    fn probe(name: &str, with_version: bool) -> Self {
        let path = resolve_binary(name);
        let version = match (&path, with_version) {
            (Some(_), true) => version_line(name),
            _ => None,
        };
        Self {
            name: name.to_string(),
            path,
            version,
        }
    }

    pub fn found(&self) -> bool {
        self.path.is_some()
    }
}

impl DoctorReport {
    pub fn collect(data_dir: &Path, models_dir: &Path) -> Self {
        let meminfo = std::fs::read_to_string("/proc/meminfo").unwrap_or_default();
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            ffmpeg: ToolStatus::probe("ffmpeg", true),
            ffprobe: ToolStatus::probe("ffprobe", true),
            // The ncnn engine has no version flag.
            ncnn: ToolStatus::probe(NCNN_BINARY, false),
            ort_library: ort_library_path(),
            backends: BackendKind::PREFERENCE
                .iter()
                .map(|&kind| BackendStatus {
                    kind,
                    available: kind.is_available(),
                })
                .collect(),
            gpu: query_gpu_memory(),
            ram_total_mb: meminfo_kib(&meminfo, "MemTotal:").map(|kib| kib / 1024),
            ram_available_mb: meminfo_kib(&meminfo, "MemAvailable:").map(|kib| kib / 1024),
            data_dir: data_dir.to_path_buf(),
            models_dir: models_dir.to_path_buf(),
            models_dir_exists: models_dir.is_dir(),
        }
    }

    /// The backend `auto` would pick first.
    pub fn auto_backend(&self) -> Option<BackendKind> {
        self.backends.iter().find(|b| b.available).map(|b| b.kind)
    }

    /// Things that limit what the tool can do here.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.ffmpeg.found() {
            problems.push("ffmpeg not found: video input and output are unavailable".to_string());
        }
        if !self.ffprobe.found() {
            problems.push("ffprobe not found: video frame counts cannot be estimated".to_string());
        }
        if self.auto_backend() == Some(BackendKind::Classical) {
            problems.push(format!(
                "no neural backend available: install {NCNN_BINARY} or set ORT_DYLIB_PATH"
            ));
        }
        problems
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "upscaler {}", self.version);
        let _ = writeln!(out);

        for tool in [&self.ffmpeg, &self.ffprobe, &self.ncnn] {
            match (&tool.path, &tool.version) {
                (Some(path), Some(version)) => {
                    let _ = writeln!(out, "  {:<24} {} ({version})", tool.name, path.display());
                }
                (Some(path), None) => {
                    let _ = writeln!(out, "  {:<24} {}", tool.name, path.display());
                }
                (None, _) => {
                    let _ = writeln!(out, "  {:<24} not found", tool.name);
                }
            }
        }
        let ort = self
            .ort_library
            .as_ref()
            .map_or_else(|| "not found".to_string(), |p| p.display().to_string());
        let _ = writeln!(out, "  {:<24} {ort}", "onnxruntime");

        let _ = writeln!(out);
        let _ = writeln!(out, "Backends (auto order):");
        for status in &self.backends {
            let mark = if status.available { "yes" } else { "no" };
            let _ = writeln!(out, "  {:<24} {mark}", status.kind.as_str());
        }

        let _ = writeln!(out);
        match &self.gpu {
            Some(gpu) => {
                let _ = writeln!(out, "GPU: {} ({} MB free)", gpu.device_name, gpu.available_mb);
            }
            None => {
                let _ = writeln!(out, "GPU: not detected");
            }
        }
        if let (Some(total), Some(available)) = (self.ram_total_mb, self.ram_available_mb) {
            let _ = writeln!(out, "RAM: {available} MB available of {total} MB");
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "Data dir:   {}", self.data_dir.display());
        let suffix = if self.models_dir_exists { "" } else { " (missing)" };
        let _ = writeln!(out, "Models dir: {}{suffix}", self.models_dir.display());

        let problems = self.problems();
        if !problems.is_empty() {
            let _ = writeln!(out);
            for problem in problems {
                let _ = writeln!(out, "warning: {problem}");
            }
        }
        out
    }
}

fn meminfo_kib(contents: &str, key: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let raw = line.strip_prefix(key)?.trim().strip_suffix("kB")?;
        raw.trim().parse().ok()
    })
}
