use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use url::Url;

use crate::error::UpscaleError;

/// Directory searched before the store when it holds the requested file.
pub const MODEL_PATH_ENV: &str = "UPSCALER_MODEL_PATH";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Pth,
    Safetensors,
    Onnx,
}

/// Pixel value range a network consumes and produces.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValueRange {
    #[default]
    Unit,
    Byte,
}

impl ValueRange {
    pub fn max(self) -> f32 {
        match self {
            Self::Unit => 1.0,
            Self::Byte => 255.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    pub filename: String,
    pub url: Option<String>,
    pub sha256: Option<String>,
    pub scale: u32,
    pub format: ModelFormat,
    pub value_range: ValueRange,
    pub description: String,
}

fn builtin_catalog() -> Vec<ModelEntry> {
    let release = "https://github.com/xinntao/Real-ESRGAN/releases/download";
    let pth = |name: &str, filename: &str, tag: &str, sha: &str, description: &str| ModelEntry {
        name: name.into(),
        filename: filename.into(),
        url: Some(format!("{release}/{tag}/{filename}")),
        sha256: Some(sha.into()),
        scale: 4,
        format: ModelFormat::Pth,
        value_range: ValueRange::Unit,
        description: description.into(),
    };

    vec![
        pth(
            "realesr-general-x4v3",
            "realesr-general-x4v3.pth",
            "v0.2.5.0",
            "dd7de8a97048fa2d0e05aea1b5a2c83a2e3861a08c5f0c0c2821787c85cf5947",
            "General purpose compact model (SRVGGNetCompact)",
        ),
        pth(
            "realesrgan-x4plus",
            "RealESRGAN_x4plus.pth",
            "v0.1.0",
            "4fa0d38905f75ac06eb49a7951b426670021be3018265fd191d2125df9d682f1",
            "RRDB x4 model for photographic content",
        ),
        pth(
            "realesrgan-x4plus-anime",
            "RealESRGAN_x4plus_anime_6B.pth",
            "v0.2.2.4",
            "f872d837d3c90ed2e05227bed711af5671a6fd1c9f7d7e91c911a61f155e99da",
            "6-block RRDB x4 model tuned for anime",
        ),
        pth(
            "realesnet-x4plus",
            "RealESRNet_x4plus.pth",
            "v0.1.1",
            "df35f2bff19ca942eef14a8f291e29e3b0e5a5db436f58e451968a69ad995b5c",
            "RRDB x4 model trained with MSE loss only",
        ),
        ModelEntry {
            name: "realesrgan-x4plus-anime-onnx".into(),
            filename: "RealESRGAN_x4plus_anime_6B.onnx".into(),
            url: Some("https://huggingface.co/deepghs/imgutils-models/resolve/main/onnx/realesrgan/RealESRGAN_x4plus_anime_6B.onnx".into()),
            sha256: None,
            scale: 4,
            format: ModelFormat::Onnx,
            value_range: ValueRange::Byte,
            description: "ONNX export of the 6-block anime model (17.9 MB)".into(),
        },
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    #[serde(flatten)]
    pub entry: ModelEntry,
    pub path: PathBuf,
    pub downloaded: bool,
    pub size_bytes: Option<u64>,
}

pub struct ModelStore {
    models_dir: PathBuf,
    custom_dir: Option<PathBuf>,
    entries: Vec<ModelEntry>,
}

impl ModelStore {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            custom_dir: std::env::var_os(MODEL_PATH_ENV).map(PathBuf::from),
            entries: builtin_catalog(),
        }
    }

    pub fn with_entries(models_dir: PathBuf, entries: Vec<ModelEntry>) -> Self {
        Self {
            models_dir,
            custom_dir: None,
            entries,
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn list(&self) -> &[ModelEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    fn entry(&self, name: &str) -> Result<&ModelEntry> {
        self.get(name).with_context(|| {
            let names: Vec<&str> = self.entries.iter().map(|e| e.name.as_str()).collect();
            format!("Unknown model: {name}. Available models: {}", names.join(", "))
        })
    }

    /// Where `name` lives (or will live once downloaded).
    pub fn model_path(&self, name: &str) -> Result<PathBuf> {
        let entry = self.entry(name)?;
        if let Some(custom) = &self.custom_dir {
            let candidate = custom.join(&entry.filename);
            if candidate.is_file() {
                info!(path = %candidate.display(), "Using custom model path");
                return Ok(candidate);
            }
        }
        Ok(self.models_dir.join(&entry.filename))
    }

    /// Present and, when a checksum is known, intact. A corrupt file is deleted.
    pub fn is_downloaded(&self, name: &str) -> Result<bool> {
        let entry = self.entry(name)?;
        let path = self.model_path(name)?;
        if !path.is_file() {
            return Ok(false);
        }
        if let Some(expected) = &entry.sha256 {
            let actual = sha256_file(&path)?;
            if &actual != expected {
                warn!(model = %name, path = %path.display(), "Checksum mismatch, removing corrupt model");
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Local path of `name`, downloading and verifying it on first use.
    pub fn get_model_path(&self, name: &str) -> Result<PathBuf> {
        if self.is_downloaded(name)? {
            return self.model_path(name);
        }
        self.download(name, false)
    }

    /// `model` may be a catalog name or a path to a checkpoint on disk.
    pub fn resolve(&self, model: &str) -> Result<PathBuf> {
        let as_path = Path::new(model);
        if as_path.is_file() {
            return Ok(as_path.to_path_buf());
        }
        self.get_model_path(model)
    }

    pub fn download(&self, name: &str, force: bool) -> Result<PathBuf> {
        let entry = self.entry(name)?;
        if !force && self.is_downloaded(name)? {
            let path = self.model_path(name)?;
            info!(model = %name, path = %path.display(), "Model already downloaded");
            return Ok(path);
        }

        let url = entry
            .url
            .as_deref()
            .with_context(|| format!("No download URL for model: {name}"))?;
        let url = Url::parse(url).with_context(|| format!("Invalid download URL for {name}: {url}"))?;

        fs::create_dir_all(&self.models_dir).with_context(|| {
            format!("Failed to create models directory: {}", self.models_dir.display())
        })?;
        let final_path = self.models_dir.join(&entry.filename);
        let tmp_path = self.models_dir.join(format!("{}.part", entry.filename));

        info!(model = %name, url = %url, "Downloading model");
        if let Err(err) = fetch(&url, &tmp_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.context(format!("Failed to download {name}")));
        }

        install_verified(entry, &tmp_path, &final_path)?;
        info!(model = %name, path = %final_path.display(), "Download complete");
        Ok(final_path)
    }

    pub fn statuses(&self) -> Result<Vec<ModelStatus>> {
        self.entries
            .iter()
            .map(|entry| {
                let path = self.model_path(&entry.name)?;
                let size_bytes = fs::metadata(&path).ok().map(|m| m.len());
                Ok(ModelStatus {
                    entry: entry.clone(),
                    downloaded: size_bytes.is_some(),
                    path,
                    size_bytes,
                })
            })
            .collect()
    }

    /// Remove every catalog file and leftover partial download from the store.
    pub fn clean(&self) -> Result<usize> {
        if !self.models_dir.is_dir() {
            return Ok(0);
        }
        let mut removed = 0;
        for entry in fs::read_dir(&self.models_dir)? {
            let path = entry?.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let known = self.entries.iter().any(|e| e.filename == file_name);
            if (known || file_name.ends_with(".part")) && path.is_file() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
                removed += 1;
            }
        }
        info!(removed, dir = %self.models_dir.display(), "Cleaned model store");
        Ok(removed)
    }
}

fn fetch(url: &Url, dest: &Path) -> Result<()> {
    if url.scheme() == "file" {
        let source = url
            .to_file_path()
            .map_err(|_| anyhow::anyhow!("Invalid file URL: {url}"))?;
        fs::copy(&source, dest)
            .with_context(|| format!("Failed to copy {} to {}", source.display(), dest.display()))?;
        return Ok(());
    }

    let client = reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(15))
        .timeout(Duration::from_secs(30 * 60))
        .build()
        .context("Failed to build HTTP client for model download")?;

    let mut response = client.get(url.as_str()).send().context("Failed to start download")?;
    if !response.status().is_success() {
        bail!("Download request returned HTTP {}", response.status().as_u16());
    }

    let mut file = fs::File::create(dest)
        .with_context(|| format!("Failed to create temp file: {}", dest.display()))?;
    response.copy_to(&mut file).context("Download interrupted")?;
    file.sync_all()
        .with_context(|| format!("Failed to flush temp file: {}", dest.display()))?;
    Ok(())
}

/// Check the partial file's digest, then move it into place. A mismatch
/// removes the file and fails.
fn install_verified(entry: &ModelEntry, tmp_path: &Path, final_path: &Path) -> Result<()> {
    match &entry.sha256 {
        Some(expected) => {
            let actual = sha256_file(tmp_path)?;
            if &actual != expected {
                let _ = fs::remove_file(tmp_path);
                return Err(UpscaleError::ChecksumMismatch {
                    name: entry.name.clone(),
                    expected: expected.clone(),
                    actual,
                }
                .into());
            }
            info!(model = %entry.name, "Checksum verified");
        }
        None => warn!(model = %entry.name, "No SHA256 configured, skipping verification"),
    }

    fs::rename(tmp_path, final_path).with_context(|| {
        format!("Failed to move {} to {}", tmp_path.display(), final_path.display())
    })
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.write_all(&buf[..n])?;
    }
    Ok(format!("{:x}", hasher.finalize()))
}
