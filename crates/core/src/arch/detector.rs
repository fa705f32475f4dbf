use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use super::cache::{file_identity, DetectionCache};
use super::{score, ArchKind, ArchitectureDescriptor, MismatchReport, TRUSTED_CONFIDENCE};
use crate::checkpoint::Checkpoint;

const COMPACT_NAME_HINTS: [&str; 3] = ["realesr-general", "animevideo", "compact"];
const RRDB_NAME_HINTS: [&str; 3] = ["x4plus", "rrdb", "esrgan"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionSource {
    Metadata,
    Heuristic,
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub descriptor: ArchitectureDescriptor,
    pub report: MismatchReport,
    pub source: DetectionSource,
}

fn has_flat_body_weight(name: &str) -> bool {
    name.strip_prefix("body.")
        .and_then(|rest| rest.strip_suffix(".weight"))
        .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
}

/// Candidate families, filename hints first, then structural hints. Falls back
/// to every family when nothing fires.
pub fn candidate_kinds(checkpoint: &Checkpoint, file_name: &str) -> Vec<ArchKind> {
    let mut candidates = Vec::new();
    let lower = file_name.to_ascii_lowercase();

    // "realesr-general" would otherwise also match the "esrgan" hint.
    if COMPACT_NAME_HINTS.iter().any(|h| lower.contains(h)) {
        candidates.push(ArchKind::CompactConvNet);
    } else if RRDB_NAME_HINTS.iter().any(|h| lower.contains(h)) {
        candidates.push(ArchKind::ResidualDenseNet);
    }

    let dense = checkpoint.names().any(|n| n.contains(".rdb"));
    let structural = if dense {
        Some(ArchKind::ResidualDenseNet)
    } else if checkpoint.names().any(has_flat_body_weight) {
        Some(ArchKind::CompactConvNet)
    } else {
        None
    };
    if let Some(kind) = structural {
        if !candidates.contains(&kind) {
            candidates.push(kind);
        }
    }

    if candidates.is_empty() {
        candidates.extend(ArchKind::ALL);
    }
    candidates
}

fn verify_metadata(checkpoint: &Checkpoint) -> Option<Detection> {
    let (name, meta_params) = checkpoint.explicit_architecture()?;
    let Some(kind) = ArchKind::from_name(&name) else {
        debug!(arch_name = %name, "Checkpoint names an unknown architecture");
        return None;
    };

    let mut params = kind
        .infer_params(checkpoint)
        .unwrap_or_else(|| kind.default_params());
    params.extend(meta_params);
    if let Err(reason) = kind.check_params(&params) {
        warn!(arch = %kind, "Ignoring checkpoint metadata: {reason}");
        return None;
    }

    let (confidence, report) = score(kind, &params, checkpoint);
    debug!(arch = %kind, confidence, "Verified architecture metadata");
    (confidence >= TRUSTED_CONFIDENCE).then(|| Detection {
        descriptor: ArchitectureDescriptor {
            name: kind,
            params,
            confidence,
        },
        report,
        source: DetectionSource::Metadata,
    })
}

/// Pure detection over a loaded checkpoint signature. The best-scoring
/// candidate is returned even below [`TRUSTED_CONFIDENCE`].
pub fn detect_from_checkpoint(checkpoint: &Checkpoint, file_name: &str) -> Result<Detection> {
    if let Some(detection) = verify_metadata(checkpoint) {
        return Ok(detection);
    }

    let mut best: Option<Detection> = None;
    for kind in candidate_kinds(checkpoint, file_name) {
        let Some(params) = kind.infer_params(checkpoint) else {
            debug!(arch = %kind, "Anchor tensors absent, skipping candidate");
            continue;
        };
        if let Err(reason) = kind.check_params(&params) {
            debug!(arch = %kind, "Skipping candidate: {reason}");
            continue;
        }
        let (confidence, report) = score(kind, &params, checkpoint);
        debug!(arch = %kind, confidence, ?params, "Scored candidate");

        let better = best
            .as_ref()
            .map_or(true, |b| confidence > b.descriptor.confidence);
        if better {
            best = Some(Detection {
                descriptor: ArchitectureDescriptor {
                    name: kind,
                    params,
                    confidence,
                },
                report,
                source: DetectionSource::Heuristic,
            });
        }
    }

    match best {
        Some(detection) => Ok(detection),
        None => bail!(
            "no known architecture matches '{file_name}' ({} tensors)",
            checkpoint.len()
        ),
    }
}

#[derive(Debug, Clone)]
pub struct ArchitectureDetector {
    use_cache: bool,
}

impl Default for ArchitectureDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchitectureDetector {
    pub fn new() -> Self {
        Self { use_cache: true }
    }

    pub fn without_cache() -> Self {
        Self { use_cache: false }
    }

    /// Detect the architecture of the checkpoint at `path`. The flag is `true`
    /// when the answer came from the cache without loading the file.
    pub fn detect(&self, path: &Path) -> Result<(ArchitectureDescriptor, bool)> {
        let path = std::fs::canonicalize(path)
            .with_context(|| format!("checkpoint not found: {}", path.display()))?;
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let (mtime, size) = file_identity(&path)?;

        let mut cache = if self.use_cache {
            let cache = DetectionCache::load(dir);
            if let Some(descriptor) = cache.lookup(&path, mtime, size) {
                debug!(path = %path.display(), arch = %descriptor.name, "Detection cache hit");
                return Ok((descriptor, true));
            }
            Some(cache)
        } else {
            None
        };

        let checkpoint = Checkpoint::load(&path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let detection = detect_from_checkpoint(&checkpoint, &file_name)
            .with_context(|| format!("architecture detection failed for {}", path.display()))?;
        let descriptor = detection.descriptor;

        if descriptor.is_trusted() {
            info!(
                arch = %descriptor.name,
                scale = descriptor.scale(),
                confidence = descriptor.confidence,
                source = ?detection.source,
                "Detected architecture"
            );
        } else {
            warn!(
                arch = %descriptor.name,
                confidence = descriptor.confidence,
                "Low-confidence architecture detection, continuing with best guess: {}",
                detection.report.summary()
            );
        }

        if let Some(cache) = cache.as_mut() {
            cache.insert(&path, &descriptor, mtime, size);
            if let Err(e) = cache.save() {
                warn!(error = %format!("{e:#}"), "Failed to write detection cache");
            }
        }

        Ok((descriptor, false))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn checkpoint_for(kind: ArchKind) -> Checkpoint {
        Checkpoint::from_shapes(kind.expected_tensors(&kind.default_params()), BTreeMap::new())
    }

    #[test]
    fn filename_hints_pick_family() {
        let empty = Checkpoint::from_shapes(Vec::<(String, Vec<usize>)>::new(), BTreeMap::new());
        assert_eq!(
            candidate_kinds(&empty, "realesr-general-x4v3.safetensors"),
            vec![ArchKind::CompactConvNet]
        );
        assert_eq!(
            candidate_kinds(&empty, "RealESRGAN_x4plus.onnx"),
            vec![ArchKind::ResidualDenseNet]
        );
        assert_eq!(candidate_kinds(&empty, "weights.onnx"), ArchKind::ALL.to_vec());
    }

    #[test]
    fn structural_hints_follow_key_patterns() {
        assert_eq!(
            candidate_kinds(&checkpoint_for(ArchKind::ResidualDenseNet), "weights.safetensors"),
            vec![ArchKind::ResidualDenseNet]
        );
        assert_eq!(
            candidate_kinds(&checkpoint_for(ArchKind::CompactConvNet), "weights.safetensors"),
            vec![ArchKind::CompactConvNet]
        );
    }

    #[test]
    fn misleading_filename_still_scores_structure() {
        let checkpoint = checkpoint_for(ArchKind::ResidualDenseNet);
        let detection = detect_from_checkpoint(&checkpoint, "my-compact-model.safetensors").unwrap();
        assert_eq!(detection.descriptor.name, ArchKind::ResidualDenseNet);
        assert_eq!(detection.descriptor.confidence, 1.0);
    }

    #[test]
    fn metadata_is_accepted_when_verified() {
        let kind = ArchKind::CompactConvNet;
        let mut meta = BTreeMap::new();
        meta.insert("arch_name".to_string(), "SRVGGNetCompact".to_string());
        meta.insert("arch_params".to_string(), r#"{"num_conv": 32}"#.to_string());
        let checkpoint =
            Checkpoint::from_shapes(kind.expected_tensors(&kind.default_params()), meta);

        let detection = detect_from_checkpoint(&checkpoint, "anything").unwrap();
        assert_eq!(detection.source, DetectionSource::Metadata);
        assert_eq!(detection.descriptor.scale(), 4);
    }

    #[test]
    fn wrong_metadata_falls_back_to_heuristics() {
        let mut meta = BTreeMap::new();
        meta.insert("arch_name".to_string(), "SRVGGNetCompact".to_string());
        meta.insert("arch_params".to_string(), "{}".to_string());
        let kind = ArchKind::ResidualDenseNet;
        let checkpoint =
            Checkpoint::from_shapes(kind.expected_tensors(&kind.default_params()), meta);

        let detection = detect_from_checkpoint(&checkpoint, "x").unwrap();
        assert_eq!(detection.source, DetectionSource::Heuristic);
        assert_eq!(detection.descriptor.name, kind);
    }

    #[test]
    fn hostile_metadata_params_are_discarded() {
        let kind = ArchKind::CompactConvNet;
        for raw in [
            r#"{"upscale": 5000000000}"#,
            r#"{"num_conv": 100000000}"#,
            r#"{"num_out_ch": -3}"#,
        ] {
            let mut meta = BTreeMap::new();
            meta.insert("arch_name".to_string(), "SRVGGNetCompact".to_string());
            meta.insert("arch_params".to_string(), raw.to_string());
            let checkpoint =
                Checkpoint::from_shapes(kind.expected_tensors(&kind.default_params()), meta);

            let detection = detect_from_checkpoint(&checkpoint, "model.safetensors").unwrap();
            assert_eq!(detection.source, DetectionSource::Heuristic, "{raw}");
            assert_eq!(detection.descriptor.name, kind);
            assert_eq!(detection.descriptor.scale(), 4);
        }
    }

    #[test]
    fn stray_block_index_does_not_blow_up_detection() {
        let checkpoint = Checkpoint::from_shapes(
            [
                ("conv_first.weight", vec![64, 3, 3, 3]),
                ("body.3000000.rdb1.conv1.weight", vec![32, 64, 3, 3]),
            ],
            BTreeMap::new(),
        );
        assert!(detect_from_checkpoint(&checkpoint, "x4plus.safetensors").is_err());
    }

    #[test]
    fn partial_checkpoint_is_low_confidence_but_usable() {
        let kind = ArchKind::ResidualDenseNet;
        let mut shapes = kind.expected_tensors(&kind.default_params());
        shapes.retain(|name, _| !name.contains(".rdb3."));
        let checkpoint = Checkpoint::from_shapes(shapes, BTreeMap::new());

        let detection = detect_from_checkpoint(&checkpoint, "x4plus.safetensors").unwrap();
        assert!(!detection.descriptor.is_trusted());
        assert_eq!(detection.descriptor.params["num_block"], 23);
        assert_eq!(detection.report.missing.len(), 23 * 5 * 2);
    }

    #[test]
    fn unrecognised_tensors_are_an_error() {
        let checkpoint = Checkpoint::from_shapes([("encoder.weight", vec![8, 8])], BTreeMap::new());
        assert!(detect_from_checkpoint(&checkpoint, "unet.safetensors").is_err());
    }
}
