//! Architecture families, their parameter-name signatures, and scoring of a
//! checkpoint against a candidate.

mod cache;
mod compact;
mod detector;
mod rrdb;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;

pub use cache::{clear_cache, file_identity, CacheEntry, DetectionCache, CACHE_FILE_NAME, CACHE_SCHEMA_VERSION};
pub use detector::{candidate_kinds, detect_from_checkpoint, ArchitectureDetector, Detection, DetectionSource};

/// Confidence at or above which a detection is trusted.
pub const TRUSTED_CONFIDENCE: f64 = 0.95;
/// Entries shown per list when a mismatch report is logged.
pub const REPORT_PREVIEW: usize = 5;

/// Deepest stack (compact convs or dense blocks) considered plausible.
pub const MAX_DEPTH: i64 = 1024;

pub type ArchParams = BTreeMap<String, i64>;

const CHANNEL_RANGE: (i64, i64) = (1, 64);
const WIDTH_RANGE: (i64, i64) = (1, 4096);
const SCALE_RANGE: (i64, i64) = (1, 4);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchKind {
    #[serde(rename = "SRVGGNetCompact")]
    CompactConvNet,
    #[serde(rename = "RRDBNet")]
    ResidualDenseNet,
}

impl ArchKind {
    pub const ALL: [ArchKind; 2] = [ArchKind::CompactConvNet, ArchKind::ResidualDenseNet];

    pub fn serialized_name(self) -> &'static str {
        match self {
            Self::CompactConvNet => "SRVGGNetCompact",
            Self::ResidualDenseNet => "RRDBNet",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "srvggnetcompact" | "compact" | "compactconvnet" => Some(Self::CompactConvNet),
            "rrdbnet" | "rrdb" | "residualdensenet" => Some(Self::ResidualDenseNet),
            _ => None,
        }
    }

    /// Hyperparameters read off tensor shapes, `None` if the family's anchor
    /// tensors are absent.
    pub fn infer_params(self, checkpoint: &Checkpoint) -> Option<ArchParams> {
        match self {
            Self::CompactConvNet => compact::infer_params(checkpoint),
            Self::ResidualDenseNet => rrdb::infer_params(checkpoint),
        }
    }

    pub fn expected_tensors(self, params: &ArchParams) -> BTreeMap<String, Vec<usize>> {
        match self {
            Self::CompactConvNet => compact::expected_tensors(params),
            Self::ResidualDenseNet => rrdb::expected_tensors(params),
        }
    }

    pub fn default_params(self) -> ArchParams {
        match self {
            Self::CompactConvNet => compact::default_params(),
            Self::ResidualDenseNet => rrdb::default_params(),
        }
    }

    fn param_limits(self) -> [(&'static str, (i64, i64)); 6] {
        match self {
            Self::CompactConvNet => [
                ("num_in_ch", CHANNEL_RANGE),
                ("num_out_ch", CHANNEL_RANGE),
                ("num_feat", WIDTH_RANGE),
                ("num_conv", (0, MAX_DEPTH)),
                ("upscale", SCALE_RANGE),
                ("act_prelu", (0, 1)),
            ],
            Self::ResidualDenseNet => [
                ("num_in_ch", CHANNEL_RANGE),
                ("num_out_ch", CHANNEL_RANGE),
                ("num_feat", WIDTH_RANGE),
                ("num_block", (0, MAX_DEPTH)),
                ("num_grow_ch", WIDTH_RANGE),
                ("scale", SCALE_RANGE),
            ],
        }
    }

    /// Reject hyperparameters outside the family's plausible ranges. Params
    /// from checkpoint metadata are untrusted and must pass this before
    /// [`ArchKind::expected_tensors`] enumerates anything.
    pub fn check_params(self, params: &ArchParams) -> Result<(), String> {
        for (key, (lo, hi)) in self.param_limits() {
            if let Some(&value) = params.get(key) {
                if !(lo..=hi).contains(&value) {
                    return Err(format!("{key}={value} is outside {lo}..={hi}"));
                }
            }
        }
        Ok(())
    }

    pub fn scale(self, params: &ArchParams) -> usize {
        let key = match self {
            Self::CompactConvNet => "upscale",
            Self::ResidualDenseNet => "scale",
        };
        params.get(key).copied().filter(|s| *s > 0).unwrap_or(4) as usize
    }
}

impl fmt::Display for ArchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.serialized_name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectureDescriptor {
    pub name: ArchKind,
    pub params: ArchParams,
    pub confidence: f64,
}

impl ArchitectureDescriptor {
    pub fn scale(&self) -> usize {
        self.name.scale(&self.params)
    }

    pub fn is_trusted(&self) -> bool {
        self.confidence >= TRUSTED_CONFIDENCE
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShapeMismatch {
    pub name: String,
    pub expected: Vec<usize>,
    pub actual: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MismatchReport {
    pub missing: Vec<String>,
    pub shape_mismatches: Vec<ShapeMismatch>,
    pub unexpected: Vec<String>,
}

impl MismatchReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.shape_mismatches.is_empty() && self.unexpected.is_empty()
    }

    /// One-line summary with each list cut to [`REPORT_PREVIEW`] entries.
    pub fn summary(&self) -> String {
        fn preview<T>(items: &[T], render: impl Fn(&T) -> String) -> String {
            let mut shown: Vec<String> = items.iter().take(REPORT_PREVIEW).map(render).collect();
            if items.len() > REPORT_PREVIEW {
                shown.push(format!("... +{} more", items.len() - REPORT_PREVIEW));
            }
            format!("[{}]", shown.join(", "))
        }

        format!(
            "missing {} {}, shape mismatches {} {}, unexpected {} {}",
            self.missing.len(),
            preview(&self.missing, |s| s.clone()),
            self.shape_mismatches.len(),
            preview(&self.shape_mismatches, |m| format!(
                "{} expected {:?} got {:?}",
                m.name, m.expected, m.actual
            )),
            self.unexpected.len(),
            preview(&self.unexpected, |s| s.clone()),
        )
    }
}

/// Fraction of expected tensors present with the expected shape. Params that
/// fail [`ArchKind::check_params`] score zero.
pub fn score(kind: ArchKind, params: &ArchParams, checkpoint: &Checkpoint) -> (f64, MismatchReport) {
    if let Err(reason) = kind.check_params(params) {
        tracing::debug!(arch = %kind, "Implausible parameters: {reason}");
        return (0.0, MismatchReport::default());
    }
    let expected = kind.expected_tensors(params);
    let mut report = MismatchReport::default();
    let mut matched = 0usize;

    for (name, shape) in &expected {
        match checkpoint.shape(name) {
            Some(actual) if actual == shape.as_slice() => matched += 1,
            Some(actual) => report.shape_mismatches.push(ShapeMismatch {
                name: name.clone(),
                expected: shape.clone(),
                actual: actual.to_vec(),
            }),
            None => report.missing.push(name.clone()),
        }
    }
    report.unexpected = checkpoint
        .names()
        .filter(|name| !expected.contains_key(*name))
        .map(str::to_string)
        .collect();

    let confidence = if expected.is_empty() {
        0.0
    } else {
        matched as f64 / expected.len() as f64
    };
    (confidence, report)
}

fn param(params: &ArchParams, key: &str, default: i64) -> usize {
    params.get(key).copied().filter(|v| *v >= 0).unwrap_or(default) as usize
}

fn insert_conv(
    map: &mut BTreeMap<String, Vec<usize>>,
    prefix: &str,
    out_ch: usize,
    in_ch: usize,
) {
    map.insert(format!("{prefix}.weight"), vec![out_ch, in_ch, 3, 3]);
    map.insert(format!("{prefix}.bias"), vec![out_ch]);
}

/// Parse the leading numeric segment after `prefix`, e.g. `body.12.weight` -> 12.
fn numbered_segment(name: &str, prefix: &str) -> Option<usize> {
    name.strip_prefix(prefix)?.split('.').next()?.parse().ok()
}
