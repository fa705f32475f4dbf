//! Multi-file runs: discovery, up-front frame counts, per-file isolation.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use super::{Pipeline, ProgressSink, ProgressTracker};
use crate::error::is_cancelled;
use crate::ffmpeg;
use crate::imageio::IMAGE_EXTENSIONS;

pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "webm", "flv", "wmv"];
const OUTPUT_SUFFIX: &str = "_upscaled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Video)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MediaFilter {
    Image,
    Video,
    #[default]
    All,
}

impl MediaFilter {
    pub fn accepts(self, kind: MediaKind) -> bool {
        matches!(
            (self, kind),
            (Self::All, _) | (Self::Image, MediaKind::Image) | (Self::Video, MediaKind::Video)
        )
    }
}

impl FromStr for MediaFilter {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "image" | "images" => Ok(Self::Image),
            "video" | "videos" => Ok(Self::Video),
            "all" => Ok(Self::All),
            other => bail!("Unknown media type: {other} (expected image, video or all)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub root: PathBuf,
    pub output_dir: PathBuf,
    pub filter: MediaFilter,
    pub pattern: String,
    pub recursive: bool,
    pub skip_existing: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            output_dir: PathBuf::from("output"),
            filter: MediaFilter::All,
            pattern: "*".to_string(),
            recursive: false,
            skip_existing: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileJob {
    pub input: PathBuf,
    pub output: PathBuf,
    pub kind: MediaKind,
    /// Expected frames; images and unprobeable videos count 1.
    pub frames: u64,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, anyhow::Error)>,
    pub cancelled: bool,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

/// Shell-style match of `*` (any run) and `?` (one char) against `name`.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ni));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ni = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

/// `<output_dir>/[relative dirs/]<stem>_upscaled<.ext>`.
pub fn output_path_for(input: &Path, root: &Path, output_dir: &Path, keep_dirs: bool) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match input.extension() {
        Some(ext) => format!("{stem}{OUTPUT_SUFFIX}.{}", ext.to_string_lossy()),
        None => format!("{stem}{OUTPUT_SUFFIX}"),
    };
    let mut out = output_dir.to_path_buf();
    if keep_dirs {
        if let Some(rel) = input.parent().and_then(|p| p.strip_prefix(root).ok()) {
            out.push(rel);
        }
    }
    out.join(file_name)
}

fn frame_count(pipeline: &Pipeline, input: &Path, kind: MediaKind) -> u64 {
    match kind {
        MediaKind::Image => 1,
        MediaKind::Video => match ffmpeg::probe(input, pipeline.options().probe_timeout) {
            Ok(info) if info.frame_count > 0 => info.frame_count,
            Ok(_) => 1,
            Err(e) => {
                warn!(path = %input.display(), "Could not probe frame count, counting 1: {e:#}");
                1
            }
        },
    }
}

/// Matching files under `options.root`, sorted by path. Frame counts are left
/// at 1; [`Pipeline::plan_jobs`] fills them in.
pub fn discover(options: &BatchOptions) -> Result<Vec<FileJob>> {
    if !options.root.is_dir() {
        bail!("Batch root is not a directory: {}", options.root.display());
    }
    let output_abs = options.output_dir.canonicalize().ok();
    let max_depth = if options.recursive { usize::MAX } else { 1 };

    let mut jobs = Vec::new();
    for entry in WalkDir::new(&options.root)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            // Never walk into our own output directory.
            match (&output_abs, e.path().canonicalize()) {
                (Some(out), Ok(path)) => e.depth() == 0 || path != *out,
                _ => true,
            }
        })
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(kind) = MediaKind::from_path(path) else {
            continue;
        };
        if !options.filter.accepts(kind) {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !wildcard_match(&options.pattern, &name) {
            continue;
        }
        let output = output_path_for(path, &options.root, &options.output_dir, options.recursive);
        if options.skip_existing && output.exists() {
            info!(path = %path.display(), "Output exists, skipping");
            continue;
        }
        jobs.push(FileJob {
            input: path.to_path_buf(),
            output,
            kind,
            frames: 1,
        });
    }
    Ok(jobs)
}

impl Pipeline {
    /// Fill in expected frame counts before anything runs.
    pub fn plan_jobs(&self, mut jobs: Vec<FileJob>) -> Vec<FileJob> {
        for job in &mut jobs {
            job.frames = frame_count(self, &job.input, job.kind);
        }
        jobs
    }

    fn run_job(&mut self, job: &FileJob, tracker: &mut ProgressTracker<'_>) -> Result<u64> {
        if let Some(parent) = job.output.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        match job.kind {
            MediaKind::Image => self.process_image(&job.input, &job.output, tracker),
            MediaKind::Video => self.process_video_file(&job.input, &job.output, tracker),
        }
    }

    /// Process `jobs` in order. A failing file is recorded and the batch moves
    /// on; cancellation stops it from starting further files.
    pub fn run_batch(&mut self, jobs: &[FileJob], sink: &mut dyn ProgressSink) -> BatchReport {
        let counts: Vec<u64> = jobs.iter().map(|j| j.frames).collect();
        let mut tracker = ProgressTracker::new(&counts, sink);
        let mut report = BatchReport::default();

        for job in jobs {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            tracker.start_file(job.input.clone(), job.frames);
            match self.run_job(job, &mut tracker) {
                Ok(frames) => {
                    tracker.finish_file(job.output.clone());
                    info!(input = %job.input.display(), frames, "File completed");
                    report.succeeded.push(job.input.clone());
                }
                Err(err) => {
                    tracker.fail_file(&err);
                    if is_cancelled(&err) {
                        warn!(input = %job.input.display(), "Cancelled");
                        report.cancelled = true;
                        report.failed.push((job.input.clone(), err));
                        break;
                    }
                    error!(input = %job.input.display(), "File failed: {err:#}");
                    report.failed.push((job.input.clone(), err));
                }
            }
        }

        tracker.finish_batch(report.succeeded.len(), report.failed.len());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imageio::save_rgb;
    use crate::pipeline::tests::fake_pipeline;
    use crate::pipeline::{PipelineOptions, ProgressEvent};
    use crate::types::RgbImage;

    #[test]
    fn wildcard_patterns() {
        assert!(wildcard_match("*", "anything.mp4"));
        assert!(wildcard_match("*.mp4", "clip.mp4"));
        assert!(!wildcard_match("*.mp4", "clip.mp4.bak"));
        assert!(wildcard_match("DSC*.jpg", "DSC0042.jpg"));
        assert!(!wildcard_match("DSC*.jpg", "IMG0042.jpg"));
        assert!(wildcard_match("a?c", "abc"));
        assert!(!wildcard_match("a?c", "ac"));
        assert!(wildcard_match("*a*b*", "xxaxxbxx"));
    }

    #[test]
    fn output_names_keep_extension_and_dirs() {
        let root = Path::new("in");
        assert_eq!(
            output_path_for(Path::new("in/sub/photo.JPG"), root, Path::new("out"), true),
            PathBuf::from("out/sub/photo_upscaled.JPG")
        );
        assert_eq!(
            output_path_for(Path::new("in/sub/photo.JPG"), root, Path::new("out"), false),
            PathBuf::from("out/photo_upscaled.JPG")
        );
    }

    #[test]
    fn media_filter_parsing() {
        assert_eq!("video".parse::<MediaFilter>().unwrap(), MediaFilter::Video);
        assert!(MediaFilter::All.accepts(MediaKind::Image));
        assert!(!MediaFilter::Image.accepts(MediaKind::Video));
        assert!("audio".parse::<MediaFilter>().is_err());
    }

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn discovery_filters_and_recurses() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("a.png"));
        touch(&root.join("b.mp4"));
        touch(&root.join("notes.txt"));
        touch(&root.join("nested/c.jpg"));
        touch(&root.join("output/a_upscaled.png"));

        let mut options = BatchOptions {
            root: root.to_path_buf(),
            output_dir: root.join("output"),
            ..Default::default()
        };
        let names = |jobs: Vec<FileJob>| -> Vec<String> {
            jobs.iter()
                .map(|j| j.input.file_name().unwrap().to_string_lossy().into_owned())
                .collect()
        };

        assert_eq!(names(discover(&options).unwrap()), ["a.png", "b.mp4"]);

        options.recursive = true;
        let jobs = discover(&options).unwrap();
        assert_eq!(
            jobs.iter().find(|j| j.input.ends_with("nested/c.jpg")).unwrap().output,
            root.join("output/nested/c_upscaled.jpg")
        );
        assert_eq!(names(jobs), ["a.png", "b.mp4", "c.jpg"]);

        options.filter = MediaFilter::Image;
        options.skip_existing = true;
        assert_eq!(names(discover(&options).unwrap()), ["c.jpg"]);

        options.pattern = "a*".into();
        options.skip_existing = false;
        assert_eq!(names(discover(&options).unwrap()), ["a.png"]);
    }

    #[test]
    fn batch_continues_past_failures_and_totals_add_up() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.png");
        save_rgb(&RgbImage::filled(4, 4, [1, 2, 3]), &good).unwrap();
        let bad = dir.path().join("bad.png");
        std::fs::write(&bad, b"garbage").unwrap();

        let jobs = vec![
            FileJob {
                input: bad.clone(),
                output: dir.path().join("out/bad_upscaled.png"),
                kind: MediaKind::Image,
                frames: 1,
            },
            FileJob {
                input: good.clone(),
                output: dir.path().join("out/good_upscaled.png"),
                kind: MediaKind::Image,
                frames: 1,
            },
        ];

        let mut pipeline = fake_pipeline(2, PipelineOptions {
            scale: 2,
            ..Default::default()
        });
        let mut events = Vec::new();
        let mut sink = |e: &ProgressEvent| events.push(e.clone());
        let report = pipeline.run_batch(&jobs, &mut sink);

        assert_eq!(report.succeeded, vec![good]);
        assert_eq!(report.failed.len(), 1);
        assert!(!report.is_success());
        assert!(dir.path().join("out/good_upscaled.png").is_file());
        assert!(matches!(
            events.last(),
            Some(ProgressEvent::BatchFinished {
                succeeded: 1,
                failed: 1,
                processed_frames: 2,
                total_frames: 2
            })
        ));
    }

    #[test]
    fn cancelled_batch_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = vec![FileJob {
            input: dir.path().join("a.png"),
            output: dir.path().join("a_upscaled.png"),
            kind: MediaKind::Image,
            frames: 1,
        }];
        let mut pipeline = fake_pipeline(2, PipelineOptions::default());
        pipeline.cancel_token().cancel();
        let report = pipeline.run_batch(&jobs, &mut crate::pipeline::NullProgress);
        assert!(report.cancelled);
        assert!(report.succeeded.is_empty() && report.failed.is_empty());
    }
}
