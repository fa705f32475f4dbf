//! ffprobe / ffmpeg invocations for the video pipeline.
//!
//! Frames travel between ffmpeg and the upscaler as a yuv4mpegpipe stream, so
//! every command here either produces or consumes Y4M.

use std::path::Path;
use std::process::{Child, ChildStdout, Command};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::UpscaleError;
use crate::process::{run_checked, spawn_piped, spawn_stderr_drain, wait_with_timeout};
use crate::runtime::command_for;

// ---------------------------------------------------------------------------
// ffprobe JSON model (serde)
// ---------------------------------------------------------------------------

#[derive(Deserialize, Debug)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: FfprobeFormat,
}

#[derive(Deserialize, Debug)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frame_count: u64,
    pub has_audio: bool,
    pub duration: f64,
}

#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub video_codec: String,
    pub crf: u32,
    pub preset: String,
    pub copy_audio: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            crf: 18,
            preset: "medium".to_string(),
            copy_audio: true,
        }
    }
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    if let Some((num, den)) = s.split_once('/') {
        let num: f64 = num.trim().parse().ok()?;
        let den: f64 = den.trim().parse().ok()?;
        return (den > 0.0 && num > 0.0).then_some(num / den);
    }
    s.trim().parse().ok().filter(|v: &f64| *v > 0.0)
}

/// `nb_frames` when the container records it, else `round(duration * fps)`.
pub fn estimate_frame_count(nb_frames: Option<&str>, duration: f64, fps: f64) -> u64 {
    if let Some(n) = nb_frames.and_then(|s| s.trim().parse::<u64>().ok()) {
        if n > 0 {
            return n;
        }
    }
    if duration > 0.0 && fps > 0.0 {
        (duration * fps).round() as u64
    } else {
        0
    }
}

fn parse_probe(json: &[u8]) -> Result<MediaInfo> {
    let probe: FfprobeOutput =
        serde_json::from_slice(json).context("failed to parse ffprobe JSON output")?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| anyhow!("no video stream found"))?;
    let has_audio = probe
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let width = video.width.unwrap_or(0);
    let height = video.height.unwrap_or(0);
    if width == 0 || height == 0 {
        return Err(anyhow!("invalid video dimensions: {width}x{height}"));
    }

    let fps = video
        .r_frame_rate
        .as_deref()
        .and_then(parse_frame_rate)
        .or_else(|| video.avg_frame_rate.as_deref().and_then(parse_frame_rate))
        .unwrap_or(0.0);
    let duration = probe
        .format
        .duration
        .as_deref()
        .or(video.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(MediaInfo {
        width,
        height,
        fps,
        frame_count: estimate_frame_count(video.nb_frames.as_deref(), duration, fps),
        has_audio,
        duration,
    })
}

pub fn probe(path: &Path, timeout: Duration) -> Result<MediaInfo> {
    let mut cmd = command_for("ffprobe");
    cmd.args([
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
    ])
    .arg(path);

    let output = run_checked(cmd, "ffprobe", timeout)?;
    let info = parse_probe(&output.stdout)
        .with_context(|| format!("failed to probe {}", path.display()))?;
    debug!(path = %path.display(), ?info, "Probed media");
    Ok(info)
}

const EVEN_CROP_FILTER: &str = "crop=trunc(iw/2)*2:trunc(ih/2)*2";

pub fn demux_args(input: &Path, output: &Path) -> Vec<String> {
    vec![
        "-nostdin".into(),
        "-y".into(),
        "-i".into(),
        input.to_string_lossy().into_owned(),
        // 4:2:0 planes need even sides; drop the odd edge row/column.
        "-vf".into(),
        EVEN_CROP_FILTER.into(),
        "-f".into(),
        "yuv4mpegpipe".into(),
        "-pix_fmt".into(),
        "yuv420p".into(),
        output.to_string_lossy().into_owned(),
    ]
}

pub fn demux_to_y4m(input: &Path, output: &Path, timeout: Duration) -> Result<()> {
    info!(input = %input.display(), "Extracting video to Y4M");
    let mut cmd = command_for("ffmpeg");
    cmd.args(demux_args(input, output));
    run_checked(cmd, "ffmpeg", timeout)?;
    Ok(())
}

/// Encode `video` (Y4M) into `output`, taking audio from `original` when asked.
/// A source without audio is fine: the audio map is optional.
pub fn remux_args(
    video: &Path,
    original: Option<&Path>,
    output: &Path,
    options: &EncodeOptions,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-nostdin".into(),
        "-i".into(),
        video.to_string_lossy().into_owned(),
    ];
    let copy_audio = options.copy_audio && original.is_some();
    if let Some(original) = original.filter(|_| copy_audio) {
        args.extend(["-i".into(), original.to_string_lossy().into_owned()]);
    }
    args.extend(["-map".into(), "0:v".into()]);
    if copy_audio {
        args.extend(["-map".into(), "1:a?".into()]);
    }
    args.extend([
        "-c:v".into(),
        options.video_codec.clone(),
        "-crf".into(),
        options.crf.to_string(),
        "-preset".into(),
        options.preset.clone(),
        "-pix_fmt".into(),
        "yuv420p".into(),
    ]);
    if copy_audio {
        args.extend(["-c:a".into(), "copy".into()]);
    }
    args.extend(["-y".into(), output.to_string_lossy().into_owned()]);
    args
}

pub fn remux(
    video: &Path,
    original: Option<&Path>,
    output: &Path,
    options: &EncodeOptions,
    timeout: Duration,
) -> Result<()> {
    let args = remux_args(video, original, output, options);
    info!(output = %output.display(), cmd = %format!("ffmpeg {}", args.join(" ")), "Encoding final video");
    let mut cmd = command_for("ffmpeg");
    cmd.args(args);
    run_checked(cmd, "ffmpeg", timeout)?;
    Ok(())
}

/// ffmpeg decoding `input` to a yuv4mpegpipe on its stdout.
pub struct DemuxPipe {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr_thread: Option<JoinHandle<String>>,
}

pub fn spawn_demux_pipe(input: &Path) -> Result<DemuxPipe> {
    let mut cmd = command_for("ffmpeg");
    cmd.args(demux_args(input, Path::new("pipe:1")));
    debug!("Spawning {:?}", cmd);
    let mut child = spawn_piped(&mut cmd, "ffmpeg")?;
    let stdout = child.stdout.take();
    let stderr_thread = child
        .stderr
        .take()
        .map(|stderr| spawn_stderr_drain(stderr, "ffmpeg".to_string()));
    Ok(DemuxPipe {
        child,
        stdout,
        stderr_thread,
    })
}

impl DemuxPipe {
    pub fn take_stdout(&mut self) -> Result<ChildStdout> {
        self.stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout already taken"))
    }

    /// Wait for ffmpeg to exit once its output has been consumed.
    pub fn finish(mut self, timeout: Duration) -> Result<()> {
        drop(self.stdout.take());
        let status = wait_with_timeout(&mut self.child, "ffmpeg", timeout)?;
        let tail = self
            .stderr_thread
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        if !status.success() {
            return Err(UpscaleError::ExternalProcess {
                program: "ffmpeg".to_string(),
                reason: format!("exited with {status}: {tail}"),
            }
            .into());
        }
        Ok(())
    }

    pub fn kill(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn version_line(binary: &str) -> Option<String> {
    let mut cmd = command_for(binary);
    cmd.arg("-version");
    let output = run_checked(cmd, binary, Duration::from_secs(10)).ok()?;
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()
        .map(|l| l.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_JSON: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264", "width": 640, "height": 360,
             "r_frame_rate": "30000/1001", "avg_frame_rate": "30000/1001", "nb_frames": "300"},
            {"index": 1, "codec_type": "audio", "codec_name": "aac"}
        ],
        "format": {"duration": "10.010000"}
    }"#;

    #[test]
    fn parses_probe_output() {
        let info = parse_probe(PROBE_JSON.as_bytes()).unwrap();
        assert_eq!((info.width, info.height), (640, 360));
        assert!((info.fps - 29.97).abs() < 0.01);
        assert_eq!(info.frame_count, 300);
        assert!(info.has_audio);
        assert!((info.duration - 10.01).abs() < 1e-6);
    }

    #[test]
    fn frame_count_falls_back_to_duration() {
        assert_eq!(estimate_frame_count(None, 10.0, 25.0), 250);
        assert_eq!(estimate_frame_count(Some("N/A"), 2.0, 29.97), 60);
        assert_eq!(estimate_frame_count(Some("0"), 0.0, 30.0), 0);
        assert_eq!(estimate_frame_count(Some("42"), 10.0, 30.0), 42);
    }

    #[test]
    fn probe_without_video_fails() {
        let json = r#"{"streams": [{"codec_type": "audio"}], "format": {}}"#;
        assert!(parse_probe(json.as_bytes()).is_err());
    }

    #[test]
    fn frame_rate_forms() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("24"), Some(24.0));
        assert_eq!(parse_frame_rate("0/0"), None);
    }

    #[test]
    fn demux_writes_yuv420_y4m() {
        let args = demux_args(Path::new("in.mp4"), Path::new("out.y4m"));
        assert_eq!(args[..4], ["-nostdin", "-y", "-i", "in.mp4"]);
        assert!(args.windows(2).any(|w| w == ["-f", "yuv4mpegpipe"]));
        assert!(args.windows(2).any(|w| w == ["-pix_fmt", "yuv420p"]));
        assert!(args.windows(2).any(|w| w == ["-vf", EVEN_CROP_FILTER]));
        assert_eq!(args.last().unwrap(), "out.y4m");
    }

    #[test]
    fn remux_maps_optional_audio() {
        let args = remux_args(
            Path::new("up.y4m"),
            Some(Path::new("orig.mp4")),
            Path::new("out.mp4"),
            &EncodeOptions::default(),
        );
        let joined = args.join(" ");
        assert!(joined.contains("-i up.y4m -i orig.mp4 -map 0:v -map 1:a?"));
        assert!(joined.contains("-c:v libx264 -crf 18 -preset medium -pix_fmt yuv420p"));
        assert!(joined.contains("-c:a copy"));
        assert!(joined.ends_with("-y out.mp4"));
    }

    #[test]
    fn remux_without_audio_copy() {
        let options = EncodeOptions {
            copy_audio: false,
            ..Default::default()
        };
        let args = remux_args(
            Path::new("up.y4m"),
            Some(Path::new("orig.mp4")),
            Path::new("out.mp4"),
            &options,
        );
        assert!(!args.iter().any(|a| a == "orig.mp4" || a == "1:a?" || a == "-c:a"));
    }

    #[test]
    #[ignore]
    fn probe_real_file_requires_ffprobe() {
        let path = std::env::var("UPSCALER_TEST_VIDEO").unwrap();
        let info = probe(Path::new(&path), Duration::from_secs(30)).unwrap();
        assert!(info.width > 0);
    }
}
