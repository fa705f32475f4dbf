use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::{FileRun, FileState, Pipeline, ProgressTracker};
use crate::ffmpeg::{self, spawn_demux_pipe};
use crate::y4m::{Y4mReader, Y4mWriter};

fn is_y4m(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("y4m"))
        .unwrap_or(false)
}

impl Pipeline {
    /// Upscale every frame of a Y4M stream into `writer`. Returns the frame count.
    pub fn stream_y4m<R: Read, W: Write>(
        &mut self,
        reader: R,
        writer: W,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<u64> {
        let mut reader = Y4mReader::new(reader);
        let header = reader.read_header()?;
        let (out_w, out_h) = self.upscaler.output_dims(header.width, header.height);
        let out_header = header.scaled(self.upscaler.target_scale() as usize);
        debug_assert_eq!((out_header.width, out_header.height), (out_w, out_h));
        info!(
            width = header.width,
            height = header.height,
            out_width = out_w,
            out_height = out_h,
            fps = header.fps(),
            "Processing planar stream"
        );

        let mut writer = Y4mWriter::new(writer, out_header)?;
        writer.write_header()?;

        let mut frames = 0u64;
        loop {
            self.check_cancelled()?;
            let Some(frame) = reader.read_frame()? else {
                break;
            };
            let upscaled = self
                .upscaler
                .upscale_planar(&frame, header.width, header.height)
                .with_context(|| format!("frame {}", frames + 1))?;
            writer.write_frame(&upscaled)?;
            frames += 1;
            tracker.frame_done();
            if frames % 100 == 0 {
                debug!(frames, "Frames processed");
            }
        }
        writer.flush()?;
        info!(frames, "Stream processing completed");
        Ok(frames)
    }

    /// Demux to a temp Y4M, upscale it into a second temp Y4M, then encode
    /// with the original's audio. A `.y4m` output skips the encode.
    pub fn process_video_file(
        &mut self,
        input: &Path,
        output: &Path,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<u64> {
        let mut run = FileRun::new(input);
        let result = self.video_file_stages(input, output, tracker, &mut run);
        run.transition(if result.is_ok() {
            FileState::Done
        } else {
            FileState::Failed
        });
        result
    }

    fn video_file_stages(
        &mut self,
        input: &Path,
        output: &Path,
        tracker: &mut ProgressTracker<'_>,
        run: &mut FileRun,
    ) -> Result<u64> {
        self.check_cancelled()?;
        let staging = tempfile::Builder::new()
            .prefix("upscaler_video_")
            .tempdir()
            .context("Failed to create staging directory")?;
        let demuxed = staging.path().join("input.y4m");
        let upscaled = if is_y4m(output) {
            output.to_path_buf()
        } else {
            staging.path().join("output.y4m")
        };

        run.transition(FileState::Demuxing);
        ffmpeg::demux_to_y4m(input, &demuxed, self.options.demux_timeout)?;

        run.transition(FileState::Processing);
        let reader = BufReader::new(
            File::open(&demuxed).with_context(|| format!("Cannot open {}", demuxed.display()))?,
        );
        let writer = BufWriter::new(
            File::create(&upscaled)
                .with_context(|| format!("Cannot create {}", upscaled.display()))?,
        );
        let frames = self.stream_y4m(reader, writer, tracker)?;

        if !is_y4m(output) {
            run.transition(FileState::Remuxing);
            self.check_cancelled()?;
            ffmpeg::remux(
                &upscaled,
                Some(input),
                output,
                &self.options.encode,
                self.options.remux_timeout,
            )?;
        }
        info!(output = %output.display(), frames, "Video written");
        Ok(frames)
    }

    /// Y4M from standard input. The output is written raw when it is `.y4m`,
    /// else encoded without audio.
    pub fn process_stdin(&mut self, output: &Path, tracker: &mut ProgressTracker<'_>) -> Result<u64> {
        let mut run = FileRun::new(Path::new("-"));
        run.transition(FileState::Processing);
        let result = self.stdin_stages(output, tracker, &mut run);
        run.transition(if result.is_ok() {
            FileState::Done
        } else {
            FileState::Failed
        });
        result
    }

    fn stdin_stages(
        &mut self,
        output: &Path,
        tracker: &mut ProgressTracker<'_>,
        run: &mut FileRun,
    ) -> Result<u64> {
        let stdin = io::stdin();
        let reader = stdin.lock();
        if is_y4m(output) {
            let writer = BufWriter::new(
                File::create(output).with_context(|| format!("Cannot create {}", output.display()))?,
            );
            return self.stream_y4m(reader, writer, tracker);
        }

        let staging = tempfile::Builder::new()
            .prefix("upscaler_stdin_")
            .tempdir()
            .context("Failed to create staging directory")?;
        let upscaled = staging.path().join("output.y4m");
        let writer = BufWriter::new(File::create(&upscaled)?);
        let frames = self.stream_y4m(reader, writer, tracker)?;

        run.transition(FileState::Remuxing);
        ffmpeg::remux(
            &upscaled,
            None,
            output,
            &self.options.encode,
            self.options.remux_timeout,
        )?;
        Ok(frames)
    }

    /// Decode `input` with ffmpeg and write the upscaled Y4M to standard output.
    pub fn process_to_stdout(&mut self, input: &Path, tracker: &mut ProgressTracker<'_>) -> Result<u64> {
        let mut run = FileRun::new(input);
        run.transition(FileState::Demuxing);
        let mut pipe = spawn_demux_pipe(input)?;
        let stdout_pipe = pipe.take_stdout()?;

        run.transition(FileState::Processing);
        let stdout = io::stdout();
        let result = self.stream_y4m(BufReader::new(stdout_pipe), stdout.lock(), tracker);
        match result {
            Ok(frames) => {
                pipe.finish(self.options.demux_timeout)?;
                run.transition(FileState::Done);
                Ok(frames)
            }
            Err(err) => {
                warn!("Streaming to stdout failed, stopping ffmpeg");
                pipe.kill();
                run.transition(FileState::Failed);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::fake_pipeline;
    use crate::pipeline::{NullProgress, PipelineOptions};
    use crate::y4m::Y4mHeader;

    fn y4m_stream(width: usize, height: usize, frames: usize) -> Vec<u8> {
        let mut writer = Y4mWriter::new(Vec::new(), Y4mHeader::with_fps(width, height, 25.0)).unwrap();
        writer.write_header().unwrap();
        for i in 0..frames {
            let mut frame = vec![(i * 20) as u8; width * height];
            frame.extend(vec![128u8; width * height / 2]);
            writer.write_frame(&frame).unwrap();
        }
        writer.into_inner().unwrap()
    }

    #[test]
    fn stream_upscales_every_frame() {
        let input = y4m_stream(8, 6, 3);
        let mut pipeline = fake_pipeline(2, PipelineOptions {
            scale: 2,
            ..Default::default()
        });
        let mut sink = NullProgress;
        let mut tracker = ProgressTracker::new(&[3], &mut sink);
        tracker.start_file("in.y4m".into(), 3);

        let mut out = Vec::new();
        let frames = pipeline.stream_y4m(&input[..], &mut out, &mut tracker).unwrap();
        assert_eq!(frames, 3);
        assert_eq!(tracker.state().processed_frames, 3);

        let mut reader = Y4mReader::new(&out[..]);
        let header = reader.read_header().unwrap();
        assert_eq!((header.width, header.height), (16, 12));
        assert_eq!((header.fps_num, header.fps_den), (25, 1));
        let decoded: Vec<Vec<u8>> = reader.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(decoded.len(), 3);
        assert!(decoded.iter().all(|f| f.len() == 16 * 12 * 3 / 2));
        assert!(decoded[2][..16 * 12].iter().all(|&y| y == 40));
    }

    #[test]
    fn truncated_stream_keeps_complete_frames() {
        let mut input = y4m_stream(4, 4, 2);
        input.truncate(input.len() - 5);
        let mut pipeline = fake_pipeline(2, PipelineOptions {
            scale: 2,
            ..Default::default()
        });
        let mut sink = NullProgress;
        let mut tracker = ProgressTracker::new(&[2], &mut sink);
        let mut out = Vec::new();
        assert_eq!(pipeline.stream_y4m(&input[..], &mut out, &mut tracker).unwrap(), 1);
    }

    #[test]
    fn cancel_stops_at_frame_boundary() {
        let input = y4m_stream(4, 4, 2);
        let mut pipeline = fake_pipeline(2, PipelineOptions::default());
        pipeline.cancel_token().cancel();
        let mut sink = NullProgress;
        let mut tracker = ProgressTracker::new(&[2], &mut sink);
        let err = pipeline
            .stream_y4m(&input[..], Vec::new(), &mut tracker)
            .unwrap_err();
        assert!(crate::error::is_cancelled(&err));
    }

    #[test]
    fn bad_header_is_a_format_error() {
        let mut pipeline = fake_pipeline(2, PipelineOptions::default());
        let mut sink = NullProgress;
        let mut tracker = ProgressTracker::new(&[1], &mut sink);
        let err = pipeline
            .stream_y4m(&b"NOTY4M W4 H4 F25:1\n"[..], Vec::new(), &mut tracker)
            .unwrap_err();
        assert!(matches!(
            crate::error::find_upscale_error(&err),
            Some(crate::error::UpscaleError::Format(_))
        ));
    }
}
