//! One progress counter across every file of a batch.
//!
//! Totals are fixed before the first file starts. Each file contributes
//! exactly its expected frame count to the processed counter, whether it
//! succeeds, fails part way, or produces more frames than probed.

use std::path::PathBuf;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    BatchStarted {
        total_files: usize,
        total_frames: u64,
    },
    FileStarted {
        index: usize,
        total_files: usize,
        path: PathBuf,
        frames: u64,
    },
    FrameDone {
        /// Frames finished in the current file, uncapped.
        file_frames: u64,
        processed_frames: u64,
        total_frames: u64,
    },
    FileFinished {
        index: usize,
        path: PathBuf,
        output: PathBuf,
        processed_frames: u64,
    },
    FileFailed {
        index: usize,
        path: PathBuf,
        error: String,
        processed_frames: u64,
    },
    BatchFinished {
        succeeded: usize,
        failed: usize,
        processed_frames: u64,
        total_frames: u64,
    },
}

pub trait ProgressSink: Send {
    fn on_event(&mut self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: FnMut(&ProgressEvent) + Send,
{
    fn on_event(&mut self, event: &ProgressEvent) {
        self(event)
    }
}

pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn on_event(&mut self, _event: &ProgressEvent) {}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgressState {
    pub processed_frames: u64,
    pub total_frames: u64,
    pub current_file_index: usize,
    pub total_files: usize,
}

pub struct ProgressTracker<'a> {
    state: BatchProgressState,
    file_expected: u64,
    file_done: u64,
    file_path: PathBuf,
    sink: &'a mut dyn ProgressSink,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(frame_counts: &[u64], sink: &'a mut dyn ProgressSink) -> Self {
        let state = BatchProgressState {
            processed_frames: 0,
            total_frames: frame_counts.iter().sum(),
            current_file_index: 0,
            total_files: frame_counts.len(),
        };
        sink.on_event(&ProgressEvent::BatchStarted {
            total_files: state.total_files,
            total_frames: state.total_frames,
        });
        Self {
            state,
            file_expected: 0,
            file_done: 0,
            file_path: PathBuf::new(),
            sink,
        }
    }

    pub fn state(&self) -> BatchProgressState {
        self.state
    }

    pub fn start_file(&mut self, path: PathBuf, frames: u64) {
        self.state.current_file_index += 1;
        self.file_expected = frames;
        self.file_done = 0;
        self.file_path = path.clone();
        self.sink.on_event(&ProgressEvent::FileStarted {
            index: self.state.current_file_index,
            total_files: self.state.total_files,
            path,
            frames,
        });
    }

    pub fn frame_done(&mut self) {
        self.file_done += 1;
        if self.file_done <= self.file_expected {
            self.state.processed_frames += 1;
        }
        self.sink.on_event(&ProgressEvent::FrameDone {
            file_frames: self.file_done,
            processed_frames: self.state.processed_frames,
            total_frames: self.state.total_frames,
        });
    }

    /// Credit whatever part of the current file's expected count is still owed.
    fn settle_file(&mut self) {
        let credited = self.file_done.min(self.file_expected);
        self.state.processed_frames += self.file_expected - credited;
        self.file_done = self.file_expected.max(self.file_done);
    }

    pub fn finish_file(&mut self, output: PathBuf) {
        self.settle_file();
        self.sink.on_event(&ProgressEvent::FileFinished {
            index: self.state.current_file_index,
            path: self.file_path.clone(),
            output,
            processed_frames: self.state.processed_frames,
        });
    }

    pub fn fail_file(&mut self, error: &anyhow::Error) {
        self.settle_file();
        self.sink.on_event(&ProgressEvent::FileFailed {
            index: self.state.current_file_index,
            path: self.file_path.clone(),
            error: format!("{error:#}"),
            processed_frames: self.state.processed_frames,
        });
    }

    pub fn finish_batch(&mut self, succeeded: usize, failed: usize) {
        self.sink.on_event(&ProgressEvent::BatchFinished {
            succeeded,
            failed,
            processed_frames: self.state.processed_frames,
            total_frames: self.state.total_frames,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_and_overruns_settle_to_the_total() {
        let mut events = Vec::new();
        let mut sink = |e: &ProgressEvent| events.push(e.clone());
        let counts = [10, 1, 5];
        let mut tracker = ProgressTracker::new(&counts, &mut sink);

        tracker.start_file("a.mp4".into(), 10);
        for _ in 0..3 {
            tracker.frame_done();
        }
        tracker.fail_file(&anyhow::anyhow!("remux failed"));
        assert_eq!(tracker.state().processed_frames, 10);

        tracker.start_file("b.png".into(), 1);
        tracker.frame_done();
        tracker.finish_file("b_upscaled.png".into());

        tracker.start_file("c.mp4".into(), 5);
        for _ in 0..7 {
            tracker.frame_done();
        }
        tracker.finish_file("c_upscaled.mp4".into());
        tracker.finish_batch(2, 1);

        let state = tracker.state();
        assert_eq!(state.processed_frames, 16);
        assert_eq!(state.total_frames, 16);
        assert_eq!(state.current_file_index, 3);
        drop(tracker);

        let processed: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::FrameDone { processed_frames, .. } => Some(*processed_frames),
                _ => None,
            })
            .collect();
        assert!(processed.windows(2).all(|w| w[0] <= w[1]));
        assert!(matches!(events.last(), Some(ProgressEvent::BatchFinished { failed: 1, .. })));
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_string(&ProgressEvent::BatchStarted {
            total_files: 2,
            total_frames: 11,
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"batch_started","total_files":2,"total_frames":11}"#);
    }
}
