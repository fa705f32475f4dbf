use std::path::Path;

use anyhow::Result;
use tracing::info;

use super::{FileRun, FileState, Pipeline, ProgressTracker};
use crate::imageio::{load_rgb, save_rgb};

impl Pipeline {
    /// Still image in, still image out. Counts as a single frame.
    pub fn process_image(
        &mut self,
        input: &Path,
        output: &Path,
        tracker: &mut ProgressTracker<'_>,
    ) -> Result<u64> {
        let mut run = FileRun::new(input);
        let result = self.image_stages(input, output, tracker, &mut run);
        run.transition(if result.is_ok() {
            FileState::Done
        } else {
            FileState::Failed
        });
        result
    }

    fn image_stages(
        &mut self,
        input: &Path,
        output: &Path,
        tracker: &mut ProgressTracker<'_>,
        run: &mut FileRun,
    ) -> Result<u64> {
        self.check_cancelled()?;
        run.transition(FileState::Processing);
        let image = load_rgb(input)?;
        info!(
            input = %input.display(),
            width = image.width,
            height = image.height,
            "Upscaling image"
        );
        let upscaled = self.upscaler.upscale_image(&image)?;
        save_rgb(&upscaled, output)?;
        tracker.frame_done();
        info!(
            output = %output.display(),
            width = upscaled.width,
            height = upscaled.height,
            "Image written"
        );
        Ok(1)
    }
}
