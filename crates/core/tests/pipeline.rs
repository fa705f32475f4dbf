use std::fs;
use std::sync::{Arc, Mutex};

use tempfile::tempdir;
use tokio_util::sync::CancellationToken;
use upscaler_core::backend::ClassicalBackend;
use upscaler_core::imageio::{load_rgb, save_rgb};
use upscaler_core::pipeline::{
    discover, BatchOptions, MediaFilter, NullProgress, Pipeline, PipelineOptions, ProgressEvent,
    ProgressTracker,
};
use upscaler_core::resize::ResizeFilter;
use upscaler_core::y4m::{Y4mHeader, Y4mReader, Y4mWriter};
use upscaler_core::RgbImage;

fn classical_pipeline(scale: u32) -> Pipeline {
    let options = PipelineOptions {
        scale,
        preserve_tone: false,
        ..Default::default()
    };
    Pipeline::new(
        Box::new(ClassicalBackend::new(scale, ResizeFilter::Nearest)),
        options,
        CancellationToken::new(),
    )
}

#[test]
fn batch_continues_past_a_broken_file() {
    let root = tempdir().unwrap();
    let out = root.path().join("output");
    save_rgb(&RgbImage::filled(6, 4, [200, 10, 10]), &root.path().join("a.png")).unwrap();
    fs::write(root.path().join("b.png"), b"definitely not a png").unwrap();
    save_rgb(&RgbImage::filled(3, 5, [10, 200, 10]), &root.path().join("c.png")).unwrap();
    fs::write(root.path().join("notes.txt"), b"ignored").unwrap();

    let options = BatchOptions {
        root: root.path().to_path_buf(),
        output_dir: out.clone(),
        filter: MediaFilter::Image,
        ..Default::default()
    };
    let mut pipeline = classical_pipeline(2);
    let jobs = pipeline.plan_jobs(discover(&options).unwrap());
    assert_eq!(jobs.len(), 3);

    let events = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&events);
    let mut sink = move |event: &ProgressEvent| recorded.lock().unwrap().push(event.clone());
    let report = pipeline.run_batch(&jobs, &mut sink);

    assert_eq!(report.succeeded.len(), 2);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].0.ends_with("b.png"));
    assert!(!report.cancelled);

    let a = load_rgb(&out.join("a_upscaled.png")).unwrap();
    assert_eq!((a.width, a.height), (12, 8));
    assert_eq!(a.pixel(11, 7), [200, 10, 10]);
    let c = load_rgb(&out.join("c_upscaled.png")).unwrap();
    assert_eq!((c.width, c.height), (6, 10));

    let events = events.lock().unwrap();
    assert_eq!(
        events.first(),
        Some(&ProgressEvent::BatchStarted {
            total_files: 3,
            total_frames: 3,
        })
    );
    match events.last() {
        Some(ProgressEvent::BatchFinished {
            succeeded,
            failed,
            processed_frames,
            total_frames,
        }) => {
            assert_eq!((*succeeded, *failed), (2, 1));
            assert_eq!(processed_frames, total_frames);
        }
        other => panic!("unexpected final event: {other:?}"),
    }
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::FileFailed { .. }))
            .count(),
        1
    );
}

#[test]
fn planar_stream_is_upscaled_frame_by_frame() {
    let header = Y4mHeader::with_fps(8, 6, 24.0);
    let mut writer = Y4mWriter::new(Vec::new(), header).unwrap();
    writer.write_header().unwrap();
    for luma in [16u8, 128, 235] {
        let mut frame = vec![luma; 8 * 6];
        frame.extend(vec![128u8; 2 * 4 * 3]);
        writer.write_frame(&frame).unwrap();
    }
    let input = writer.into_inner().unwrap();

    let mut pipeline = classical_pipeline(2);
    let mut sink = NullProgress;
    let mut tracker = ProgressTracker::new(&[3], &mut sink);
    tracker.start_file("stdin".into(), 3);
    let mut output = Vec::new();
    let frames = pipeline
        .stream_y4m(input.as_slice(), &mut output, &mut tracker)
        .unwrap();
    assert_eq!(frames, 3);
    assert_eq!(tracker.state().processed_frames, 3);

    let mut reader = Y4mReader::new(output.as_slice());
    let out_header = reader.read_header().unwrap();
    assert_eq!((out_header.width, out_header.height), (16, 12));
    assert!((out_header.fps() - 24.0).abs() < 1e-9);

    let lumas: Vec<u8> = reader.map(|frame| frame.unwrap()[0]).collect();
    assert_eq!(lumas.len(), 3);
    for (got, want) in lumas.iter().zip([16u8, 128, 235]) {
        assert!((*got as i16 - want as i16).abs() <= 2, "luma {got} vs {want}");
    }
}

#[test]
fn cancelled_pipeline_starts_nothing() {
    let root = tempdir().unwrap();
    save_rgb(&RgbImage::filled(4, 4, [1, 2, 3]), &root.path().join("a.png")).unwrap();
    let options = BatchOptions {
        root: root.path().to_path_buf(),
        output_dir: root.path().join("output"),
        ..Default::default()
    };

    let mut pipeline = classical_pipeline(2);
    let jobs = pipeline.plan_jobs(discover(&options).unwrap());
    pipeline.cancel_token().cancel();
    let report = pipeline.run_batch(&jobs, &mut NullProgress);

    assert!(report.cancelled);
    assert!(report.succeeded.is_empty());
    assert!(!root.path().join("output").join("a_upscaled.png").exists());
}
