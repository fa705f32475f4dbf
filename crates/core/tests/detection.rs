use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tempfile::tempdir;
use upscaler_core::arch::{ArchKind, ArchParams, ArchitectureDetector, CACHE_FILE_NAME};

fn compact_params(upscale: i64) -> ArchParams {
    let mut params = ArchKind::CompactConvNet.default_params();
    params.insert("num_conv".to_string(), 4);
    params.insert("upscale".to_string(), upscale);
    params
}

/// Header plus zeroed F32 payload, enough for shape-based detection.
fn write_checkpoint(path: &Path, tensors: &BTreeMap<String, Vec<usize>>) {
    let mut header = serde_json::Map::new();
    let mut offset = 0u64;
    for (name, shape) in tensors {
        let bytes = shape.iter().product::<usize>() as u64 * 4;
        header.insert(
            name.clone(),
            serde_json::json!({"dtype": "F32", "shape": shape, "data_offsets": [offset, offset + bytes]}),
        );
        offset += bytes;
    }
    let header = serde_json::to_vec(&serde_json::Value::Object(header)).unwrap();

    let mut file = File::create(path).unwrap();
    file.write_all(&(header.len() as u64).to_le_bytes()).unwrap();
    file.write_all(&header).unwrap();
    file.write_all(&vec![0u8; offset as usize]).unwrap();
}

#[test]
fn detection_is_cached_until_the_checkpoint_changes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tiny-compact.safetensors");
    let kind = ArchKind::CompactConvNet;
    write_checkpoint(&path, &kind.expected_tensors(&compact_params(2)));

    let detector = ArchitectureDetector::new();
    let (first, cached) = detector.detect(&path).unwrap();
    assert!(!cached);
    assert_eq!(first.name, ArchKind::CompactConvNet);
    assert_eq!(first.scale(), 2);
    assert!(first.is_trusted());
    assert!(dir.path().join(CACHE_FILE_NAME).is_file());

    let (second, cached) = detector.detect(&path).unwrap();
    assert!(cached);
    assert_eq!(second, first);

    // A different scale changes the last conv, so the file size changes too.
    write_checkpoint(&path, &kind.expected_tensors(&compact_params(4)));
    let (third, cached) = detector.detect(&path).unwrap();
    assert!(!cached);
    assert_eq!(third.scale(), 4);
}

#[test]
fn touching_a_checkpoint_invalidates_its_cache_entry() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("touched.safetensors");
    write_checkpoint(
        &path,
        &ArchKind::CompactConvNet.expected_tensors(&compact_params(2)),
    );
    let detector = ArchitectureDetector::new();
    assert!(!detector.detect(&path).unwrap().1);
    assert!(detector.detect(&path).unwrap().1);

    // Same bytes, same size; only the modification time moves.
    let before = fs::metadata(&path).unwrap().modified().unwrap();
    File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(120))
        .unwrap();
    assert_ne!(fs::metadata(&path).unwrap().modified().unwrap(), before);

    let (descriptor, cached) = detector.detect(&path).unwrap();
    assert!(!cached);
    assert_eq!(descriptor.scale(), 2);
    assert!(detector.detect(&path).unwrap().1);
}

#[test]
fn uncached_detector_always_reads_the_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("model.safetensors");
    write_checkpoint(
        &path,
        &ArchKind::CompactConvNet.expected_tensors(&compact_params(4)),
    );

    let detector = ArchitectureDetector::without_cache();
    assert!(!detector.detect(&path).unwrap().1);
    assert!(!detector.detect(&path).unwrap().1);
    assert!(!dir.path().join(CACHE_FILE_NAME).exists());
}

#[test]
fn missing_checkpoint_is_an_error() {
    let dir = tempdir().unwrap();
    let err = ArchitectureDetector::new()
        .detect(&dir.path().join("nope.safetensors"))
        .unwrap_err();
    assert!(err.to_string().contains("checkpoint not found"));
}
