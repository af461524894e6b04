use std::collections::BTreeSet;
use std::io::Cursor;
use std::sync::Arc;

use anyhow::Result;
use image::{ImageFormat, Rgb, RgbImage};
use tempfile::tempdir;

use ppe_watch::{
    AlertStatus, DetectionFilter, DetectionService, Page, PpeClass, PpeDetector, RawDetection,
    SqliteDetectionStore, StubBackend, UploadStore, ViolationKind,
};

fn raw(class_id: u32, confidence: f32, bbox: [f32; 4]) -> RawDetection {
    RawDetection {
        class_id,
        confidence,
        bbox,
    }
}

fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    RgbImage::from_pixel(width, height, Rgb([90, 90, 90]))
        .write_to(&mut buf, ImageFormat::Jpeg)
        .expect("encode jpeg");
    buf.into_inner()
}

fn sqlite_service(
    dir: &tempfile::TempDir,
    detections: Vec<RawDetection>,
) -> Result<DetectionService> {
    let store = SqliteDetectionStore::open(&dir.path().join("ppe.db").to_string_lossy())?;
    let uploads = UploadStore::new(dir.path().join("uploads"))?;
    let detector = Arc::new(PpeDetector::with_backend(StubBackend::new(detections), 0.5));
    Ok(DetectionService::new(Box::new(store), detector, uploads))
}

#[test]
fn person_without_hardhat_raises_one_alert() -> Result<()> {
    let dir = tempdir()?;
    let mut service = sqlite_service(
        &dir,
        vec![
            raw(5, 0.8, [10.0, 10.0, 60.0, 110.0]),
            raw(2, 0.8, [20.0, 10.0, 40.0, 30.0]),
        ],
    )?;

    let detection = service.process(&jpeg_bytes(128, 128), "worker.jpg", Some(1), None)?;
    assert_eq!(detection.person_count, 1);
    assert_eq!(detection.violation_count, 1);
    assert!(detection.has_violation);
    assert_eq!(
        detection.violations,
        BTreeSet::from([ViolationKind::NoHardhat])
    );
    assert_eq!(detection.detected_objects[0].class_name, PpeClass::Person);
    assert_eq!(detection.detected_objects[1].confidence, 0.8);

    let alerts = service.alerts_for_detection(detection.id)?;
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert_type, ViolationKind::NoHardhat);
    assert_eq!(alerts[0].status, AlertStatus::New);
    assert_eq!(alerts[0].message, "Detected: no_hardhat");

    let stored = service.get(detection.id)?.expect("detection persisted");
    assert_eq!(stored.detected_objects, detection.detected_objects);
    assert_eq!(stored.violations, detection.violations);
    Ok(())
}

#[test]
fn history_survives_reopening_the_database() -> Result<()> {
    let dir = tempdir()?;
    {
        let mut service = sqlite_service(&dir, vec![raw(5, 0.9, [0.0, 0.0, 30.0, 30.0])])?;
        for i in 0..3 {
            service.process(&jpeg_bytes(32, 32), &format!("frame{i}.jpg"), None, None)?;
        }
    }

    let service = sqlite_service(&dir, vec![])?;
    let (items, total) = service.list(&DetectionFilter::default(), Page::default())?;
    assert_eq!(total, 3);
    assert_eq!(items.len(), 3);
    assert!(items.windows(2).all(|w| w[0].id > w[1].id));

    let stats = service.stats(None)?;
    assert_eq!(stats.total_persons, 3);
    assert_eq!(stats.compliance_rate, 100.0);
    assert_eq!(service.stats(None)?, stats);
    Ok(())
}

#[test]
fn result_image_shows_violation_box() -> Result<()> {
    let dir = tempdir()?;
    let mut service = sqlite_service(&dir, vec![raw(4, 0.95, [20.0, 40.0, 100.0, 120.0])])?;
    let detection = service.process(&jpeg_bytes(128, 128), "vest.jpg", None, None)?;

    let bytes = service.result_image(detection.id)?;
    let annotated = image::load_from_memory(&bytes)?.to_rgb8();
    assert_eq!(annotated.dimensions(), (128, 128));
    // Left edge of the box is drawn in the violation colour (red, JPEG-lossy).
    let pixel = annotated.get_pixel(21, 80);
    assert!(
        pixel[0] > pixel[1].saturating_add(60) && pixel[0] > pixel[2].saturating_add(60),
        "{:?}",
        pixel
    );
    Ok(())
}

#[test]
fn process_image_file_writes_annotated_copy() -> Result<()> {
    let dir = tempdir()?;
    let input = dir.path().join("in.jpg");
    std::fs::write(&input, jpeg_bytes(64, 48))?;
    let output = dir.path().join("out.jpg");

    let detector = PpeDetector::with_backend(
        StubBackend::new(vec![raw(7, 0.7, [5.0, 5.0, 40.0, 40.0])]),
        0.5,
    );
    let result = detector.process_image_file(&input, &output)?;
    assert_eq!(result.detected_objects.len(), 1);
    assert!(!result.has_violation);

    let written = image::open(&output)?;
    assert_eq!((written.width(), written.height()), (64, 48));
    Ok(())
}
