//! ppe_detect - run the detection pipeline on a local image

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use ppe_watch::{
    DetectionService, DetectorSettings, PpeDetector, SqliteDetectionStore, UploadStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Image file to analyse.
    image: PathBuf,
    /// Path to the detection database.
    #[arg(long, env = "PPE_DB_PATH", default_value = "ppe.db")]
    db_path: String,
    /// Directory for stored originals and annotated results.
    #[arg(long, env = "PPE_UPLOAD_DIR", default_value = "./uploads")]
    upload_dir: PathBuf,
    /// ONNX model file.
    #[arg(long, env = "PPE_MODEL_PATH", default_value = "./models/ppe_yolov8n.onnx")]
    model_path: String,
    /// Detector backend (tract|none).
    #[arg(long, env = "PPE_DETECTOR_BACKEND", default_value = "tract")]
    backend: String,
    /// Minimum confidence for a detection to be kept.
    #[arg(long, env = "PPE_CONFIDENCE_THRESHOLD", default_value_t = 0.5)]
    confidence_threshold: f32,
    /// TrueType font used for label text.
    #[arg(long, env = "PPE_FONT_PATH")]
    font_path: Option<PathBuf>,
    /// Zone the image was taken in.
    #[arg(long)]
    zone_id: Option<i64>,
    /// User recorded as the uploader.
    #[arg(long)]
    user_id: Option<i64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if !(0.0..=1.0).contains(&args.confidence_threshold) {
        return Err(anyhow!("confidence threshold must be within [0, 1]"));
    }

    let settings = DetectorSettings {
        backend: args.backend.trim().to_lowercase(),
        model_path: args.model_path,
        confidence_threshold: args.confidence_threshold,
        font_path: args.font_path,
        ..DetectorSettings::default()
    };
    let detector = Arc::new(PpeDetector::load(&settings));
    let store = SqliteDetectionStore::open(&args.db_path)?;
    let uploads = UploadStore::new(&args.upload_dir)?;
    let mut service = DetectionService::new(Box::new(store), detector, uploads);

    let bytes = std::fs::read(&args.image)
        .with_context(|| format!("failed to read image {}", args.image.display()))?;
    let filename = args
        .image
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let detection = service.process(&bytes, &filename, args.user_id, args.zone_id)?;
    let alerts = service.alerts_for_detection(detection.id)?;

    let output = serde_json::json!({
        "detection": detection,
        "alerts": alerts,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
