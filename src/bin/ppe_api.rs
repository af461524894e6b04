//! ppe_api - HTTP service for PPE detection
//!
//! This daemon:
//! 1. Loads configuration and the detection model (once)
//! 2. Opens the detection database and upload directory
//! 3. Serves the detection API until Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::{mpsc, Arc};

use ppe_watch::{
    api::{ApiConfig, ApiServer},
    DetectionService, PpeConfig, PpeDetector, SqliteDetectionStore, UploadStore,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = PpeConfig::load()?;
    let detector = Arc::new(PpeDetector::load(&config.detector));
    if !detector.has_model() {
        log::warn!("no detection model loaded; uploads will produce empty detections");
    }
    let store = SqliteDetectionStore::open(&config.db_path)?;
    let uploads = UploadStore::new(&config.upload_dir)?;
    let service = DetectionService::new(Box::new(store), detector, uploads);

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
        token_path: config.api_token_path.clone(),
        max_upload_bytes: config.max_upload_bytes,
    };
    let api_handle = ApiServer::new(api_config, service).spawn()?;
    log::info!("detection api listening on {}", api_handle.addr);
    if let Some(path) = &api_handle.token_path {
        log::info!("detection api capability token written to {}", path.display());
    } else {
        log::warn!(
            "detection api capability token (handle securely): {}",
            api_handle.token
        );
    }
    log::info!(
        "ppe_api running. database {}, uploads in {}",
        config.db_path,
        config.upload_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("ppe_api waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping API server...");
    api_handle.stop()?;

    Ok(())
}
