use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::detect::DEFAULT_CONFIDENCE_THRESHOLD;

const DEFAULT_DB_PATH: &str = "ppe.db";
const DEFAULT_UPLOAD_DIR: &str = "./uploads";
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;
const DEFAULT_API_ADDR: &str = "127.0.0.1:8800";
const DEFAULT_BACKEND: &str = "tract";
const DEFAULT_MODEL_PATH: &str = "./models/ppe_yolov8n.onnx";
const DEFAULT_IOU_THRESHOLD: f32 = 0.7;
const DEFAULT_INPUT_SIZE: u32 = 640;

const KNOWN_BACKENDS: &[&str] = &["tract", "none"];

#[derive(Debug, Deserialize, Default)]
struct PpeConfigFile {
    db_path: Option<String>,
    upload_dir: Option<PathBuf>,
    max_upload_bytes: Option<u64>,
    api: Option<ApiConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    token_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<String>,
    confidence_threshold: Option<f32>,
    iou_threshold: Option<f32>,
    input_size: Option<u32>,
    font_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PpeConfig {
    pub db_path: String,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: u64,
    pub api_addr: String,
    pub api_token_path: Option<PathBuf>,
    pub detector: DetectorSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorSettings {
    /// `tract` or `none`.
    pub backend: String,
    pub model_path: String,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Square model input side, in pixels.
    pub input_size: u32,
    pub font_path: Option<PathBuf>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            model_path: DEFAULT_MODEL_PATH.to_string(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            input_size: DEFAULT_INPUT_SIZE,
            font_path: None,
        }
    }
}

impl PpeConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("PPE_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: PpeConfigFile) -> Self {
        let defaults = DetectorSettings::default();
        let detector = match file.detector {
            Some(detector) => DetectorSettings {
                backend: detector.backend.unwrap_or(defaults.backend),
                model_path: detector.model_path.unwrap_or(defaults.model_path),
                confidence_threshold: detector
                    .confidence_threshold
                    .unwrap_or(defaults.confidence_threshold),
                iou_threshold: detector.iou_threshold.unwrap_or(defaults.iou_threshold),
                input_size: detector.input_size.unwrap_or(defaults.input_size),
                font_path: detector.font_path,
            },
            None => defaults,
        };
        let api = file.api.unwrap_or_default();
        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            upload_dir: file
                .upload_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR)),
            max_upload_bytes: file.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            api_addr: api.addr.unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            api_token_path: api.token_path,
            detector,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = non_empty_env("PPE_DB_PATH") {
            self.db_path = path;
        }
        if let Some(dir) = non_empty_env("PPE_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(dir);
        }
        if let Some(addr) = non_empty_env("PPE_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(path) = non_empty_env("PPE_API_TOKEN_PATH") {
            self.api_token_path = Some(PathBuf::from(path));
        }
        if let Some(path) = non_empty_env("PPE_MODEL_PATH") {
            self.detector.model_path = path;
        }
        if let Some(backend) = non_empty_env("PPE_DETECTOR_BACKEND") {
            self.detector.backend = backend;
        }
        if let Some(path) = non_empty_env("PPE_FONT_PATH") {
            self.detector.font_path = Some(PathBuf::from(path));
        }
        if let Some(threshold) = non_empty_env("PPE_CONFIDENCE_THRESHOLD") {
            self.detector.confidence_threshold = threshold.trim().parse().map_err(|_| {
                anyhow!("PPE_CONFIDENCE_THRESHOLD must be a number between 0 and 1")
            })?;
        }
        if let Some(limit) = non_empty_env("PPE_MAX_UPLOAD_BYTES") {
            self.max_upload_bytes = limit
                .trim()
                .parse()
                .map_err(|_| anyhow!("PPE_MAX_UPLOAD_BYTES must be an integer number of bytes"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        self.detector.backend = self.detector.backend.trim().to_lowercase();
        if !KNOWN_BACKENDS.contains(&self.detector.backend.as_str()) {
            return Err(anyhow!(
                "unknown detector backend '{}' (expected one of: {})",
                self.detector.backend,
                KNOWN_BACKENDS.join(", ")
            ));
        }
        validate_unit_interval("confidence_threshold", self.detector.confidence_threshold)?;
        validate_unit_interval("iou_threshold", self.detector.iou_threshold)?;
        if self.detector.input_size == 0 || self.detector.input_size % 32 != 0 {
            return Err(anyhow!(
                "input_size must be a positive multiple of 32, got {}",
                self.detector.input_size
            ));
        }
        if self.max_upload_bytes == 0 {
            return Err(anyhow!("max_upload_bytes must be greater than zero"));
        }
        Ok(())
    }
}

fn validate_unit_interval(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
    }
    Ok(())
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<PpeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = PpeConfig::from_file(PpeConfigFile::default());
        assert_eq!(cfg.db_path, "ppe.db");
        assert_eq!(cfg.upload_dir, PathBuf::from("./uploads"));
        assert_eq!(cfg.max_upload_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.api_addr, "127.0.0.1:8800");
        assert_eq!(cfg.detector, DetectorSettings::default());
    }

    #[test]
    fn partial_detector_section_keeps_other_defaults() {
        let file: PpeConfigFile =
            serde_json::from_str(r#"{"detector": {"confidence_threshold": 0.35}}"#).unwrap();
        let cfg = PpeConfig::from_file(file);
        assert_eq!(cfg.detector.confidence_threshold, 0.35);
        assert_eq!(cfg.detector.iou_threshold, 0.7);
        assert_eq!(cfg.detector.input_size, 640);
        assert_eq!(cfg.detector.backend, "tract");
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut cfg = PpeConfig::from_file(PpeConfigFile::default());
        cfg.detector.confidence_threshold = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = PpeConfig::from_file(PpeConfigFile::default());
        cfg.detector.input_size = 500;
        assert!(cfg.validate().is_err());

        let mut cfg = PpeConfig::from_file(PpeConfigFile::default());
        cfg.max_upload_bytes = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PpeConfig::from_file(PpeConfigFile::default());
        cfg.detector.backend = "opencv".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_normalizes_backend_name() {
        let mut cfg = PpeConfig::from_file(PpeConfigFile::default());
        cfg.detector.backend = " None ".to_string();
        cfg.validate().unwrap();
        assert_eq!(cfg.detector.backend, "none");
    }
}
