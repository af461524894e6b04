use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use ppe_watch::config::PpeConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "PPE_CONFIG",
        "PPE_DB_PATH",
        "PPE_UPLOAD_DIR",
        "PPE_API_ADDR",
        "PPE_API_TOKEN_PATH",
        "PPE_MODEL_PATH",
        "PPE_CONFIDENCE_THRESHOLD",
        "PPE_DETECTOR_BACKEND",
        "PPE_FONT_PATH",
        "PPE_MAX_UPLOAD_BYTES",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let token_path = file.path().with_extension("token");
    let json = format!(
        r#"{{
            "db_path": "ppe_prod.db",
            "upload_dir": "/var/lib/ppe/uploads",
            "max_upload_bytes": 2097152,
            "api": {{
                "addr": "127.0.0.1:9000",
                "token_path": "{}"
            }},
            "detector": {{
                "backend": "tract",
                "model_path": "/opt/models/ppe.onnx",
                "confidence_threshold": 0.4,
                "iou_threshold": 0.45,
                "input_size": 320
            }}
        }}"#,
        token_path.display()
    );
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("PPE_CONFIG", file.path());
    std::env::set_var("PPE_CONFIDENCE_THRESHOLD", "0.65");
    std::env::set_var("PPE_DETECTOR_BACKEND", "none");

    let cfg = PpeConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "ppe_prod.db");
    assert_eq!(cfg.upload_dir, PathBuf::from("/var/lib/ppe/uploads"));
    assert_eq!(cfg.max_upload_bytes, 2 * 1024 * 1024);
    assert_eq!(cfg.api_addr, "127.0.0.1:9000");
    assert_eq!(cfg.api_token_path.unwrap(), token_path);
    assert_eq!(cfg.detector.model_path, "/opt/models/ppe.onnx");
    assert_eq!(cfg.detector.confidence_threshold, 0.65);
    assert_eq!(cfg.detector.iou_threshold, 0.45);
    assert_eq!(cfg.detector.input_size, 320);
    assert_eq!(cfg.detector.backend, "none");

    clear_env();
}

#[test]
fn defaults_apply_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PpeConfig::load().expect("load defaults");
    assert_eq!(cfg.db_path, "ppe.db");
    assert_eq!(cfg.api_addr, "127.0.0.1:8800");
    assert_eq!(cfg.max_upload_bytes, 10 * 1024 * 1024);
    assert_eq!(cfg.detector.confidence_threshold, 0.5);
    assert!(cfg.api_token_path.is_none());

    clear_env();
}

#[test]
fn rejects_invalid_env_threshold() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PPE_CONFIDENCE_THRESHOLD", "high");
    assert!(PpeConfig::load().is_err());

    std::env::set_var("PPE_CONFIDENCE_THRESHOLD", "1.2");
    assert!(PpeConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_unknown_backend_and_bad_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("PPE_DETECTOR_BACKEND", "cuda");
    assert!(PpeConfig::load().is_err());
    std::env::remove_var("PPE_DETECTOR_BACKEND");

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"{ not json").expect("write config");
    std::env::set_var("PPE_CONFIG", file.path());
    let err = PpeConfig::load().unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
