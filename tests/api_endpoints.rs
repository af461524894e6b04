use anyhow::Result;
use serde_json::Value;
use std::io::{Cursor, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use tempfile::tempdir;

use image::{ImageFormat, RgbImage};
use ppe_watch::api::{ApiConfig, ApiHandle, ApiServer};
use ppe_watch::{
    DetectionService, PpeDetector, RawDetection, SqliteDetectionStore, StubBackend, UploadStore,
};

fn raw(class_id: u32, confidence: f32) -> RawDetection {
    RawDetection {
        class_id,
        confidence,
        bbox: [10.0, 12.0, 50.0, 60.0],
    }
}

fn png_bytes() -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    RgbImage::new(64, 64)
        .write_to(&mut buf, ImageFormat::Png)
        .expect("encode png");
    buf.into_inner()
}

struct HttpResponse {
    headers: String,
    body: Vec<u8>,
}

impl HttpResponse {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("json response body")
    }
}

fn read_response(stream: &mut TcpStream) -> Result<HttpResponse> {
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .unwrap_or(response.len());
    let headers = String::from_utf8_lossy(&response[..split]).to_string();
    let body = response.get(split + 4..).unwrap_or_default().to_vec();
    Ok(HttpResponse { headers, body })
}

struct TestApi {
    _dir: tempfile::TempDir,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(detections: Vec<RawDetection>) -> Result<Self> {
        Self::with_limit(detections, 10 * 1024 * 1024)
    }

    fn with_limit(detections: Vec<RawDetection>, max_upload_bytes: u64) -> Result<Self> {
        let dir = tempdir()?;
        let db_path = dir.path().join("ppe.db");
        let store = SqliteDetectionStore::open(&db_path.to_string_lossy())?;
        let uploads = UploadStore::new(dir.path().join("uploads"))?;
        let detector = Arc::new(PpeDetector::with_backend(StubBackend::new(detections), 0.5));
        let service = DetectionService::new(Box::new(store), detector, uploads);

        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            max_upload_bytes,
            ..ApiConfig::default()
        };
        let api_handle = ApiServer::new(api_config, service).spawn()?;

        Ok(Self {
            _dir: dir,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn send(
        &self,
        method: &str,
        path: &str,
        token: Option<&str>,
        content_type: Option<&str>,
        body: &[u8],
    ) -> Result<HttpResponse> {
        let mut stream = TcpStream::connect(self.handle().addr)?;
        let mut request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n");
        if let Some(token) = token {
            request.push_str(&format!("Authorization: Bearer {token}\r\n"));
        }
        if let Some(content_type) = content_type {
            request.push_str(&format!("Content-Type: {content_type}\r\n"));
        }
        if !body.is_empty() {
            request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes())?;
        stream.write_all(body)?;
        read_response(&mut stream)
    }

    fn get(&self, path: &str) -> Result<HttpResponse> {
        let token = self.handle().token.clone();
        self.send("GET", path, Some(&token), None, b"")
    }

    fn send_json(&self, method: &str, path: &str, body: Value) -> Result<HttpResponse> {
        let token = self.handle().token.clone();
        let body = serde_json::to_vec(&body)?;
        self.send(method, path, Some(&token), Some("application/json"), &body)
    }

    fn upload(&self, query: &str, bytes: &[u8]) -> Result<HttpResponse> {
        let token = self.handle().token.clone();
        let path = format!("/api/v1/detections{query}");
        self.send("POST", &path, Some(&token), Some("image/png"), bytes)
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

#[test]
fn health_endpoint_is_public() -> Result<()> {
    let api = TestApi::new(vec![])?;
    let response = api.send("GET", "/health", None, None, b"")?;
    assert!(response.headers.contains("200 OK"));
    let value = response.json();
    assert_eq!(value["status"], "ok");
    assert_eq!(value["model_loaded"], true);
    Ok(())
}

#[test]
fn api_rejects_missing_and_invalid_tokens() -> Result<()> {
    let api = TestApi::new(vec![])?;

    let response = api.send("GET", "/api/v1/detections", None, None, b"")?;
    assert!(response.headers.contains("401 Unauthorized"));
    assert_eq!(response.json()["error"], "missing_token");

    let response = api.send("GET", "/api/v1/detections", Some(&"ab".repeat(32)), None, b"")?;
    assert!(response.headers.contains("401 Unauthorized"));
    assert_eq!(response.json()["error"], "invalid_token");

    let token = api.handle().token.clone();
    let response = api.send(
        "GET",
        &format!("/api/v1/detections?token={token}"),
        None,
        None,
        b"",
    )?;
    assert!(response.headers.contains("400 Bad Request"));
    Ok(())
}

#[test]
fn upload_produces_detection_alerts_and_annotated_image() -> Result<()> {
    let api = TestApi::new(vec![raw(5, 0.8), raw(2, 0.8)])?;

    let response = api.upload("?filename=gate.png&user_id=4", &png_bytes())?;
    assert!(response.headers.contains("201 Created"));
    let detection = response.json();
    assert_eq!(detection["person_count"], 1);
    assert_eq!(detection["violation_count"], 1);
    assert_eq!(detection["has_violation"], true);
    assert_eq!(detection["violations"], serde_json::json!(["no_hardhat"]));
    assert_eq!(detection["user_id"], 4);
    assert_eq!(detection["detected_objects"][1]["class_name"], "no_hardhat");
    let id = detection["id"].as_i64().expect("detection id");

    let response = api.get(&format!("/api/v1/detections/{id}/alerts"))?;
    assert!(response.headers.contains("200 OK"));
    let alerts = response.json();
    assert_eq!(alerts.as_array().map(Vec::len), Some(1));
    assert_eq!(alerts[0]["alert_type"], "no_hardhat");
    assert_eq!(alerts[0]["status"], "new");

    let response = api.get(&format!("/api/v1/detections/{id}/image/result"))?;
    assert!(response.headers.contains("200 OK"));
    assert!(response.headers.contains("Content-Type: image/jpeg"));
    assert_eq!(image::guess_format(&response.body)?, ImageFormat::Jpeg);

    let response = api.get("/api/v1/detections?page=1&per_page=10")?;
    let page = response.json();
    assert_eq!(page["total"], 1);
    assert_eq!(page["total_pages"], 1);
    assert_eq!(page["items"][0]["id"], id);

    let stats = api.get("/api/v1/detections/stats")?.json();
    assert_eq!(stats["total_detections"], 1);
    assert_eq!(stats["total_persons"], 1);
    assert_eq!(stats["compliance_rate"], 0.0);
    assert_eq!(stats["violation_by_type"]["no_hardhat"], 1);
    Ok(())
}

#[test]
fn upload_validation_statuses() -> Result<()> {
    let api = TestApi::with_limit(vec![raw(5, 0.9)], 1024)?;
    let token = api.handle().token.clone();

    let response = api.send(
        "POST",
        "/api/v1/detections",
        Some(&token),
        Some("text/plain"),
        b"hello",
    )?;
    assert!(response.headers.contains("415 Unsupported Media Type"));

    let response = api.upload("", b"definitely not an image")?;
    assert!(response.headers.contains("400 Bad Request"));

    // Headers alone announce a body over the limit.
    let mut stream = TcpStream::connect(api.handle().addr)?;
    let request = format!(
        "POST /api/v1/detections HTTP/1.1\r\nHost: localhost\r\nAuthorization: Bearer {token}\r\nContent-Type: image/png\r\nContent-Length: 4096\r\n\r\n"
    );
    stream.write_all(request.as_bytes())?;
    let response = read_response(&mut stream)?;
    assert!(response.headers.contains("413 Payload Too Large"));

    let response = api.upload("?zone_id=77", &png_bytes())?;
    assert!(response.headers.contains("404 Not Found"));
    Ok(())
}

#[test]
fn rejected_requests_with_bodies_still_get_a_status() -> Result<()> {
    let api = TestApi::with_limit(vec![], 1024)?;
    let oversized = vec![0x5a_u8; 256 * 1024];

    for _ in 0..5 {
        let response = api.upload("?filename=big.png", &oversized)?;
        assert!(response.headers.contains("413 Payload Too Large"));
        assert_eq!(response.json()["error"], "payload_too_large");
    }

    let response = api.send(
        "POST",
        "/api/v1/detections",
        None,
        Some("image/png"),
        &oversized,
    )?;
    assert!(response.headers.contains("401 Unauthorized"));

    let page = api.get("/api/v1/detections")?.json();
    assert_eq!(page["total"], 0);
    Ok(())
}

#[test]
fn alert_lifecycle_over_http() -> Result<()> {
    let api = TestApi::new(vec![raw(5, 0.9), raw(3, 0.9)])?;
    let detection = api.upload("?filename=a.png", &png_bytes())?.json();
    let id = detection["id"].as_i64().expect("detection id");
    let alert_id = api.get(&format!("/api/v1/detections/{id}/alerts"))?.json()[0]["id"]
        .as_i64()
        .expect("alert id");

    let response = api.send_json(
        "PUT",
        &format!("/api/v1/alerts/{alert_id}/acknowledge"),
        serde_json::json!({ "user_id": 9 }),
    )?;
    assert!(response.headers.contains("200 OK"));
    assert_eq!(response.json()["status"], "acknowledged");
    assert_eq!(response.json()["acknowledged_by"], 9);

    let response = api.send_json(
        "PUT",
        &format!("/api/v1/alerts/{alert_id}/acknowledge"),
        serde_json::json!({ "user_id": 9 }),
    )?;
    assert!(response.headers.contains("409 Conflict"));

    let response = api.send_json(
        "PUT",
        &format!("/api/v1/alerts/{alert_id}/resolve"),
        serde_json::json!({ "user_id": 10, "resolution_note": "mask issued" }),
    )?;
    assert!(response.headers.contains("200 OK"));
    let resolved = response.json();
    assert_eq!(resolved["status"], "resolved");
    assert_eq!(resolved["resolution_note"], "mask issued");

    let listed = api.get("/api/v1/alerts?status=resolved")?.json();
    assert_eq!(listed["total"], 1);
    let listed = api.get("/api/v1/alerts?status=new")?.json();
    assert_eq!(listed["total"], 0);
    let response = api.get("/api/v1/alerts?status=closed")?;
    assert!(response.headers.contains("400 Bad Request"));

    let response = api.send_json(
        "PUT",
        "/api/v1/alerts/999/resolve",
        serde_json::json!({ "user_id": 1 }),
    )?;
    assert!(response.headers.contains("404 Not Found"));

    let response = api.send_json(
        "PUT",
        &format!("/api/v1/alerts/{alert_id}/acknowledge"),
        serde_json::json!({ "who": "me" }),
    )?;
    assert!(response.headers.contains("400 Bad Request"));
    Ok(())
}

#[test]
fn zones_crud_and_soft_delete() -> Result<()> {
    let api = TestApi::new(vec![raw(5, 0.9)])?;

    let response = api.send_json(
        "POST",
        "/api/v1/zones",
        serde_json::json!({
            "name": "Scaffold A",
            "description": "east wall",
            "required_ppe": ["hardhat", "safety_vest"]
        }),
    )?;
    assert!(response.headers.contains("201 Created"));
    let zone = response.json();
    let zone_id = zone["id"].as_i64().expect("zone id");
    assert_eq!(zone["is_active"], true);

    let response = api.upload(&format!("?filename=a.png&zone_id={zone_id}"), &png_bytes())?;
    assert!(response.headers.contains("201 Created"));
    assert_eq!(response.json()["zone_id"], zone_id);

    let response = api.send_json(
        "PUT",
        &format!("/api/v1/zones/{zone_id}"),
        serde_json::json!({ "name": "Scaffold B" }),
    )?;
    assert_eq!(response.json()["name"], "Scaffold B");
    assert_eq!(response.json()["required_ppe"], serde_json::json!(["hardhat", "safety_vest"]));

    let zones = api.get("/api/v1/zones")?.json();
    assert_eq!(zones.as_array().map(Vec::len), Some(1));

    let token = api.handle().token.clone();
    let response = api.send(
        "DELETE",
        &format!("/api/v1/zones/{zone_id}"),
        Some(&token),
        None,
        b"",
    )?;
    assert!(response.headers.contains("200 OK"));
    assert_eq!(response.json()["is_active"], false);

    let zones = api.get("/api/v1/zones")?.json();
    assert_eq!(zones.as_array().map(Vec::len), Some(0));

    let response = api.upload(&format!("?filename=a.png&zone_id={zone_id}"), &png_bytes())?;
    assert!(response.headers.contains("404 Not Found"));

    let filtered = api.get(&format!("/api/v1/detections?zone_id={zone_id}"))?.json();
    assert_eq!(filtered["total"], 1);
    Ok(())
}

#[test]
fn pagination_bounds_and_unknown_routes() -> Result<()> {
    let api = TestApi::new(vec![])?;

    let response = api.get("/api/v1/detections?per_page=0")?;
    assert!(response.headers.contains("400 Bad Request"));
    let response = api.get("/api/v1/detections?per_page=101")?;
    assert!(response.headers.contains("400 Bad Request"));
    let response = api.get("/api/v1/detections?page=0")?;
    assert!(response.headers.contains("400 Bad Request"));

    let response = api.get("/api/v1/detections/42")?;
    assert!(response.headers.contains("404 Not Found"));
    let response = api.get("/api/v1/nothing")?;
    assert!(response.headers.contains("404 Not Found"));

    let token = api.handle().token.clone();
    let response = api.send("DELETE", "/api/v1/detections", Some(&token), None, b"")?;
    assert!(response.headers.contains("405 Method Not Allowed"));
    Ok(())
}
