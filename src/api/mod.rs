use crate::error::ServiceError;
use crate::records::{AlertStatus, DetectionFilter, NewZone, Page, ZoneUpdate};
use crate::service::DetectionService;
use anyhow::{anyhow, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_HEAD_BYTES: usize = 8192;
const MAX_DRAIN_BYTES: u64 = 64 * 1024 * 1024;
const DEFAULT_PER_PAGE: u64 = 20;
const MAX_PER_PAGE: u64 = 100;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub token_path: Option<PathBuf>,
    pub max_upload_bytes: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8800".to_string(),
            token_path: None,
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    pub token: String,
    pub token_path: Option<PathBuf>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

/// Bearer token minted once per server start.
#[derive(Clone)]
pub struct CapabilityToken {
    token: [u8; 32],
}

impl CapabilityToken {
    pub fn generate() -> Self {
        let mut token = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token);
        Self { token }
    }

    pub fn token_hex(&self) -> String {
        hex::encode(self.token)
    }

    pub fn validate(&self, presented: &str) -> Result<()> {
        let presented = parse_hex32(presented)?;
        if presented != self.token {
            return Err(anyhow!("capability token invalid"));
        }
        Ok(())
    }
}

/// Loopback HTTP server for the detection service. Requests are handled
/// one at a time on a dedicated thread that owns the service.
pub struct ApiServer {
    cfg: ApiConfig,
    service: DetectionService,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, service: DetectionService) -> Self {
        Self { cfg, service }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let capability = CapabilityToken::generate();
        let token = capability.token_hex();
        if let Some(path) = &self.cfg.token_path {
            write_token_file(path, &token)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let token_path = cfg.token_path.clone();
        let mut service = self.service;
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, &cfg, &mut service, &capability, shutdown_thread) {
                log::error!("detection api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            token,
            token_path,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: &ApiConfig,
    service: &mut DetectionService,
    capability: &CapabilityToken,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, service, cfg, capability) {
                    log::warn!("detection api request rejected: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(
    mut stream: TcpStream,
    service: &mut DetectionService,
    cfg: &ApiConfig,
    capability: &CapabilityToken,
) -> Result<()> {
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        reject(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let mut request = read_request_head(&mut stream)?;
    if request.path == "/health" {
        let body = serde_json::json!({
            "status": "ok",
            "model_loaded": service.detector().has_model(),
        });
        write_response(
            &mut stream,
            200,
            "application/json",
            &serde_json::to_vec(&body)?,
        )?;
        return Ok(());
    }

    if request.has_query_token() {
        reject(
            &mut stream,
            400,
            r#"{"error":"token_query_param_not_allowed"}"#,
        )?;
        return Ok(());
    }

    let token = match request.bearer_token() {
        Some(token) => token,
        None => {
            reject(&mut stream, 401, r#"{"error":"missing_token"}"#)?;
            return Ok(());
        }
    };
    if let Err(err) = capability.validate(&token) {
        reject(&mut stream, 401, r#"{"error":"invalid_token"}"#)?;
        return Err(err);
    }

    let content_length = match request.content_length() {
        Some(Ok(len)) => len,
        Some(Err(())) => {
            reject(&mut stream, 400, r#"{"error":"invalid_content_length"}"#)?;
            return Ok(());
        }
        None => 0,
    };
    if content_length > cfg.max_upload_bytes {
        reject(&mut stream, 413, r#"{"error":"payload_too_large"}"#)?;
        return Err(anyhow!(
            "request body of {} bytes exceeds limit of {}",
            content_length,
            cfg.max_upload_bytes
        ));
    }
    read_request_body(&mut stream, &mut request, content_length as usize)?;

    let response = route(&request, service).unwrap_or_else(ApiError::into_response);
    write_response(
        &mut stream,
        response.status,
        response.content_type,
        &response.body,
    )
}

fn route(request: &HttpRequest, service: &mut DetectionService) -> Result<Response, ApiError> {
    let Some(rest) = request.path.strip_prefix("/api/v1/") else {
        return Err(ApiError::new(404, "not_found", "unknown route"));
    };
    let segments: Vec<&str> = rest.trim_end_matches('/').split('/').collect();

    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["detections"]) => {
            let (page, per_page) = request.pagination()?;
            let filter = DetectionFilter {
                zone_id: request.query_i64("zone_id")?,
                has_violation: request.query_bool("has_violation")?,
            };
            let (items, total) = service.list(&filter, Page::numbered(page, per_page))?;
            Response::json(200, &PageEnvelope::new(items, total, page, per_page))
        }
        ("POST", ["detections"]) => create_detection(request, service),
        ("GET", ["detections", "stats"]) => {
            let stats = service.stats(request.query_i64("zone_id")?)?;
            Response::json(200, &stats)
        }
        ("GET", ["detections", id]) => {
            let id = parse_id(id)?;
            match service.get(id)? {
                Some(detection) => Response::json(200, &detection),
                None => Err(ServiceError::not_found("detection", id).into()),
            }
        }
        ("GET", ["detections", id, "alerts"]) => {
            let alerts = service.alerts_for_detection(parse_id(id)?)?;
            Response::json(200, &alerts)
        }
        ("GET", ["detections", id, "image", "result"]) => {
            let body = service.result_image(parse_id(id)?)?;
            Ok(Response {
                status: 200,
                content_type: "image/jpeg",
                body,
            })
        }
        ("GET", ["alerts"]) => {
            let (page, per_page) = request.pagination()?;
            let status = match request.query("status") {
                Some(raw) => Some(AlertStatus::parse(raw).ok_or_else(|| {
                    ApiError::bad_request(format!("unknown alert status '{}'", raw))
                })?),
                None => None,
            };
            let (items, total) = service.list_alerts(status, Page::numbered(page, per_page))?;
            Response::json(200, &PageEnvelope::new(items, total, page, per_page))
        }
        ("PUT", ["alerts", id, "acknowledge"]) => {
            let body: AcknowledgeBody = request.json_body()?;
            Response::json(200, &service.acknowledge(parse_id(id)?, body.user_id)?)
        }
        ("PUT", ["alerts", id, "resolve"]) => {
            let body: ResolveBody = request.json_body()?;
            let alert = service.resolve(parse_id(id)?, body.user_id, body.resolution_note)?;
            Response::json(200, &alert)
        }
        ("GET", ["zones"]) => Response::json(200, &service.list_zones()?),
        ("POST", ["zones"]) => {
            let zone: NewZone = request.json_body()?;
            Response::json(201, &service.create_zone(zone)?)
        }
        ("GET", ["zones", id]) => Response::json(200, &service.get_zone(parse_id(id)?)?),
        ("PUT", ["zones", id]) => {
            let update: ZoneUpdate = request.json_body()?;
            Response::json(200, &service.update_zone(parse_id(id)?, update)?)
        }
        ("DELETE", ["zones", id]) => Response::json(200, &service.deactivate_zone(parse_id(id)?)?),
        (_, ["detections" | "alerts" | "zones", ..]) => Err(ApiError::new(
            405,
            "method_not_allowed",
            format!("{} not supported on {}", request.method, request.path),
        )),
        _ => Err(ApiError::new(404, "not_found", "unknown route")),
    }
}

fn create_detection(
    request: &HttpRequest,
    service: &mut DetectionService,
) -> Result<Response, ApiError> {
    let content_type = request
        .headers
        .get("content-type")
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    let Some(subtype) = content_type
        .split(';')
        .next()
        .and_then(|mime| mime.trim().strip_prefix("image/"))
    else {
        return Err(ApiError::new(
            415,
            "unsupported_media_type",
            "upload must be sent with an image/* content type",
        ));
    };

    let filename = match request.query("filename") {
        Some(name) if !name.trim().is_empty() => name.to_string(),
        _ => format!("upload.{}", subtype),
    };
    let detection = service.process(
        &request.body,
        &filename,
        request.query_i64("user_id")?,
        request.query_i64("zone_id")?,
    )?;
    Response::json(201, &detection)
}

#[derive(Debug, Deserialize)]
struct AcknowledgeBody {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    user_id: i64,
    #[serde(default)]
    resolution_note: Option<String>,
}

#[derive(Debug, Serialize)]
struct PageEnvelope<T> {
    items: Vec<T>,
    total: u64,
    page: u64,
    per_page: u64,
    total_pages: u64,
}

impl<T> PageEnvelope<T> {
    fn new(items: Vec<T>, total: u64, page: u64, per_page: u64) -> Self {
        Self {
            items,
            total,
            page,
            per_page,
            total_pages: total.div_ceil(per_page),
        }
    }
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn json<T: Serialize>(status: u16, value: &T) -> Result<Self, ApiError> {
        let body = serde_json::to_vec(value).map_err(|err| {
            log::error!("failed to encode response: {}", err);
            ApiError::new(500, "internal_error", "internal error")
        })?;
        Ok(Self {
            status,
            content_type: "application/json",
            body,
        })
    }
}

#[derive(Debug)]
struct ApiError {
    status: u16,
    code: &'static str,
    detail: String,
}

impl ApiError {
    fn new(status: u16, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            code,
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(400, "invalid_input", detail)
    }

    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.code, "detail": self.detail });
        Response {
            status: self.status,
            content_type: "application/json",
            body: body.to_string().into_bytes(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match &err {
            ServiceError::InvalidImage(_) | ServiceError::InvalidInput(_) => {
                Self::bad_request(err.to_string())
            }
            ServiceError::NotFound { .. } => Self::new(404, "not_found", err.to_string()),
            ServiceError::InvalidTransition { .. } => {
                Self::new(409, "invalid_transition", err.to_string())
            }
            ServiceError::Detector(_) | ServiceError::Io(_) | ServiceError::Storage(_) => {
                log::error!("detection api request failed: {}", err);
                Self::new(500, "internal_error", "internal error")
            }
        }
    }
}

fn parse_id(segment: &str) -> Result<i64, ApiError> {
    segment
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid id '{}'", segment)))
}

fn read_request_head(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let head_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEAD_BYTES {
            return Err(anyhow!("request headers too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request headers were complete"));
        }
        data.extend_from_slice(&buf[..n]);
    };
    let body = data[head_end + 4..].to_vec();

    let text = String::from_utf8_lossy(&data[..head_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, HashMap::new()),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        headers,
        raw_path: raw_path.to_string(),
        body,
    })
}

fn read_request_body(
    stream: &mut TcpStream,
    request: &mut HttpRequest,
    content_length: usize,
) -> Result<()> {
    request.body.truncate(content_length);
    let mut buf = [0u8; 8192];
    while request.body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before request body was complete"));
        }
        let take = n.min(content_length - request.body.len());
        request.body.extend_from_slice(&buf[..take]);
    }
    Ok(())
}

/// Answers a request whose body is still unread. The rest of the request is
/// drained after the response so closing the socket does not reset the
/// connection before the client reads the status.
fn reject(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_json_response(stream, status, body)?;
    stream.shutdown(Shutdown::Write)?;
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut unread = (&*stream).take(MAX_DRAIN_BYTES);
    if let Err(err) = std::io::copy(&mut unread, &mut std::io::sink()) {
        log::debug!("stopped draining rejected request: {}", err);
    }
    Ok(())
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        201 => "HTTP/1.1 201 Created",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        413 => "HTTP/1.1 413 Payload Too Large",
        415 => "HTTP/1.1 415 Unsupported Media Type",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
    headers: HashMap<String, String>,
    raw_path: String,
    body: Vec<u8>,
}

impl HttpRequest {
    fn bearer_token(&self) -> Option<String> {
        if let Some(value) = self.headers.get("authorization") {
            let parts: Vec<&str> = value.split_whitespace().collect();
            if parts.len() == 2 && parts[0].eq_ignore_ascii_case("bearer") {
                return Some(parts[1].to_string());
            }
        }
        None
    }

    fn has_query_token(&self) -> bool {
        if let Some(query) = self.raw_path.split('?').nth(1) {
            for pair in query.split('&') {
                if let Some((k, _)) = pair.split_once('=') {
                    if k == "token" {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// `None` when absent, `Some(Err(()))` when unparseable.
    fn content_length(&self) -> Option<Result<u64, ()>> {
        self.headers
            .get("content-length")
            .map(|value| value.parse().map_err(|_| ()))
    }

    fn query(&self, key: &str) -> Option<&str> {
        self.query
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    fn query_i64(&self, key: &str) -> Result<Option<i64>, ApiError> {
        self.query(key)
            .map(|raw| {
                raw.parse()
                    .map_err(|_| ApiError::bad_request(format!("{} must be an integer", key)))
            })
            .transpose()
    }

    fn query_bool(&self, key: &str) -> Result<Option<bool>, ApiError> {
        self.query(key)
            .map(|raw| match raw.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(true),
                "false" | "0" => Ok(false),
                _ => Err(ApiError::bad_request(format!("{} must be true or false", key))),
            })
            .transpose()
    }

    /// 1-based `page` and `per_page` in 1..=100.
    fn pagination(&self) -> Result<(u64, u64), ApiError> {
        let page = match self.query_i64("page")? {
            Some(page) if page >= 1 => page as u64,
            Some(_) => return Err(ApiError::bad_request("page must be at least 1")),
            None => 1,
        };
        let per_page = match self.query_i64("per_page")? {
            Some(n) if (1..=MAX_PER_PAGE as i64).contains(&n) => n as u64,
            Some(_) => {
                return Err(ApiError::bad_request(format!(
                    "per_page must be between 1 and {}",
                    MAX_PER_PAGE
                )))
            }
            None => DEFAULT_PER_PAGE,
        };
        Ok((page, per_page))
    }

    fn json_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body)
            .map_err(|err| ApiError::bad_request(format!("invalid JSON body: {}", err)))
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn write_token_file(path: &Path, token: &str) -> Result<()> {
    std::fs::write(path, format!("{token}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

fn parse_hex32(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value)?;
    if bytes.len() != 32 {
        return Err(anyhow!("token must be 32 bytes"));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}
