use crate::analytics::{page_count, Analytics, TimeRange, PAGE_SIZE};
use crate::open_db_connection;
use crate::store::ensure_schema;
use anyhow::{anyhow, Result};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub db_path: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8797".to_string(),
            db_path: "ppe_detections.db".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
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

/// Read-only dashboard API over the detection database.
pub struct ApiServer {
    cfg: ApiConfig,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig) -> Self {
        Self { cfg }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        if !configured_addr.ip().is_loopback() {
            return Err(anyhow!(
                "dashboard api must bind a loopback address, got '{}'",
                configured_addr
            ));
        }
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;
        let conn = open_db_connection(&self.cfg.db_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        ensure_schema(&conn)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("dashboard-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, conn, shutdown_thread) {
                    log::error!("dashboard api stopped: {}", err);
                }
            })?;
        log::info!("dashboard api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, conn: Connection, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &conn) {
                    log::warn!("dashboard api request rejected: {}", err);
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

fn handle_connection(mut stream: TcpStream, conn: &Connection) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    if !peer.ip().is_loopback() {
        return write_response(&mut stream, &Response::json_error(403, "forbidden"));
    }
    let request = read_request(&mut stream)?;
    let response = match route(conn, &request) {
        Ok(response) => response,
        Err(err) => {
            log::error!("dashboard api: {} failed: {:#}", request.path, err);
            Response::json_error(500, "internal_error")
        }
    };
    write_response(&mut stream, &response)
}

// ----------------------------------------------------------------------------
// Routing
// ----------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
struct Response {
    status: u16,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self {
            status: 200,
            content_type: "application/json",
            body: serde_json::to_vec(value)?,
        })
    }

    fn json_error(status: u16, error: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: serde_json::json!({ "error": error }).to_string().into_bytes(),
        }
    }

    fn bad_request(detail: &anyhow::Error) -> Self {
        Self {
            status: 400,
            content_type: "application/json",
            body: serde_json::json!({ "error": "bad_request", "detail": format!("{:#}", detail) })
                .to_string()
                .into_bytes(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DetectionsPage {
    page: u64,
    per_page: u32,
    total: u64,
    total_pages: u64,
    detections: Vec<crate::analytics::DetectionRow>,
}

fn route(conn: &Connection, request: &HttpRequest) -> Result<Response> {
    if request.method != "GET" {
        return Ok(Response::json_error(405, "method_not_allowed"));
    }
    let analytics = Analytics::new(conn);
    match request.path.as_str() {
        "/health" => Ok(Response::json(&serde_json::json!({ "status": "ok" }))?),
        "/detections" => {
            let range = match request.range() {
                Ok(range) => range,
                Err(err) => return Ok(Response::bad_request(&err)),
            };
            let page = request
                .query
                .get("page")
                .and_then(|raw| raw.parse::<u64>().ok())
                .unwrap_or(1)
                .max(1);
            let total = analytics.detections_count(&range)?;
            let detections =
                analytics.detections_page(&range, PAGE_SIZE, (page - 1) * PAGE_SIZE as u64)?;
            Response::json(&DetectionsPage {
                page,
                per_page: PAGE_SIZE,
                total,
                total_pages: page_count(total, PAGE_SIZE),
                detections,
            })
        }
        "/summary" => {
            let range = match request.range() {
                Ok(range) => range,
                Err(err) => return Ok(Response::bad_request(&err)),
            };
            Response::json(&analytics.summary(&range)?)
        }
        path => match path.strip_prefix("/image/") {
            Some(raw_id) => {
                let Ok(id) = raw_id.parse::<i64>() else {
                    return Ok(Response::json_error(400, "bad_image_id"));
                };
                match analytics.frame_by_id(id)? {
                    Some(jpeg) => Ok(Response {
                        status: 200,
                        content_type: "image/jpeg",
                        body: jpeg,
                    }),
                    None => Ok(Response::json_error(404, "not_found")),
                }
            }
            None => Ok(Response::json_error(404, "not_found")),
        },
    }
}

// ----------------------------------------------------------------------------
// HTTP plumbing
// ----------------------------------------------------------------------------

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    HttpRequest::parse_line(request_line)
}

fn write_response(stream: &mut TcpStream, response: &Response) -> Result<()> {
    let status_line = match response.status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = response.content_type,
        len = response.body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(&response.body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
}

impl HttpRequest {
    fn parse_line(request_line: &str) -> Result<Self> {
        let mut parts = request_line.split_whitespace();
        let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
        let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
        let (path, query) = raw_path.split_once('?').unwrap_or((raw_path, ""));
        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            query: url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
        })
    }

    fn range(&self) -> Result<TimeRange> {
        TimeRange::parse(
            self.query.get("start").map(String::as_str),
            self.query.get("end").map(String::as_str),
        )
    }
}
