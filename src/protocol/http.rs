// Minimal HTTP/1.1 handler: per-connection request accumulation, hand
// parsing, regex routing and connection-close response serialization.
//
// This is the lightweight entry point colocated with the reactor stack; the
// axum front-end in `crate::httpd` offers the same contract on top of a full
// HTTP library for deployments that need keep-alive and chunked bodies.

use crate::protocol::{ProtocolHandler, ProtocolKind, SessionProvider};
use bytes::Bytes;
use regex::Regex;
use serde_json::json;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Ceiling on a buffered request (headers + body) before the connection is
/// answered with 400 and the buffer dropped.
pub const MAX_REQUEST_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request head is not valid UTF-8")]
    NonUtf8Head,

    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("request body shorter than Content-Length")]
    TruncatedBody,
}

/// A parsed request. Header names keep their wire spelling and order;
/// lookups go through [`HttpRequest::header`], which compares
/// case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub connection_id: u64,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A response under construction. `Content-Length` is filled in during
/// serialization; the defaults announce JSON and connection-close.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self {
            status_code: 200,
            status_text: "OK".into(),
            headers: vec![
                ("Content-Type".into(), "application/json".into()),
                ("Connection".into(), "close".into()),
                ("Server".into(), "shield".into()),
            ],
            body: Vec::new(),
        }
    }
}

impl HttpResponse {
    /// A 200 response carrying a JSON body.
    pub fn json(value: serde_json::Value) -> Self {
        Self {
            body: value.to_string().into_bytes(),
            ..Default::default()
        }
    }

    pub fn with_status(status_code: u16, status_text: impl Into<String>) -> Self {
        Self {
            status_code,
            status_text: status_text.into(),
            ..Default::default()
        }
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Replace a header if present (case-insensitive), append otherwise.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        for (key, existing) in &mut self.headers {
            if key.eq_ignore_ascii_case(name) {
                *existing = value;
                return;
            }
        }
        self.headers.push((name.to_string(), value));
    }

    fn not_found(path: &str) -> Self {
        Self::with_status(404, "Not Found")
            .body(json!({"error": "Not Found", "path": path}).to_string())
    }

    fn bad_request() -> Self {
        Self::with_status(400, "Bad Request").body(json!({"error": "Bad Request"}).to_string())
    }

    fn internal_error() -> Self {
        Self::with_status(500, "Internal Server Error")
            .body(json!({"error": "Internal Server Error"}).to_string())
    }
}

pub type RouteHandler = Box<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

struct Route {
    method: String,
    pattern: Regex,
    handler: RouteHandler,
}

/// Ordered route table: first `(method, full path match)` wins, unmatched
/// requests yield 404. Populated before the gateway starts and read-only
/// afterwards.
#[derive(Default)]
pub struct HttpRouter {
    routes: Vec<Route>,
}

impl HttpRouter {
    /// Register a route. The pattern must match the whole path, mirroring
    /// anchored matching semantics.
    pub fn add_route(
        &mut self,
        method: impl Into<String>,
        path_pattern: &str,
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) -> crate::Result<()> {
        let pattern = Regex::new(&format!("^(?:{path_pattern})$"))?;
        self.routes.push(Route {
            method: method.into(),
            pattern,
            handler: Box::new(handler),
        });
        Ok(())
    }

    /// Walk routes in insertion order. A panicking handler is caught and
    /// converted into a 500 so it can never take the reactor down.
    pub fn route_request(&self, request: &HttpRequest) -> HttpResponse {
        for route in &self.routes {
            if route.method == request.method && route.pattern.is_match(&request.path) {
                return match catch_unwind(AssertUnwindSafe(|| (route.handler)(request))) {
                    Ok(response) => response,
                    Err(_) => {
                        error!(
                            method = %request.method,
                            path = %request.path,
                            "route handler panicked"
                        );
                        HttpResponse::internal_error()
                    }
                };
            }
        }
        HttpResponse::not_found(&request.path)
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n")
}

fn parse_header_line(line: &str) -> Option<(String, String)> {
    let colon = line.find(':')?;
    let key = line[..colon].trim_end();
    let value = line[colon + 1..].trim();
    Some((key.to_string(), value.to_string()))
}

fn content_length(headers: &[(String, String)]) -> Result<Option<usize>, HttpError> {
    for (key, value) in headers {
        if key.eq_ignore_ascii_case("Content-Length") {
            return value
                .parse::<usize>()
                .map(Some)
                .map_err(|_| HttpError::InvalidContentLength(value.clone()));
        }
    }
    Ok(None)
}

/// The per-connection HTTP protocol handler.
pub struct HttpProtocolHandler {
    router: HttpRouter,
    connection_buffers: HashMap<u64, Vec<u8>>,
    session_provider: Option<SessionProvider>,
}

impl HttpProtocolHandler {
    /// Create a handler with the built-in health and status routes.
    pub fn new() -> Self {
        let mut router = HttpRouter::default();
        router
            .add_route("GET", "/health", |_req| {
                HttpResponse::json(json!({"status": "healthy", "service": "shield"}))
            })
            .expect("static route pattern");
        router
            .add_route("GET", "/status", |_req| {
                HttpResponse::json(json!({"status": "running", "protocol": "http"}))
            })
            .expect("static route pattern");

        Self {
            router,
            connection_buffers: HashMap::new(),
            session_provider: None,
        }
    }

    pub fn router_mut(&mut self) -> &mut HttpRouter {
        &mut self.router
    }

    pub fn set_session_provider(&mut self, provider: SessionProvider) {
        self.session_provider = Some(provider);
    }

    /// Dispatch an already-parsed request through the route table.
    pub fn route(&self, request: &HttpRequest) -> HttpResponse {
        self.router.route_request(request)
    }

    /// Completion predicate: the header terminator has been seen and, when a
    /// `Content-Length` is announced, at least that many body bytes follow.
    /// An unparseable length claims completion so the 400 path can run.
    pub fn is_complete_request(data: &[u8]) -> bool {
        let Some(header_end) = find_header_end(data) else {
            return false;
        };
        let Ok(head) = std::str::from_utf8(&data[..header_end]) else {
            return true;
        };

        let headers: Vec<(String, String)> =
            head.split("\r\n").skip(1).filter_map(parse_header_line).collect();
        match content_length(&headers) {
            Ok(Some(length)) => data.len() >= header_end + 4 + length,
            Ok(None) => true,
            Err(_) => true,
        }
    }

    /// Parse a complete request buffer.
    pub fn parse_request(data: &[u8], connection_id: u64) -> Result<HttpRequest, HttpError> {
        let header_end = find_header_end(data).ok_or(HttpError::TruncatedBody)?;
        let head =
            std::str::from_utf8(&data[..header_end]).map_err(|_| HttpError::NonUtf8Head)?;

        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(path), Some(version)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(HttpError::MalformedRequestLine(request_line.to_string()));
        };

        let headers: Vec<(String, String)> = lines.filter_map(parse_header_line).collect();

        let body = match content_length(&headers)? {
            Some(length) => {
                let start = header_end + 4;
                if data.len() < start + length {
                    return Err(HttpError::TruncatedBody);
                }
                data[start..start + length].to_vec()
            }
            None => Vec::new(),
        };

        Ok(HttpRequest {
            method: method.to_string(),
            path: path.to_string(),
            version: version.to_string(),
            headers,
            body,
            connection_id,
        })
    }

    /// Drop the transport after a protocol error; the queued 400 is
    /// flushed before the socket closes.
    fn close_session(&self, connection_id: u64) {
        if let Some(provider) = &self.session_provider
            && let Some(session) = provider(connection_id)
        {
            session.close();
        }
    }

    /// Serialize a response, setting `Content-Length` from the body.
    pub fn format_response(response: &HttpResponse) -> Vec<u8> {
        let mut headers = response.headers.clone();
        let mut wrote_length = false;
        for (key, value) in &mut headers {
            if key.eq_ignore_ascii_case("Content-Length") {
                *value = response.body.len().to_string();
                wrote_length = true;
            }
        }
        if !wrote_length {
            headers.push(("Content-Length".into(), response.body.len().to_string()));
        }

        let mut out = Vec::with_capacity(128 + response.body.len());
        out.extend_from_slice(
            format!(
                "HTTP/1.1 {} {}\r\n",
                response.status_code, response.status_text
            )
            .as_bytes(),
        );
        for (key, value) in &headers {
            out.extend_from_slice(format!("{key}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&response.body);
        out
    }
}

impl Default for HttpProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolHandler for HttpProtocolHandler {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Http
    }

    fn handle_connect(&mut self, connection_id: u64) {
        debug!(connection_id, "http connection established");
        self.connection_buffers.insert(connection_id, Vec::new());
    }

    fn handle_data(&mut self, connection_id: u64, data: &[u8]) {
        let (complete, oversize) = {
            let buffer = self.connection_buffers.entry(connection_id).or_default();
            buffer.extend_from_slice(data);
            (
                Self::is_complete_request(buffer),
                buffer.len() > MAX_REQUEST_SIZE,
            )
        };

        if oversize && !complete {
            warn!(connection_id, "http request exceeds size ceiling");
            self.connection_buffers.remove(&connection_id);
            let response = Self::format_response(&HttpResponse::bad_request());
            self.send_data(connection_id, &response);
            self.close_session(connection_id);
            return;
        }
        if !complete {
            return;
        }

        let buffer = self
            .connection_buffers
            .remove(&connection_id)
            .unwrap_or_default();

        let mut malformed = false;
        let response = match Self::parse_request(&buffer, connection_id) {
            Ok(request) => {
                let response = self.router.route_request(&request);
                debug!(
                    method = %request.method,
                    path = %request.path,
                    status = response.status_code,
                    "http request dispatched"
                );
                response
            }
            Err(e) => {
                error!(connection_id, error = %e, "http request parsing error");
                malformed = true;
                HttpResponse::bad_request()
            }
        };

        let bytes = Self::format_response(&response);
        self.send_data(connection_id, &bytes);
        if malformed {
            self.close_session(connection_id);
        }
    }

    fn handle_disconnect(&mut self, connection_id: u64) {
        debug!(connection_id, "http connection closed");
        self.connection_buffers.remove(&connection_id);
    }

    fn send_data(&mut self, connection_id: u64, data: &[u8]) -> bool {
        let Some(provider) = &self.session_provider else {
            return false;
        };
        match provider(connection_id) {
            Some(session) => {
                session.send(Bytes::copy_from_slice(data));
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_requires_header_terminator() {
        assert!(!HttpProtocolHandler::is_complete_request(b"GET / HTTP/1.1\r\nHost: x\r\n"));
        assert!(HttpProtocolHandler::is_complete_request(
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"
        ));
    }

    #[test]
    fn completion_waits_for_announced_body() {
        let head = b"POST /x HTTP/1.1\r\nContent-Length: 5\r\n\r\n";
        let mut request = head.to_vec();
        assert!(!HttpProtocolHandler::is_complete_request(&request));
        request.extend_from_slice(b"abc");
        assert!(!HttpProtocolHandler::is_complete_request(&request));
        request.extend_from_slice(b"de");
        assert!(HttpProtocolHandler::is_complete_request(&request));
    }

    #[test]
    fn parse_preserves_method_path_headers_and_body() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: example\r\nX-Custom-Header: Value One\r\nContent-Length: 4\r\n\r\nbody";
        let request = HttpProtocolHandler::parse_request(raw, 7).unwrap();

        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/submit");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.connection_id, 7);
        // Wire spelling and order survive parsing.
        assert_eq!(
            request.headers,
            vec![
                ("Host".to_string(), "example".to_string()),
                ("X-Custom-Header".to_string(), "Value One".to_string()),
                ("Content-Length".to_string(), "4".to_string()),
            ]
        );
        assert_eq!(request.body, b"body");
        assert_eq!(request.header("x-custom-header"), Some("Value One"));
    }

    #[test]
    fn parse_rejects_garbage_request_line() {
        let raw = b"NONSENSE\r\n\r\n";
        assert!(matches!(
            HttpProtocolHandler::parse_request(raw, 1),
            Err(HttpError::MalformedRequestLine(_))
        ));
    }

    #[test]
    fn router_first_match_wins_in_insertion_order() {
        let mut router = HttpRouter::default();
        router
            .add_route("GET", "/items/.*", |_| {
                HttpResponse::json(json!({"route": "wildcard"}))
            })
            .unwrap();
        router
            .add_route("GET", "/items/special", |_| {
                HttpResponse::json(json!({"route": "special"}))
            })
            .unwrap();

        let request = HttpRequest {
            method: "GET".into(),
            path: "/items/special".into(),
            ..Default::default()
        };
        let response = router.route_request(&request);
        assert_eq!(response.body, json!({"route": "wildcard"}).to_string().into_bytes());
    }

    #[test]
    fn router_requires_full_path_match() {
        let mut router = HttpRouter::default();
        router
            .add_route("GET", "/health", |_| HttpResponse::default())
            .unwrap();

        let request = HttpRequest {
            method: "GET".into(),
            path: "/healthz".into(),
            ..Default::default()
        };
        assert_eq!(router.route_request(&request).status_code, 404);
    }

    #[test]
    fn unmatched_request_gets_404_with_path() {
        let router = HttpRouter::default();
        let request = HttpRequest {
            method: "GET".into(),
            path: "/nope".into(),
            ..Default::default()
        };
        let response = router.route_request(&request);
        assert_eq!(response.status_code, 404);
        let body = String::from_utf8(response.body).unwrap();
        assert!(body.contains(r#""error":"Not Found""#));
        assert!(body.contains(r#""path":"/nope""#));
    }

    #[test]
    fn panicking_handler_becomes_500() {
        let mut router = HttpRouter::default();
        router
            .add_route("GET", "/boom", |_| panic!("handler exploded"))
            .unwrap();

        let request = HttpRequest {
            method: "GET".into(),
            path: "/boom".into(),
            ..Default::default()
        };
        let response = router.route_request(&request);
        assert_eq!(response.status_code, 500);
        assert_eq!(
            response.body,
            json!({"error": "Internal Server Error"}).to_string().into_bytes()
        );
    }

    #[test]
    fn format_response_sets_content_length_and_defaults() {
        let response = HttpResponse::json(json!({"status": "healthy", "service": "shield"}));
        let bytes = HttpProtocolHandler::format_response(&response);
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Server: shield\r\n"));
        let body = r#"{"status":"healthy","service":"shield"}"#;
        assert!(text.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert!(text.ends_with(&format!("\r\n\r\n{body}")));
    }

    #[test]
    fn built_in_routes_answer_health_and_status() {
        let handler = HttpProtocolHandler::new();

        let health = handler.route(&HttpRequest {
            method: "GET".into(),
            path: "/health".into(),
            ..Default::default()
        });
        assert_eq!(health.status_code, 200);
        let body = String::from_utf8(health.body).unwrap();
        assert!(body.contains(r#""status":"healthy""#));
        assert!(body.contains(r#""service":"shield""#));

        let status = handler.route(&HttpRequest {
            method: "GET".into(),
            path: "/status".into(),
            ..Default::default()
        });
        let body = String::from_utf8(status.body).unwrap();
        assert!(body.contains(r#""protocol":"http""#));
    }
}
