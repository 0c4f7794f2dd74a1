// Production HTTP front-end on top of axum.
//
// Same external contract as the minimal handler in `crate::protocol::http`
// (the user supplies a request-to-response callable) but with a full HTTP
// library underneath: correct keep-alive and chunked handling, a request
// body ceiling, and a worker pool sized to hardware concurrency. Incoming
// paths have the configured `root_path` prefix stripped before dispatch;
// paths outside the prefix are answered 404 without touching the callable.

use crate::protocol::http::{HttpRequest, HttpResponse};
use crate::reactor::bind_listener;
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use serde_json::json;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// The user-supplied request handler.
pub type RequestHandler = Arc<dyn Fn(HttpRequest) -> HttpResponse + Send + Sync>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub host: String,
    pub port: u16,
    /// Prefix stripped from incoming paths; requests outside it get a 404.
    pub root_path: String,
    /// Request body ceiling in bytes.
    pub max_request_size: usize,
    /// Worker threads; 0 means hardware concurrency.
    pub threads: usize,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8081,
            root_path: "/".into(),
            max_request_size: 1024 * 1024,
            threads: 0,
        }
    }
}

struct ServerState {
    handler: RequestHandler,
    root_path: String,
    max_request_size: usize,
}

/// HTTP server owning its worker pool and listener thread.
pub struct HttpServer {
    config: HttpServerConfig,
    handler: RequestHandler,
    local_addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl HttpServer {
    pub fn new(config: HttpServerConfig, handler: RequestHandler) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            handler,
            local_addr: None,
            shutdown_tx,
            thread: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind and serve. Bind failures are returned to the caller.
    pub fn start(&mut self) -> crate::Result<()> {
        if self.thread.is_some() {
            warn!("http server already running");
            return Ok(());
        }

        let threads = if self.config.threads > 0 {
            self.config.threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        };

        let state = Arc::new(ServerState {
            handler: Arc::clone(&self.handler),
            root_path: normalize_root_path(&self.config.root_path),
            max_request_size: self.config.max_request_size,
        });
        let router: Router = Router::new().fallback(dispatch).with_state(state);

        let host = self.config.host.clone();
        let port = self.config.port;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let (bound_tx, bound_rx) = std::sync::mpsc::channel::<crate::Result<SocketAddr>>();

        let thread = std::thread::Builder::new()
            .name("shield-httpd".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_multi_thread()
                    .worker_threads(threads)
                    .thread_name("shield-httpd-worker")
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = bound_tx.send(Err(e.into()));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let listener = match bind_listener(&host, port).await {
                        Ok(listener) => listener,
                        Err(e) => {
                            let _ = bound_tx.send(Err(e));
                            return;
                        }
                    };
                    let local_addr = match listener.local_addr() {
                        Ok(addr) => addr,
                        Err(e) => {
                            let _ = bound_tx.send(Err(e.into()));
                            return;
                        }
                    };
                    let _ = bound_tx.send(Ok(local_addr));

                    let shutdown = async move {
                        while shutdown_rx.changed().await.is_ok() {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    };
                    if let Err(e) = axum::serve(listener, router)
                        .with_graceful_shutdown(shutdown)
                        .await
                    {
                        error!(error = %e, "http server error");
                    }
                });
            })?;
        self.thread = Some(thread);

        match bound_rx.recv()? {
            Ok(addr) => {
                self.local_addr = Some(addr);
                info!(addr = %addr, workers = threads, "http server listening");
                Ok(())
            }
            Err(e) => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                Err(e)
            }
        }
    }

    /// Graceful shutdown: stop accepting, drain, join the server thread.
    pub fn stop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        info!("http server stopped");
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn normalize_root_path(root_path: &str) -> String {
    let mut root = root_path.to_string();
    if root.is_empty() {
        return "/".into();
    }
    if !root.starts_with('/') {
        root.insert(0, '/');
    }
    while root.len() > 1 && root.ends_with('/') {
        root.pop();
    }
    root
}

/// Strip the root prefix. `None` means the path lies outside the prefix.
fn strip_root_path(root: &str, path: &str) -> Option<String> {
    if root == "/" {
        return Some(path.to_string());
    }
    if path == root {
        return Some("/".to_string());
    }
    let rest = path.strip_prefix(root)?;
    if !rest.starts_with('/') {
        return None;
    }
    Some(rest.to_string())
}

fn json_error_response(status: StatusCode, message: &str) -> Response {
    let body = json!({"error": message}).to_string();
    match Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .header("server", "shield")
        .body(Body::from(body))
    {
        Ok(response) => response,
        Err(_) => Response::new(Body::empty()),
    }
}

fn into_axum_response(response: HttpResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        // The library owns connection management, body framing, and the
        // server identity header.
        if name.eq_ignore_ascii_case("connection")
            || name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("server")
        {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder = builder.header("server", "shield");

    match builder.body(Body::from(response.body)) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "failed to build http response");
            json_error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

async fn dispatch(State(state): State<Arc<ServerState>>, req: axum::extract::Request) -> Response {
    let (parts, body) = req.into_parts();

    let Some(path) = strip_root_path(&state.root_path, parts.uri.path()) else {
        return json_error_response(StatusCode::NOT_FOUND, "Not Found");
    };

    let body = match axum::body::to_bytes(body, state.max_request_size).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return json_error_response(StatusCode::PAYLOAD_TOO_LARGE, "Payload Too Large");
        }
    };

    let request = HttpRequest {
        method: parts.method.as_str().to_string(),
        path,
        version: format!("{:?}", parts.version),
        headers: parts
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body: body.to_vec(),
        connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
    };

    let handler = Arc::clone(&state.handler);
    let response = match catch_unwind(AssertUnwindSafe(move || handler(request))) {
        Ok(response) => response,
        Err(_) => {
            error!("http handler panicked");
            HttpResponse::with_status(500, "Internal Server Error")
                .body(json!({"error": "Internal Server Error"}).to_string())
        }
    };
    into_axum_response(response)
}
