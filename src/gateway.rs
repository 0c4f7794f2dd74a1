// Gateway orchestrator: wires the reactors and the protocol handlers
// together and dispatches decoded messages to the application handlers.
//
// Ownership follows the weak-table pattern: a session's run loop holds the
// strong Arc, the gateway's table holds a Weak, and reply paths upgrade on
// demand. A reply addressed to a session that has since gone away is a
// logged no-op.

use crate::codec;
use crate::config::GatewayConfig;
use crate::httpd::HttpServer;
use crate::protocol::http::{HttpProtocolHandler, HttpRequest, HttpResponse};
use crate::protocol::ws::{self, WebSocketProtocolHandler, WsFrame};
use crate::protocol::{ProtocolKind, ProtocolHandler, SessionProvider, detect_protocol};
use crate::reactor::MasterReactor;
use crate::session::Session;
use crate::udp::{UdpReactor, UdpSessionManager};
use bytes::{Buf, Bytes, BytesMut};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Application handler for decoded binary messages (TCP and UDP): takes the
/// session id and the frame payload, returns the reply payload.
pub type MessageHandler = Arc<dyn Fn(u64, Bytes) -> BoxFuture<crate::Result<Bytes>> + Send + Sync>;

/// Application handler for WebSocket text messages.
pub type TextHandler = Arc<dyn Fn(u64, String) -> BoxFuture<crate::Result<String>> + Send + Sync>;

/// The multi-protocol gateway front-end.
///
/// Owns the master reactors for the binary, HTTP and WebSocket listeners,
/// the axum HTTP front-end, and the UDP reactor; decoded messages flow to
/// the application handlers installed before `start`, and replies flow back
/// through the protocol's encode path. Each application call runs under the
/// configured request timeout; a call that misses the deadline is dropped
/// and a protocol-appropriate error reply is synthesized, so a late result
/// can never reach the peer.
///
/// # Examples
///
/// ```rust,no_run
/// use shield::{Gateway, GatewayConfig};
///
/// fn main() -> shield::Result<()> {
///     let mut gateway = Gateway::new(GatewayConfig::default());
///     gateway.set_message_handler(|_session_id, payload| {
///         Box::pin(async move { Ok(payload) })
///     });
///     gateway.set_text_handler(|_session_id, text| {
///         Box::pin(async move { Ok(text) })
///     });
///     gateway.start()?;
///     // ... run until shutdown is requested ...
///     gateway.stop();
///     Ok(())
/// }
/// ```
pub struct Gateway {
    config: GatewayConfig,
    shared: GatewayShared,
    binary_handler: Option<MessageHandler>,
    text_handler: Option<TextHandler>,
    udp_handler: Option<MessageHandler>,
    binary_reactor: Option<MasterReactor>,
    http_reactor: Option<MasterReactor>,
    ws_reactor: Option<MasterReactor>,
    http_server: Option<HttpServer>,
    udp_reactor: Option<UdpReactor>,
    running: bool,
}

/// Cheaply cloneable handle over the state shared between listeners,
/// handler callbacks and reply tasks.
#[derive(Clone)]
struct GatewayShared {
    inner: Arc<SharedInner>,
}

struct SharedInner {
    sessions: Mutex<HashMap<u64, Weak<Session>>>,
    recv_buffers: Mutex<HashMap<u64, BytesMut>>,
    session_protocols: Mutex<HashMap<u64, ProtocolKind>>,
    http_handler: Mutex<HttpProtocolHandler>,
    ws_handler: Mutex<WebSocketProtocolHandler>,
    max_frame_size: usize,
    request_timeout: Duration,
}

fn error_envelope(message: &str) -> Vec<u8> {
    json!({"error": message}).to_string().into_bytes()
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let shared = GatewayShared {
            inner: Arc::new(SharedInner {
                sessions: Mutex::new(HashMap::new()),
                recv_buffers: Mutex::new(HashMap::new()),
                session_protocols: Mutex::new(HashMap::new()),
                http_handler: Mutex::new(HttpProtocolHandler::new()),
                ws_handler: Mutex::new(WebSocketProtocolHandler::new()),
                max_frame_size: config.max_frame_size,
                request_timeout: config.request_timeout(),
            }),
        };
        Self {
            config,
            shared,
            binary_handler: None,
            text_handler: None,
            udp_handler: None,
            binary_reactor: None,
            http_reactor: None,
            ws_reactor: None,
            http_server: None,
            udp_reactor: None,
            running: false,
        }
    }

    /// Handler for decoded binary frames on the TCP listener.
    pub fn set_message_handler<F>(&mut self, handler: F)
    where
        F: Fn(u64, Bytes) -> BoxFuture<crate::Result<Bytes>> + Send + Sync + 'static,
    {
        self.binary_handler = Some(Arc::new(handler));
    }

    /// Handler for WebSocket text/binary message payloads.
    pub fn set_text_handler<F>(&mut self, handler: F)
    where
        F: Fn(u64, String) -> BoxFuture<crate::Result<String>> + Send + Sync + 'static,
    {
        self.text_handler = Some(Arc::new(handler));
    }

    /// Handler for decoded frames arriving on the UDP socket. Defaults to
    /// the binary message handler when unset.
    pub fn set_udp_handler<F>(&mut self, handler: F)
    where
        F: Fn(u64, Bytes) -> BoxFuture<crate::Result<Bytes>> + Send + Sync + 'static,
    {
        self.udp_handler = Some(Arc::new(handler));
    }

    /// Register an HTTP route on the minimal handler's router. The same
    /// route table backs the axum front-end.
    pub fn add_http_route(
        &self,
        method: impl Into<String>,
        path_pattern: &str,
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) -> crate::Result<()> {
        self.shared
            .inner
            .http_handler
            .lock()
            .unwrap()
            .router_mut()
            .add_route(method, path_pattern, handler)
    }

    pub fn binary_addr(&self) -> Option<SocketAddr> {
        self.binary_reactor.as_ref().and_then(|r| r.local_addr())
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_reactor.as_ref().and_then(|r| r.local_addr())
    }

    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws_reactor.as_ref().and_then(|r| r.local_addr())
    }

    pub fn http_server_addr(&self) -> Option<SocketAddr> {
        self.http_server.as_ref().and_then(|s| s.local_addr())
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_reactor
            .as_ref()
            .and_then(|r| r.manager())
            .and_then(|m| m.local_addr().ok())
    }

    /// The running UDP session manager, if the UDP entry point is up.
    pub fn udp_session_manager(&self) -> Option<&Arc<UdpSessionManager>> {
        self.udp_reactor.as_ref().and_then(|r| r.manager())
    }

    /// Bind every enabled listener and start serving. On any bind failure
    /// the already-started components are stopped before the error returns.
    pub fn start(&mut self) -> crate::Result<()> {
        if self.running {
            warn!("gateway already running");
            return Ok(());
        }

        let provider: SessionProvider = {
            let shared = self.shared.clone();
            Arc::new(move |session_id| shared.session(session_id))
        };
        self.shared
            .inner
            .http_handler
            .lock()
            .unwrap()
            .set_session_provider(Arc::clone(&provider));
        self.shared
            .inner
            .ws_handler
            .lock()
            .unwrap()
            .set_session_provider(Arc::clone(&provider));

        // WebSocket messages route to the text handler; replies are framed
        // back as unmasked server TEXT frames.
        if let Some(handler) = self.text_handler.clone() {
            let shared = self.shared.clone();
            self.shared
                .inner
                .ws_handler
                .lock()
                .unwrap()
                .set_message_handler(move |session_id, payload| {
                    let handler = Arc::clone(&handler);
                    let shared = shared.clone();
                    let deadline = shared.inner.request_timeout;
                    tokio::spawn(async move {
                        let text = String::from_utf8_lossy(&payload).into_owned();
                        let reply = match timeout(deadline, handler(session_id, text)).await {
                            Ok(Ok(reply)) => reply.into_bytes(),
                            Ok(Err(e)) => {
                                error!(session_id, error = %e, "websocket handler error");
                                error_envelope("handler error")
                            }
                            Err(_) => {
                                warn!(session_id, "websocket request timed out");
                                error_envelope("request timed out")
                            }
                        };
                        shared.send_ws_text(session_id, &reply);
                    });
                });
        }

        if let Err(e) = self.start_listeners() {
            self.stop();
            return Err(e);
        }
        self.running = true;
        info!("gateway started");
        Ok(())
    }

    fn start_listeners(&mut self) -> crate::Result<()> {
        if self.config.binary.enabled {
            let mut reactor = MasterReactor::new(
                self.config.host.clone(),
                self.config.binary.port,
                self.config.binary.num_slaves,
            )?;
            reactor.set_session_creator(Self::session_creator(
                self.shared.clone(),
                self.binary_handler.clone(),
                if self.config.binary.protocol_detection {
                    None
                } else {
                    Some(ProtocolKind::Binary)
                },
            ));
            reactor.start()?;
            self.binary_reactor = Some(reactor);
        }

        if self.config.http.enabled {
            let mut reactor = MasterReactor::new(
                self.config.host.clone(),
                self.config.http.port,
                self.config.http.num_slaves,
            )?;
            reactor.set_session_creator(Self::session_creator(
                self.shared.clone(),
                None,
                Some(ProtocolKind::Http),
            ));
            reactor.start()?;
            self.http_reactor = Some(reactor);
        }

        if self.config.websocket.enabled {
            let mut reactor = MasterReactor::new(
                self.config.host.clone(),
                self.config.websocket.port,
                self.config.websocket.num_slaves,
            )?;
            reactor.set_session_creator(Self::session_creator(
                self.shared.clone(),
                None,
                Some(ProtocolKind::WebSocket),
            ));
            reactor.start()?;
            self.ws_reactor = Some(reactor);
        }

        if self.config.http_server.enabled {
            let shared = self.shared.clone();
            let mut server = HttpServer::new(
                self.config.http_server_config(),
                Arc::new(move |request| {
                    shared.inner.http_handler.lock().unwrap().route(&request)
                }),
            );
            server.start()?;
            self.http_server = Some(server);
        }

        if self.config.udp.enabled {
            let mut reactor = UdpReactor::new(
                self.config.host.clone(),
                self.config.udp.port,
                self.config.udp.workers,
                self.config.udp.session_timeout(),
                self.config.udp.cleanup_interval(),
            );
            let shared = self.shared.clone();
            let handler = self
                .udp_handler
                .clone()
                .or_else(|| self.binary_handler.clone());
            reactor.start(|manager| {
                let reply_manager = Arc::clone(manager);
                manager.set_on_receive(move |session_id, data, _peer| {
                    shared.dispatch_udp_frame(
                        &reply_manager,
                        session_id,
                        Bytes::copy_from_slice(data),
                        &handler,
                    );
                });
                manager.set_on_timeout(|session_id| {
                    debug!(session_id, "udp session timed out");
                });
            })?;
            self.udp_reactor = Some(reactor);
        }

        Ok(())
    }

    fn session_creator(
        shared: GatewayShared,
        binary_handler: Option<MessageHandler>,
        kind: Option<ProtocolKind>,
    ) -> impl Fn(TcpStream, SocketAddr) -> Arc<Session> + Send + Sync + 'static {
        move |stream, peer| {
            let session = Session::new(stream, peer);
            let session_id = session.id();
            shared.on_session_open(&session, kind);

            let read_shared = shared.clone();
            let read_handler = binary_handler.clone();
            session.set_on_read(move |data| {
                read_shared.on_session_data(session_id, data, &read_handler);
            });

            let close_shared = shared.clone();
            session.set_on_close(move || close_shared.on_session_closed(session_id));
            session
        }
    }

    /// Close the acceptors first, then stop every reactor and join, and
    /// finally close any sessions still alive.
    pub fn stop(&mut self) {
        if let Some(reactor) = &mut self.binary_reactor {
            reactor.stop();
        }
        if let Some(reactor) = &mut self.http_reactor {
            reactor.stop();
        }
        if let Some(reactor) = &mut self.ws_reactor {
            reactor.stop();
        }
        if let Some(server) = &mut self.http_server {
            server.stop();
        }
        if let Some(reactor) = &mut self.udp_reactor {
            reactor.stop();
        }
        self.binary_reactor = None;
        self.http_reactor = None;
        self.ws_reactor = None;
        self.http_server = None;
        self.udp_reactor = None;

        let leftover: Vec<Arc<Session>> = {
            let mut sessions = self.shared.inner.sessions.lock().unwrap();
            sessions
                .drain()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect()
        };
        for session in leftover {
            session.close();
        }
        self.running = false;
        info!("gateway stopped");
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.stop();
    }
}

enum BinaryRead {
    Frames(Vec<Bytes>),
    Corrupt,
}

impl GatewayShared {
    fn session(&self, session_id: u64) -> Option<Arc<Session>> {
        self.inner
            .sessions
            .lock()
            .unwrap()
            .get(&session_id)
            .and_then(Weak::upgrade)
    }

    fn on_session_open(&self, session: &Arc<Session>, kind: Option<ProtocolKind>) {
        let session_id = session.id();
        self.inner
            .sessions
            .lock()
            .unwrap()
            .insert(session_id, Arc::downgrade(session));
        if let Some(kind) = kind {
            self.bind_protocol(session_id, kind);
        }
    }

    /// Tag the session's protocol and initialize the per-protocol state.
    fn bind_protocol(&self, session_id: u64, kind: ProtocolKind) {
        self.inner
            .session_protocols
            .lock()
            .unwrap()
            .insert(session_id, kind);
        match kind {
            ProtocolKind::Binary => {
                self.inner
                    .recv_buffers
                    .lock()
                    .unwrap()
                    .insert(session_id, BytesMut::new());
            }
            ProtocolKind::Http => self
                .inner
                .http_handler
                .lock()
                .unwrap()
                .handle_connect(session_id),
            ProtocolKind::WebSocket => self
                .inner
                .ws_handler
                .lock()
                .unwrap()
                .handle_connect(session_id),
        }
    }

    fn on_session_data(&self, session_id: u64, data: &[u8], binary_handler: &Option<MessageHandler>) {
        let known = self
            .inner
            .session_protocols
            .lock()
            .unwrap()
            .get(&session_id)
            .copied();
        let kind = match known {
            Some(kind) => kind,
            None => {
                // Multiplexed listener: classify from the first bytes.
                let kind = detect_protocol(data);
                debug!(session_id, ?kind, "protocol detected");
                self.bind_protocol(session_id, kind);
                kind
            }
        };

        match kind {
            ProtocolKind::Binary => self.handle_binary_data(session_id, data, binary_handler),
            ProtocolKind::Http => self
                .inner
                .http_handler
                .lock()
                .unwrap()
                .handle_data(session_id, data),
            ProtocolKind::WebSocket => self
                .inner
                .ws_handler
                .lock()
                .unwrap()
                .handle_data(session_id, data),
        }
    }

    fn on_session_closed(&self, session_id: u64) {
        self.inner.sessions.lock().unwrap().remove(&session_id);
        self.inner.recv_buffers.lock().unwrap().remove(&session_id);
        let kind = self
            .inner
            .session_protocols
            .lock()
            .unwrap()
            .remove(&session_id);
        match kind {
            Some(ProtocolKind::Http) => self
                .inner
                .http_handler
                .lock()
                .unwrap()
                .handle_disconnect(session_id),
            Some(ProtocolKind::WebSocket) => self
                .inner
                .ws_handler
                .lock()
                .unwrap()
                .handle_disconnect(session_id),
            _ => {}
        }
        debug!(session_id, "session unregistered");
    }

    fn handle_binary_data(
        &self,
        session_id: u64,
        data: &[u8],
        handler: &Option<MessageHandler>,
    ) {
        let read = {
            let mut buffers = self.inner.recv_buffers.lock().unwrap();
            let buffer = buffers.entry(session_id).or_default();
            buffer.extend_from_slice(data);

            let mut frames = Vec::new();
            loop {
                match codec::decode_with_limit(buffer, self.inner.max_frame_size) {
                    Ok(Some((payload, consumed))) => {
                        frames.push(payload);
                        buffer.advance(consumed);
                    }
                    Ok(None) => break BinaryRead::Frames(frames),
                    Err(e) => {
                        error!(session_id, error = %e, "binary framing error");
                        break BinaryRead::Corrupt;
                    }
                }
            }
        };

        match read {
            BinaryRead::Frames(frames) => {
                for payload in frames {
                    self.dispatch_binary_message(session_id, payload, handler);
                }
            }
            BinaryRead::Corrupt => {
                self.inner.recv_buffers.lock().unwrap().remove(&session_id);
                if let Some(session) = self.session(session_id) {
                    session.close();
                }
            }
        }
    }

    fn dispatch_binary_message(
        &self,
        session_id: u64,
        payload: Bytes,
        handler: &Option<MessageHandler>,
    ) {
        let Some(handler) = handler else {
            warn!(session_id, "no binary message handler installed, dropping frame");
            return;
        };
        let handler = Arc::clone(handler);
        let shared = self.clone();
        let deadline = self.inner.request_timeout;
        tokio::spawn(async move {
            let reply = match timeout(deadline, handler(session_id, payload)).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    error!(session_id, error = %e, "binary handler error");
                    Bytes::from(error_envelope("handler error"))
                }
                Err(_) => {
                    warn!(session_id, "binary request timed out");
                    Bytes::from(error_envelope("request timed out"))
                }
            };
            shared.send_binary_reply(session_id, &reply);
        });
    }

    fn send_binary_reply(&self, session_id: u64, payload: &[u8]) {
        match self.session(session_id) {
            Some(session) => session.send(codec::encode(payload)),
            None => debug!(session_id, "binary reply dropped, session gone"),
        }
    }

    fn send_ws_text(&self, session_id: u64, payload: &[u8]) {
        match self.session(session_id) {
            Some(session) => {
                let frame = WsFrame::text(payload.to_vec());
                session.send(Bytes::from(ws::encode_frame(&frame)));
            }
            None => debug!(session_id, "websocket reply dropped, session gone"),
        }
    }

    fn dispatch_udp_frame(
        &self,
        manager: &Arc<UdpSessionManager>,
        session_id: u64,
        datagram: Bytes,
        handler: &Option<MessageHandler>,
    ) {
        let Some(handler) = handler else {
            warn!(session_id, "no udp message handler installed, dropping datagram");
            return;
        };
        let payload = match codec::decode_with_limit(&datagram, self.inner.max_frame_size) {
            Ok(Some((payload, _consumed))) => payload,
            Ok(None) => {
                warn!(session_id, "truncated udp frame dropped");
                return;
            }
            Err(e) => {
                error!(session_id, error = %e, "udp framing error");
                return;
            }
        };

        let handler = Arc::clone(handler);
        let manager = Arc::clone(manager);
        let deadline = self.inner.request_timeout;
        tokio::spawn(async move {
            let reply = match timeout(deadline, handler(session_id, payload)).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    error!(session_id, error = %e, "udp handler error");
                    Bytes::from(error_envelope("handler error"))
                }
                Err(_) => {
                    warn!(session_id, "udp request timed out");
                    Bytes::from(error_envelope("request timed out"))
                }
            };
            manager.send_to(session_id, &codec::encode(&reply)).await;
        });
    }
}
