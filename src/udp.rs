// ABOUTME: Virtual session tracking over a connectionless UDP socket
// ABOUTME: Sessions are keyed by remote endpoint and expire after idle timeout

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Default idle timeout after which a virtual session is expired.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Default period of the expiry sweep.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Invoked for every datagram with the resolved session id, the payload and
/// the sending endpoint. Datagrams from a single endpoint are delivered in
/// arrival order.
pub type ReceiveCallback = Box<dyn FnMut(u64, &[u8], SocketAddr) + Send>;

/// Invoked once for each session removed by the expiry sweep.
pub type TimeoutCallback = Box<dyn FnMut(u64) + Send>;

struct UdpEntry {
    endpoint: SocketAddr,
    last_activity: Instant,
}

#[derive(Default)]
struct SessionTables {
    by_key: HashMap<String, u64>,
    by_id: HashMap<u64, UdpEntry>,
}

fn endpoint_key(endpoint: &SocketAddr) -> String {
    format!("{}:{}", endpoint.ip(), endpoint.port())
}

/// Emulates connection state over a single datagram socket.
///
/// A session is created lazily on the first datagram from an unknown
/// endpoint and holds its id for the rest of its life; at most one session
/// exists per distinct endpoint. Every send or receive touching a session
/// refreshes its activity timestamp, and a periodic sweep expires sessions
/// idle for longer than the configured timeout.
///
/// The receive loop and the expiry timer run on one task inside the
/// [`UdpReactor`]'s runtime; the session tables are guarded by an internal
/// mutex so that reply paths on other threads can resolve endpoints without
/// racing the sweep. Callbacks are always invoked outside the lock.
pub struct UdpSessionManager {
    socket: UdpSocket,
    tables: Mutex<SessionTables>,
    next_id: AtomicU64,
    session_timeout: Duration,
    cleanup_interval: Duration,
    on_receive: Mutex<Option<ReceiveCallback>>,
    on_timeout: Mutex<Option<TimeoutCallback>>,
    shutdown_tx: watch::Sender<bool>,
    running: AtomicBool,
}

impl UdpSessionManager {
    /// Bind the datagram socket. Bind failures propagate to the caller.
    pub async fn bind(
        host: &str,
        port: u16,
        session_timeout: Duration,
        cleanup_interval: Duration,
    ) -> crate::Result<Arc<Self>> {
        let socket = UdpSocket::bind((host, port)).await?;
        let addr = socket.local_addr()?;
        info!(%addr, "udp session manager bound");
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            socket,
            tables: Mutex::new(SessionTables::default()),
            next_id: AtomicU64::new(1),
            session_timeout,
            cleanup_interval,
            on_receive: Mutex::new(None),
            on_timeout: Mutex::new(None),
            shutdown_tx,
            running: AtomicBool::new(false),
        }))
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn set_on_receive(&self, callback: impl FnMut(u64, &[u8], SocketAddr) + Send + 'static) {
        *self.on_receive.lock().unwrap() = Some(Box::new(callback));
    }

    pub fn set_on_timeout(&self, callback: impl FnMut(u64) + Send + 'static) {
        *self.on_timeout.lock().unwrap() = Some(Box::new(callback));
    }

    /// Resolve the session id for an endpoint, creating one on first
    /// contact. Refreshes the activity timestamp of an existing session.
    pub fn get_or_create_session_id(&self, endpoint: SocketAddr) -> u64 {
        let key = endpoint_key(&endpoint);
        let mut tables = self.tables.lock().unwrap();

        if let Some(&id) = tables.by_key.get(&key)
            && let Some(entry) = tables.by_id.get_mut(&id)
        {
            entry.last_activity = Instant::now();
            return id;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tables.by_key.insert(key, id);
        tables.by_id.insert(
            id,
            UdpEntry {
                endpoint,
                last_activity: Instant::now(),
            },
        );
        debug!(session_id = id, endpoint = %endpoint, "created udp session");
        id
    }

    /// Drop a session from both tables. Unknown ids are ignored.
    pub fn remove_session(&self, session_id: u64) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(entry) = tables.by_id.remove(&session_id) {
            tables.by_key.remove(&endpoint_key(&entry.endpoint));
            debug!(session_id, "removed udp session");
        }
    }

    pub fn session_endpoint(&self, session_id: u64) -> Option<SocketAddr> {
        self.tables
            .lock()
            .unwrap()
            .by_id
            .get(&session_id)
            .map(|entry| entry.endpoint)
    }

    pub fn active_sessions(&self) -> usize {
        self.tables.lock().unwrap().by_id.len()
    }

    /// Send to a raw endpoint. A failure is logged and the session (if any)
    /// is retained; UDP is lossy by contract.
    pub async fn send_to_endpoint(&self, endpoint: SocketAddr, data: &[u8]) {
        if !self.running.load(Ordering::SeqCst) {
            warn!("send on stopped udp session manager dropped");
            return;
        }
        match self.socket.send_to(data, endpoint).await {
            Ok(sent) => trace!(endpoint = %endpoint, bytes = sent, "udp sent"),
            Err(e) => error!(endpoint = %endpoint, error = %e, "udp send failed"),
        }
    }

    /// Send addressed by session id, refreshing the session's activity.
    /// Sending to an id that no longer exists is a no-op with a warning.
    pub async fn send_to(&self, session_id: u64, data: &[u8]) {
        let endpoint = {
            let mut tables = self.tables.lock().unwrap();
            tables.by_id.get_mut(&session_id).map(|entry| {
                entry.last_activity = Instant::now();
                entry.endpoint
            })
        };
        match endpoint {
            Some(endpoint) => self.send_to_endpoint(endpoint, data).await,
            None => warn!(session_id, "send to unknown udp session dropped"),
        }
    }

    /// Expire every session idle since before `now - session_timeout`.
    /// Fires `on_timeout` exactly once per expired session, then removes it.
    fn cleanup_expired_sessions(&self, now: Instant) -> Vec<u64> {
        let expired: Vec<u64> = {
            let tables = self.tables.lock().unwrap();
            tables
                .by_id
                .iter()
                .filter(|(_, entry)| {
                    now.saturating_duration_since(entry.last_activity) > self.session_timeout
                })
                .map(|(&id, _)| id)
                .collect()
        };

        for &session_id in &expired {
            if let Some(callback) = self.on_timeout.lock().unwrap().as_mut() {
                callback(session_id);
            }
            self.remove_session(session_id);
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "cleaned up expired udp sessions");
        }
        expired
    }

    /// Signal the run loop to exit and clear the tables.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        let mut tables = self.tables.lock().unwrap();
        tables.by_key.clear();
        tables.by_id.clear();
        info!("udp session manager stopped");
    }

    /// Drive the receive loop and the expiry timer until `stop`.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let mut on_receive = self.on_receive.lock().unwrap().take();

        let mut cleanup = tokio::time::interval_at(
            tokio::time::Instant::now() + self.cleanup_interval,
            self.cleanup_interval,
        );
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, peer)) if n > 0 => {
                        let session_id = self.get_or_create_session_id(peer);
                        if let Some(callback) = on_receive.as_mut() {
                            callback(session_id, &buf[..n], peer);
                        }
                        trace!(session_id, peer = %peer, bytes = n, "udp received");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if self.running.load(Ordering::SeqCst) {
                            error!(error = %e, "udp receive error");
                        }
                    }
                },
                _ = cleanup.tick() => {
                    self.cleanup_expired_sessions(Instant::now());
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("udp session manager loop exited");
    }
}

/// Thread pool driving the UDP socket's event loop.
///
/// Owns a multi-threaded runtime with `workers` threads sharing one I/O
/// context and runs the session manager on it. `stop` signals the manager,
/// then shuts the runtime down and joins the workers.
pub struct UdpReactor {
    host: String,
    port: u16,
    workers: usize,
    session_timeout: Duration,
    cleanup_interval: Duration,
    runtime: Option<tokio::runtime::Runtime>,
    manager: Option<Arc<UdpSessionManager>>,
}

impl UdpReactor {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        workers: usize,
        session_timeout: Duration,
        cleanup_interval: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            workers: workers.max(1),
            session_timeout,
            cleanup_interval,
            runtime: None,
            manager: None,
        }
    }

    /// The running session manager, for reply paths.
    pub fn manager(&self) -> Option<&Arc<UdpSessionManager>> {
        self.manager.as_ref()
    }

    /// Bind the socket, let `configure` install the callbacks, then start
    /// the manager loop on the worker pool. Bind failures propagate.
    pub fn start<F>(&mut self, configure: F) -> crate::Result<()>
    where
        F: FnOnce(&Arc<UdpSessionManager>),
    {
        if self.runtime.is_some() {
            warn!("udp reactor already running");
            return Ok(());
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.workers)
            .thread_name("shield-udp")
            .enable_all()
            .build()?;

        let manager = runtime.block_on(UdpSessionManager::bind(
            &self.host,
            self.port,
            self.session_timeout,
            self.cleanup_interval,
        ))?;
        configure(&manager);

        // Mark running before the loop is scheduled so an immediate stop()
        // still observes it and signals shutdown.
        manager.running.store(true, Ordering::SeqCst);
        runtime.spawn(Arc::clone(&manager).run());
        info!(port = self.port, workers = self.workers, "udp reactor started");

        self.manager = Some(manager);
        self.runtime = Some(runtime);
        Ok(())
    }

    /// Stop the manager and join the worker threads.
    pub fn stop(&mut self) {
        if let Some(manager) = self.manager.take() {
            manager.stop();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(5));
        }
        info!("udp reactor stopped");
    }
}

impl Drop for UdpReactor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    async fn manager_with_defaults() -> Arc<UdpSessionManager> {
        UdpSessionManager::bind(
            "127.0.0.1",
            0,
            DEFAULT_SESSION_TIMEOUT,
            DEFAULT_CLEANUP_INTERVAL,
        )
        .await
        .unwrap()
    }

    fn endpoint(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn same_endpoint_resolves_to_same_session() {
        let manager = manager_with_defaults().await;

        let first = manager.get_or_create_session_id(endpoint(40001));
        let second = manager.get_or_create_session_id(endpoint(40001));
        let other = manager.get_or_create_session_id(endpoint(40002));

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(manager.active_sessions(), 2);
    }

    #[tokio::test]
    async fn expired_sessions_fire_timeout_exactly_once() {
        let manager = UdpSessionManager::bind(
            "127.0.0.1",
            0,
            Duration::from_secs(300),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let fired = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        manager.set_on_timeout(move |id| sink.lock().unwrap().push(id));

        let idle = manager.get_or_create_session_id(endpoint(40010));
        std::thread::sleep(Duration::from_millis(50));
        let later = Instant::now();
        let fresh = manager.get_or_create_session_id(endpoint(40011));

        // Sweep at a point where only the idle session is past the timeout.
        let sweep_at = later + Duration::from_secs(300) - Duration::from_millis(10);
        let expired = manager.cleanup_expired_sessions(sweep_at);
        assert_eq!(expired, vec![idle]);
        assert_eq!(fired.lock().unwrap().as_slice(), &[idle]);
        assert_eq!(manager.session_endpoint(idle), None);
        assert!(manager.session_endpoint(fresh).is_some());

        // A second sweep must not fire the callback again.
        let expired = manager.cleanup_expired_sessions(sweep_at + Duration::from_secs(60));
        assert!(!expired.contains(&idle));
        assert_eq!(fired.lock().unwrap().iter().filter(|&&id| id == idle).count(), 1);
    }

    #[tokio::test]
    async fn send_to_unknown_session_is_a_no_op() {
        let manager = manager_with_defaults().await;
        manager.running.store(true, Ordering::SeqCst);
        // Must not panic or create state.
        manager.send_to(999, b"ping").await;
        assert_eq!(manager.active_sessions(), 0);
    }

    #[tokio::test]
    async fn receive_loop_tracks_sessions_and_delivers_in_order() {
        let manager = manager_with_defaults().await;
        let addr = manager.local_addr().unwrap();

        let seen: Arc<StdMutex<Vec<(u64, Vec<u8>)>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.set_on_receive(move |id, data, _peer| {
            sink.lock().unwrap().push((id, data.to_vec()));
        });

        let task = tokio::spawn(Arc::clone(&manager).run());

        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"one", addr).unwrap();
        client.send_to(b"two", addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().len() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1, b"one");
        assert_eq!(seen[1].1, b"two");
        // Same endpoint, same virtual session.
        assert_eq!(seen[0].0, seen[1].0);
        assert_eq!(manager.active_sessions(), 1);

        manager.stop();
        let _ = task.await;
    }
}
