// ABOUTME: TCP session abstraction binding an accepted socket to handler callbacks
// ABOUTME: Single read loop plus a FIFO write queue drained by one writer task

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Fixed size of the per-session read buffer.
pub const READ_BUFFER_SIZE: usize = 8 * 1024;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Invoked on every successful read with the bytes received.
pub type ReadCallback = Box<dyn FnMut(&[u8]) + Send>;

/// Invoked exactly once when the session is released.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

/// A logical TCP connection: the owned socket, its read loop, a serialized
/// write queue, and the two lifecycle callbacks.
///
/// A session is created by the master reactor's session-creator hook and
/// handed to a slave reactor, which spawns [`Session::run`] on its event
/// loop. The running task holds the strong `Arc`; the gateway's session
/// table keeps only a `Weak` back-reference, so a session that finishes its
/// loop releases its socket even if the table has not been cleaned up yet.
///
/// Invariants:
/// - one outstanding read at a time (a single read loop);
/// - writes complete in `send` order (a single writer task drains the queue);
/// - `close` is idempotent and `on_close` fires exactly once.
pub struct Session {
    id: u64,
    peer_addr: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
    write_tx: mpsc::UnboundedSender<Bytes>,
    write_rx: Mutex<Option<mpsc::UnboundedReceiver<Bytes>>>,
    on_read: Mutex<Option<ReadCallback>>,
    on_close: Mutex<Option<CloseCallback>>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl Session {
    /// Wrap an accepted socket. Ids are allocated from a process-wide
    /// monotonically increasing counter starting at 1.
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Arc<Self> {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            stream: Mutex::new(Some(stream)),
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            on_read: Mutex::new(None),
            on_close: Mutex::new(None),
            closed: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Install the read callback. Must be called before the session is
    /// posted to a reactor; later calls have no effect once the loop runs.
    pub fn set_on_read(&self, callback: impl FnMut(&[u8]) + Send + 'static) {
        *self.on_read.lock().unwrap() = Some(Box::new(callback));
    }

    /// Install the close callback.
    pub fn set_on_close(&self, callback: impl FnOnce() + Send + 'static) {
        *self.on_close.lock().unwrap() = Some(Box::new(callback));
    }

    /// Queue bytes for writing. Never blocks; bytes leave the socket in the
    /// order `send` was called. A write error closes the session with the
    /// tail unwritten.
    pub fn send(&self, data: Bytes) {
        if self.closed.load(Ordering::SeqCst) {
            debug!(session_id = self.id, "send on closed session dropped");
            return;
        }
        let _ = self.write_tx.send(data);
    }

    /// Shut the session down. Idempotent; safe to call from any thread.
    pub fn close(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The session's event loop: drives the read side and a companion
    /// writer task until EOF, an I/O error, or `close`.
    pub async fn run(self: Arc<Self>) {
        let stream = self.stream.lock().unwrap().take();
        let Some(stream) = stream else {
            return;
        };
        let write_rx = self.write_rx.lock().unwrap().take();
        let Some(mut write_rx) = write_rx else {
            return;
        };
        let mut on_read = self.on_read.lock().unwrap().take();

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut writer_shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            // Closed before it ever started.
            self.finish();
            return;
        }

        // The socket was accepted on the master reactor's loop; re-register
        // it with the loop this session runs on, so one slave reactor
        // services the session for its entire lifetime.
        let stream = match stream.into_std().and_then(TcpStream::from_std) {
            Ok(stream) => stream,
            Err(e) => {
                error!(session_id = self.id, error = %e, "failed to bind session socket to reactor");
                self.finish();
                return;
            }
        };

        info!(session_id = self.id, peer = %self.peer_addr, "session started");

        let (mut read_half, mut write_half) = stream.into_split();

        let writer = {
            let session = Arc::clone(&self);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        chunk = write_rx.recv() => match chunk {
                            Some(chunk) => {
                                if let Err(e) = write_half.write_all(&chunk).await {
                                    error!(session_id = session.id, error = %e, "session write error");
                                    session.close();
                                    break;
                                }
                            }
                            None => break,
                        },
                        _ = writer_shutdown_rx.changed() => {
                            // Flush whatever was queued before the close was
                            // requested, then stop.
                            while let Ok(chunk) = write_rx.try_recv() {
                                if write_half.write_all(&chunk).await.is_err() {
                                    break;
                                }
                            }
                            break;
                        }
                    }
                }
                let _ = write_half.shutdown().await;
            })
        };

        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!(session_id = self.id, "peer closed connection");
                        break;
                    }
                    Ok(n) => {
                        if let Some(callback) = on_read.as_mut() {
                            callback(&buf[..n]);
                        }
                    }
                    Err(e) => {
                        error!(session_id = self.id, error = %e, "session read error");
                        break;
                    }
                },
                _ = shutdown_rx.changed() => break,
            }
        }

        self.close();
        let _ = writer.await;
        self.finish();
    }

    fn finish(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(session_id = self.id, "session released");
            if let Some(callback) = self.on_close.lock().unwrap().take() {
                callback();
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (server, client, peer)
    }

    #[tokio::test]
    async fn ids_are_unique_and_increasing() {
        let (a, _ka, pa) = connected_pair().await;
        let (b, _kb, pb) = connected_pair().await;
        let first = Session::new(a, pa);
        let second = Session::new(b, pb);
        assert!(second.id() > first.id());
    }

    #[tokio::test]
    async fn read_callback_receives_bytes_and_eof_fires_close_once() {
        let (server, mut client, peer) = connected_pair().await;
        let session = Session::new(server, peer);

        let received = Arc::new(StdMutex::new(Vec::new()));
        let closes = Arc::new(AtomicU64::new(0));

        let sink = Arc::clone(&received);
        session.set_on_read(move |data| sink.lock().unwrap().extend_from_slice(data));
        let counter = Arc::clone(&closes);
        session.set_on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let task = tokio::spawn(Arc::clone(&session).run());

        client.write_all(b"hello").await.unwrap();
        client.shutdown().await.unwrap();
        task.await.unwrap();

        assert_eq!(received.lock().unwrap().as_slice(), b"hello");
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(session.is_closed());

        // Idempotent: a second close must not fire the callback again.
        session.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sends_are_written_in_order() {
        let (server, mut client, peer) = connected_pair().await;
        let session = Session::new(server, peer);
        let task = tokio::spawn(Arc::clone(&session).run());

        session.send(Bytes::from_static(b"first "));
        session.send(Bytes::from_static(b"second "));
        session.send(Bytes::from_static(b"third"));

        let mut out = vec![0u8; 18];
        client.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"first second third");

        session.close();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn queued_writes_are_flushed_on_close() {
        let (server, mut client, peer) = connected_pair().await;
        let session = Session::new(server, peer);
        let task = tokio::spawn(Arc::clone(&session).run());

        session.send(Bytes::from_static(b"goodbye"));
        session.close();
        task.await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(&out, b"goodbye");
    }
}
