// Master/slave reactor pair for the TCP listeners.
//
// One loop accepts, a fixed pool of loops services the accepted sessions.
// Each reactor is an OS thread running a current-thread tokio runtime; the
// slave runtimes are kept alive by a shutdown watch that plays the role of
// an explicit work guard. Accepted sockets are wrapped by a session-creator
// hook supplied by the gateway and handed off round-robin, so distribution
// over the pool is deterministic for the life of the process.

use crate::session::Session;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Hook that wraps an accepted socket into a [`Session`] with its callbacks
/// installed. Supplied by the gateway before `start`.
pub type SessionCreator = Box<dyn Fn(TcpStream, SocketAddr) -> Arc<Session> + Send + Sync>;

/// Resolve `host:port` and bind a listening socket with `SO_REUSEADDR` set.
pub(crate) async fn bind_listener(host: &str, port: u16) -> crate::Result<TcpListener> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    let addr = addrs
        .next()
        .ok_or_else(|| format!("no addresses resolved for {host}:{port}"))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(1024)?)
}

/// A single event loop owning a subset of sessions.
///
/// The reactor does not track the sessions posted to it; each session's run
/// loop holds the strong reference and self-terminates on close.
pub struct SlaveReactor {
    handle: tokio::runtime::Handle,
    shutdown_tx: watch::Sender<bool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl SlaveReactor {
    /// Spawn the reactor thread and its event loop.
    pub fn new() -> crate::Result<Self> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("shield-slave".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(e));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));

                debug!("slave reactor running");
                runtime.block_on(async move {
                    while shutdown_rx.changed().await.is_ok() {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                });
                debug!("slave reactor stopped");
            })?;

        let handle = handle_rx.recv()??;
        Ok(Self {
            handle,
            shutdown_tx,
            thread: Some(thread),
        })
    }

    /// Schedule the session's run loop on this reactor's thread.
    pub fn post_session(&self, session: Arc<Session>) {
        self.handle.spawn(session.run());
    }

    pub(crate) fn runtime_handle(&self) -> tokio::runtime::Handle {
        self.handle.clone()
    }

    /// Stop the event loop and join the thread. Sessions still running on
    /// the loop are dropped with it.
    pub fn stop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SlaveReactor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Listening acceptor distributing accepted sockets over a slave pool.
pub struct MasterReactor {
    host: String,
    port: u16,
    slaves: Vec<SlaveReactor>,
    session_creator: Option<SessionCreator>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: watch::Sender<bool>,
    master_thread: Option<std::thread::JoinHandle<()>>,
}

impl MasterReactor {
    /// Create the acceptor and spin up `num_slaves` slave reactors
    /// (clamped to at least one).
    pub fn new(host: impl Into<String>, port: u16, num_slaves: usize) -> crate::Result<Self> {
        let num_slaves = num_slaves.max(1);
        let mut slaves = Vec::with_capacity(num_slaves);
        for _ in 0..num_slaves {
            slaves.push(SlaveReactor::new()?);
        }
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            host: host.into(),
            port,
            slaves,
            session_creator: None,
            local_addr: None,
            shutdown_tx,
            master_thread: None,
        })
    }

    /// Install the hook that wraps accepted sockets. Connections accepted
    /// while no creator is set are dropped with a warning.
    pub fn set_session_creator(
        &mut self,
        creator: impl Fn(TcpStream, SocketAddr) -> Arc<Session> + Send + Sync + 'static,
    ) {
        self.session_creator = Some(Box::new(creator));
    }

    pub fn slave_count(&self) -> usize {
        self.slaves.len()
    }

    /// The bound address, available after `start` (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind, listen, and run the accept loop on a dedicated thread.
    /// Bind and listen failures are returned to the caller.
    pub fn start(&mut self) -> crate::Result<()> {
        if self.master_thread.is_some() {
            warn!("master reactor already running");
            return Ok(());
        }

        let host = self.host.clone();
        let port = self.port;
        let creator = self.session_creator.take();
        let slave_handles: Vec<tokio::runtime::Handle> =
            self.slaves.iter().map(|s| s.runtime_handle()).collect();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let (bound_tx, bound_rx) = std::sync::mpsc::channel::<crate::Result<SocketAddr>>();

        let thread = std::thread::Builder::new()
            .name("shield-master".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
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

                    let mut next_slave = 0usize;
                    loop {
                        tokio::select! {
                            accepted = listener.accept() => match accepted {
                                Ok((stream, peer)) => match &creator {
                                    Some(creator) => {
                                        let session = creator(stream, peer);
                                        slave_handles[next_slave].spawn(session.run());
                                        next_slave = (next_slave + 1) % slave_handles.len();
                                    }
                                    None => {
                                        warn!(peer = %peer, "no session creator set, dropping connection");
                                    }
                                },
                                Err(e) => error!(error = %e, "accept error"),
                            },
                            _ = shutdown_rx.changed() => {
                                if *shutdown_rx.borrow() {
                                    break;
                                }
                            }
                        }
                    }
                    // Dropping the listener here closes the acceptor before
                    // the slaves are stopped.
                });
            })?;
        self.master_thread = Some(thread);

        match bound_rx.recv()? {
            Ok(addr) => {
                self.local_addr = Some(addr);
                info!(addr = %addr, slaves = self.slaves.len(), "master reactor listening");
                Ok(())
            }
            Err(e) => {
                if let Some(thread) = self.master_thread.take() {
                    let _ = thread.join();
                }
                Err(e)
            }
        }
    }

    /// Close the acceptor, join the master thread, then stop and join each
    /// slave reactor.
    pub fn stop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(thread) = self.master_thread.take() {
            let _ = thread.join();
        }
        for slave in &mut self.slaves {
            slave.stop();
        }
        info!("master reactor stopped");
    }
}

impl Drop for MasterReactor {
    fn drop(&mut self) {
        self.stop();
    }
}
