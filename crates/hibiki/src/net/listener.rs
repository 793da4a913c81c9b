//! TCP accept loop and connection registry

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::net::connection::{Connection, ConnectionHandler};
use crate::workers::WorkerPool;

/// Owns the strong references to live connections, keyed by id.
///
/// Everything else (the distributor in particular) resolves connections
/// by id through this map each time it needs one, so a disconnected
/// peer's memory is reclaimed as soon as its entry is removed.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<u32, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, conn: Arc<Connection>) {
        self.connections.lock().unwrap().insert(conn.id(), conn);
    }

    pub fn remove(&self, id: u32) -> Option<Arc<Connection>> {
        self.connections.lock().unwrap().remove(&id)
    }

    pub fn get(&self, id: u32) -> Option<Arc<Connection>> {
        self.connections.lock().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone out the current connections (short lock, no I/O under it).
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().unwrap().values().cloned().collect()
    }

    /// Close every connection and drop the strong references.
    pub fn close_all(&self) {
        let drained: Vec<_> = {
            let mut map = self.connections.lock().unwrap();
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in drained {
            conn.close();
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The TCP endpoint: bind/listen plus the accept loop.
pub struct TcpEndpoint {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    workers: Arc<WorkerPool>,
    handler: Arc<dyn ConnectionHandler>,

    running: AtomicBool,
    cancel: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    next_id: AtomicU32,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl TcpEndpoint {
    pub fn new(config: ServerConfig, handler: Arc<dyn ConnectionHandler>) -> Self {
        let workers = Arc::new(WorkerPool::new(config.thread_pool_size));
        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            workers,
            handler,
            running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
            next_id: AtomicU32::new(1),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn connections(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Address actually bound, once started (useful with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Lifetime count of accepted connections.
    pub fn total_accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Bind, listen, and spawn the accept loop.
    pub fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let addr_str = format!("{}:{}", self.config.listen_addr, self.config.port);
        let addr: SocketAddr = match addr_str.parse() {
            Ok(addr) => addr,
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(ServerError::InvalidAddr { addr: addr_str });
            }
        };

        let listener = match self.bind(addr) {
            Ok(listener) => listener,
            Err(source) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(ServerError::Bind {
                    addr: addr_str,
                    source,
                });
            }
        };

        let local = listener.local_addr().ok();
        *self.local_addr.lock().unwrap() = local;
        info!(addr = %local.map(|a| a.to_string()).unwrap_or(addr_str), "listening");

        let endpoint = Arc::clone(self);
        let handle = tokio::spawn(async move {
            endpoint.accept_loop(listener).await;
        });
        *self.accept_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop accepting, close every connection, shut the worker pool down.
    ///
    /// Idempotent; safe to call while connections are mid-receive.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let handle = self.accept_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.registry.close_all();
        self.workers.shutdown().await;
        info!("endpoint stopped");
    }

    fn bind(&self, addr: SocketAddr) -> std::io::Result<tokio::net::TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        if self.config.recv_buffer_size > 0 {
            // Kernel may clamp; best effort
            let _ = socket.set_recv_buffer_size(self.config.recv_buffer_size as u32);
        }
        if self.config.send_buffer_size > 0 {
            let _ = socket.set_send_buffer_size(self.config.send_buffer_size as u32);
        }
        socket.bind(addr)?;
        socket.listen(self.config.listen_backlog)
    }

    async fn accept_loop(self: Arc<Self>, listener: tokio::net::TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = listener.accept() => res,
            };

            match accepted {
                Ok((stream, peer)) => self.handle_accept(stream, peer).await,
                Err(e) => {
                    if !self.is_running() {
                        break;
                    }
                    error!(error = %e, "accept failed");
                }
            }
        }
        debug!("accept loop exiting");
    }

    async fn handle_accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if self.registry.len() >= self.config.max_connections {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(peer = %peer, "max connections reached, closing new connection");
            return; // dropping the stream closes it
        }

        let _ = stream.set_nodelay(true);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::spawn(
            id,
            stream,
            peer,
            self.config.recv_buffer_size,
            self.config.send_queue_len,
            self.config.send_timeout_ms,
            self.config.recv_timeout_ms,
        );

        self.registry.insert(Arc::clone(&conn));
        self.accepted.fetch_add(1, Ordering::Relaxed);

        // on_connect runs here, in the accept task
        self.handler.on_connect(&conn).await;

        let handler = Arc::clone(&self.handler);
        let registry = Arc::clone(&self.registry);
        let task_conn = Arc::clone(&conn);
        self.workers.submit(async move {
            task_conn.run_receive_loop(Arc::clone(&handler)).await;
            handler.on_disconnect(&task_conn).await;
            registry.remove(task_conn.id());
        });
    }
}
