use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;

use crate::domain::{BrokerError, Result};
use crate::infrastructure::client::{BodyReader, ClientEvents, SocketClient};
use crate::infrastructure::guard::ExecutionGuard;

/// Listen backlog for each bound address.
const LISTEN_BACKLOG: u32 = 8;

/// Accepts connections on the configured bind addresses and fans client
/// lifecycle and message callbacks out to one registered handler.
///
/// Each listener runs its own accept loop; each accepted connection gets its
/// own `SocketClient` read loop. Accepts and callback dispatch are gated by
/// the server's execution guard, so an accept or message completing after
/// `stop` has begun is ignored rather than racing the teardown.
pub struct SocketServer {
    bind_addrs: Vec<IpAddr>,
    port: u16,
    shared: Arc<ServerShared>,
    accept_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

struct ServerShared {
    guard: ExecutionGuard,
    clients: DashMap<u64, Arc<SocketClient>>,
    events: StdMutex<Option<Arc<dyn ClientEvents>>>,
}

impl SocketServer {
    /// `bind_addrs` empty means a single wildcard listener.
    pub fn new(bind_addrs: Vec<IpAddr>, port: u16) -> Self {
        Self {
            bind_addrs,
            port,
            shared: Arc::new(ServerShared {
                guard: ExecutionGuard::new(),
                clients: DashMap::new(),
                events: StdMutex::new(None),
            }),
            accept_tasks: StdMutex::new(Vec::new()),
        }
    }

    /// Registers the handler that receives started/stopped/message events.
    /// Must be called before `start`.
    pub fn register_events(&self, events: Arc<dyn ClientEvents>) {
        *lock(&self.shared.events) = Some(events);
    }

    /// Binds every configured address and starts its accept loop. Returns
    /// the bound local addresses (port 0 resolves to the real port).
    pub async fn start(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = if self.bind_addrs.is_empty() {
            vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port)]
        } else {
            self.bind_addrs
                .iter()
                .map(|ip| SocketAddr::new(*ip, self.port))
                .collect()
        };

        let mut local_addrs = Vec::with_capacity(addrs.len());
        let mut tasks = lock(&self.accept_tasks);
        for addr in addrs {
            let listener = bind(addr)?;
            let local = listener.local_addr()?;
            info!("listening on {local}");
            local_addrs.push(local);
            tasks.push(tokio::spawn(accept_loop(
                listener,
                Arc::clone(&self.shared),
            )));
        }
        Ok(local_addrs)
    }

    /// Sends one envelope to a connected client by id.
    pub async fn send_to(&self, client_id: u64, meta: &str, body: &[u8]) -> Result<()> {
        let client = self
            .shared
            .clients
            .get(&client_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(BrokerError::ClientNotFound(client_id))?;
        client.send(meta, body).await
    }

    pub fn client_ids(&self) -> Vec<u64> {
        self.shared.clients.iter().map(|entry| *entry.key()).collect()
    }

    /// Disables the guard (draining in-flight accepts and dispatches),
    /// closes the listeners and disposes every client. A second call fails
    /// with `AlreadyStopped`.
    pub async fn stop(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let performed = tokio::task::spawn_blocking(move || shared.guard.disable_execute())
            .await
            .map_err(|e| BrokerError::Storage(io::Error::other(e)))?;
        if !performed {
            return Err(BrokerError::AlreadyStopped);
        }

        for task in lock(&self.accept_tasks).drain(..) {
            task.abort();
        }

        let clients: Vec<Arc<SocketClient>> = self
            .shared
            .clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for client in clients {
            client.dispose().await;
        }
        self.shared.clients.clear();
        info!("socket server stopped");
        Ok(())
    }
}

fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_BACKLOG)?)
}

async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                // an accept that completes after stop() has begun is ignored
                let Some(_permit) = shared.guard.enter() else {
                    debug!("dropping connection from {peer}: server is stopping");
                    break;
                };
                match SocketClient::from_stream(stream) {
                    Ok(client) => {
                        debug!("accepted client {} from {peer}", client.id());
                        shared.clients.insert(client.id(), Arc::clone(&client));
                        client.start(Arc::new(ServerEvents {
                            shared: Arc::clone(&shared),
                        }));
                    }
                    Err(e) => error!("failed to set up connection from {peer}: {e}"),
                }
            }
            Err(e) => error!("accept failed: {e}"),
        }
    }
}

/// Adapter between a connection's read loop and the registered handler:
/// forwards events inside the server guard and keeps the client registry in
/// sync. Handler errors are logged and discarded so one bad handler cannot
/// take down the accept loop or another connection.
struct ServerEvents {
    shared: Arc<ServerShared>,
}

impl ServerEvents {
    fn registered(&self) -> Option<Arc<dyn ClientEvents>> {
        lock(&self.shared.events).clone()
    }
}

#[async_trait]
impl ClientEvents for ServerEvents {
    async fn on_started(&self, client: &Arc<SocketClient>) -> Result<()> {
        if let Some(events) = self.registered() {
            if let Err(e) = events.on_started(client).await {
                warn!("client {}: start handler failed: {e}", client.id());
            }
        }
        Ok(())
    }

    async fn on_stopped(&self, client: &Arc<SocketClient>) -> Result<()> {
        let Some(_permit) = self.shared.guard.enter() else {
            return Ok(());
        };
        if let Some(events) = self.registered() {
            if let Err(e) = events.on_stopped(client).await {
                warn!("client {}: stop handler failed: {e}", client.id());
            }
        }
        self.shared.clients.remove(&client.id());
        client.dispose().await;
        Ok(())
    }

    async fn on_message(
        &self,
        client: &Arc<SocketClient>,
        meta: &str,
        body_size: u64,
        body: &mut BodyReader<'_>,
    ) -> Result<()> {
        let Some(_permit) = self.shared.guard.enter() else {
            return Ok(());
        };
        if let Some(events) = self.registered() {
            if let Err(e) = events.on_message(client, meta, body_size, body).await {
                warn!("client {}: message handler failed: {e}", client.id());
            }
        }
        Ok(())
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
