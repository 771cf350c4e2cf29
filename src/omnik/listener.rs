use crate::error::{Error, Result};
use crate::logging::Logger;
use crate::omnik::client::{ClientEvent, ClientHandle, ConnectedClient};

use {
    bytes::Bytes,
    net2::TcpStreamExt,
    std::collections::BTreeMap,
    std::net::{IpAddr, Ipv4Addr, SocketAddr},
    std::sync::atomic::{AtomicU64, Ordering},
    std::sync::{Arc, Mutex},
    std::time::Duration,
    tokio::net::{TcpListener, TcpStream},
    tokio::sync::mpsc,
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
};

// back off briefly when accept() itself fails, e.g. out of file descriptors
const ACCEPT_ERROR_DELAY_MS: u64 = 100;

/// Name and port of a listener, carried in every event it emits.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerInfo {
    pub name: String,
    pub port: u16,
}

impl std::fmt::Display for ListenerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at TCP {}", self.name, self.port)
    }
}

#[derive(Clone, Debug)]
pub enum ListenerEvent {
    Ready(ListenerInfo),
    ClientConnected(ClientHandle),
    DataReceived(Bytes, ClientHandle),
    ClientDisconnected(SocketAddr, ListenerInfo),
}
pub type Sender = mpsc::UnboundedSender<ListenerEvent>;
pub type Receiver = mpsc::UnboundedReceiver<ListenerEvent>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ListenerState {
    Stopped,
    Listening,
}

type ClientSet = Arc<Mutex<BTreeMap<u64, ConnectedClient>>>;

struct Running {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
    relay_task: JoinHandle<()>,
}

/// Passive socket accepting pushes from devices.
pub struct Listener {
    info: ListenerInfo,
    bind_address: IpAddr,
    idle_timeout: Option<Duration>,
    events: Sender,
    logger: Logger,
    clients: ClientSet,
    next_client_id: Arc<AtomicU64>,
    running: Option<Running>,
}

impl Listener {
    pub fn new(name: &str, port: u32, events: Sender) -> Result<Self> {
        if !(1..=65535).contains(&port) {
            return Err(Error::InvalidPort(port));
        }

        Ok(Self {
            info: ListenerInfo {
                name: name.to_string(),
                port: port as u16,
            },
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            idle_timeout: None,
            events,
            logger: Logger::noop(),
            clients: Arc::new(Mutex::new(BTreeMap::new())),
            next_client_id: Arc::new(AtomicU64::new(1)),
            running: None,
        })
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = address;
        self
    }

    /// Clients silent for longer than this are disconnected. `None` waits
    /// forever.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn info(&self) -> &ListenerInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn port(&self) -> u16 {
        self.info.port
    }

    pub fn state(&self) -> ListenerState {
        match self.running {
            Some(_) => ListenerState::Listening,
            None => ListenerState::Stopped,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.state() == ListenerState::Listening
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub fn connection_count(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or_default()
    }

    pub fn connections(&self) -> Vec<ClientHandle> {
        self.clients
            .lock()
            .map(|c| c.values().map(|client| client.handle().clone()).collect())
            .unwrap_or_default()
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            self.logger.warn(format_args!(
                "listener {} was already active, closing it before reopening",
                self.info
            ));
            self.stop().await;
        }

        self.logger
            .debug(format_args!("starting listener {}", self.info));

        let socket = match TcpListener::bind((self.bind_address, self.info.port)).await {
            Ok(socket) => socket,
            Err(source) => {
                self.logger.error(format_args!(
                    "unable to start listener {}: {}",
                    self.info, source
                ));
                return Err(Error::BindFailed {
                    name: self.info.name.clone(),
                    port: self.info.port,
                    source,
                });
            }
        };
        let local_addr = socket.local_addr().map_err(|source| Error::BindFailed {
            name: self.info.name.clone(),
            port: self.info.port,
            source,
        })?;

        self.logger
            .info(format_args!("listening on {}", self.info));
        let _ = self.events.send(ListenerEvent::Ready(self.info.clone()));

        let cancel = CancellationToken::new();
        let (client_tx, client_rx) = mpsc::unbounded_channel();

        let accept_task = tokio::spawn(Self::acceptor(
            socket,
            self.info.clone(),
            self.clients.clone(),
            self.next_client_id.clone(),
            self.idle_timeout,
            client_tx,
            self.events.clone(),
            cancel.clone(),
            self.logger.clone(),
        ));

        let relay_task = tokio::spawn(Self::relay(
            client_rx,
            self.info.clone(),
            self.clients.clone(),
            self.events.clone(),
        ));

        self.running = Some(Running {
            local_addr,
            cancel,
            accept_task,
            relay_task,
        });

        Ok(())
    }

    /// Disconnects every client, then releases the socket. Each client goes
    /// through the same `ClientDisconnected` path as a normal disconnect.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        self.logger
            .debug(format_args!("closing listener {}", self.info));

        running.cancel.cancel();
        let _ = running.accept_task.await;

        loop {
            let next = match self.clients.lock() {
                Ok(mut clients) => clients.pop_first(),
                Err(_) => None,
            };
            let Some((_, client)) = next else {
                break;
            };
            client.shutdown().await;
        }

        // the acceptor and every client have dropped their senders by now,
        // so the relay drains what is left and exits
        let _ = running.relay_task.await;

        self.logger
            .info(format_args!("listener {} has been closed", self.info));
    }

    #[allow(clippy::too_many_arguments)]
    async fn acceptor(
        socket: TcpListener,
        info: ListenerInfo,
        clients: ClientSet,
        next_client_id: Arc<AtomicU64>,
        idle_timeout: Option<Duration>,
        client_tx: mpsc::UnboundedSender<ClientEvent>,
        events: Sender,
        cancel: CancellationToken,
        logger: Logger,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                r = socket.accept() => r,
            };

            let (stream, remote) = match accepted {
                Ok(r) => r,
                Err(e) => {
                    logger.warn(format_args!("accept failed on listener {}: {}", info, e));
                    tokio::time::sleep(Duration::from_millis(ACCEPT_ERROR_DELAY_MS)).await;
                    continue;
                }
            };

            let stream = match Self::configure(stream) {
                Ok(stream) => stream,
                Err(e) => {
                    logger.warn(format_args!("dropping client {}: {}", remote, e));
                    continue;
                }
            };

            let handle = ClientHandle {
                id: next_client_id.fetch_add(1, Ordering::Relaxed),
                remote,
                listener: info.clone(),
            };
            logger.info(format_args!("client connected to {} from {}", info, remote));

            // hold the lock across spawn so the relay cannot see this
            // client's disconnect before it is registered
            let Ok(mut set) = clients.lock() else {
                break;
            };
            let _ = events.send(ListenerEvent::ClientConnected(handle.clone()));
            let client = ConnectedClient::spawn(
                stream,
                handle.clone(),
                idle_timeout,
                client_tx.clone(),
                logger.clone(),
            );
            set.insert(handle.id, client);
        }

        logger.debug(format_args!("accept loop for {} exiting", info));
    }

    async fn relay(
        mut client_rx: mpsc::UnboundedReceiver<ClientEvent>,
        info: ListenerInfo,
        clients: ClientSet,
        events: Sender,
    ) {
        while let Some(event) = client_rx.recv().await {
            match event {
                ClientEvent::DataReceived(data, handle) => {
                    let _ = events.send(ListenerEvent::DataReceived(data, handle));
                }
                ClientEvent::Disconnected(handle) => {
                    let removed = clients
                        .lock()
                        .ok()
                        .and_then(|mut set| set.remove(&handle.id));
                    if let Some(client) = removed {
                        client.disconnect();
                    }
                    let _ = events.send(ListenerEvent::ClientDisconnected(
                        handle.remote,
                        info.clone(),
                    ));
                }
            }
        }
    }

    // linger of zero makes closes immediate instead of lingering on unsent data
    fn configure(stream: TcpStream) -> std::io::Result<TcpStream> {
        let std_stream = stream.into_std()?;
        TcpStreamExt::set_linger(&std_stream, Some(Duration::ZERO))?;
        TcpStream::from_std(std_stream)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            if let Ok(mut clients) = self.clients.lock() {
                for client in clients.values() {
                    client.disconnect();
                }
                clients.clear();
            }
        }
    }
}
