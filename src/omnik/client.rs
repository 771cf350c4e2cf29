use crate::logging::Logger;
use crate::omnik::listener::ListenerInfo;
use crate::utils::Utils;

use {
    bytes::Bytes,
    std::net::SocketAddr,
    std::time::Duration,
    tokio::io::AsyncReadExt,
    tokio::net::TcpStream,
    tokio::sync::mpsc,
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
};

const READ_BUFFER_LEN: usize = 1024;

/// Identity of one accepted connection, cheap to clone into events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientHandle {
    pub id: u64,
    pub remote: SocketAddr,
    pub listener: ListenerInfo,
}

impl std::fmt::Display for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (listener {})", self.remote, self.listener)
    }
}

#[derive(Clone, Debug)]
pub enum ClientEvent {
    DataReceived(Bytes, ClientHandle),
    Disconnected(ClientHandle),
}

/// Owns one accepted socket and its read loop.
///
/// The loop starts as soon as the client is spawned. Every read of one or
/// more bytes is reported as `DataReceived`; end of stream, a read error,
/// the idle timeout or `disconnect()` end the loop, after which exactly one
/// `Disconnected` is sent and the socket is dropped.
pub struct ConnectedClient {
    handle: ClientHandle,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ConnectedClient {
    pub fn spawn(
        stream: TcpStream,
        handle: ClientHandle,
        idle_timeout: Option<Duration>,
        events: mpsc::UnboundedSender<ClientEvent>,
        logger: Logger,
    ) -> Self {
        let cancel = CancellationToken::new();

        let task = tokio::spawn(Self::receiver(
            stream,
            handle.clone(),
            idle_timeout,
            events,
            cancel.clone(),
            logger,
        ));

        Self {
            handle,
            cancel,
            task: Some(task),
        }
    }

    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    /// Asks the read loop to stop. Safe to call any number of times.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    /// Disconnects and waits for the read loop to finish, so every event
    /// it produced has been sent by the time this returns.
    pub async fn shutdown(mut self) {
        self.disconnect();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    async fn receiver(
        mut stream: TcpStream,
        handle: ClientHandle,
        idle_timeout: Option<Duration>,
        events: mpsc::UnboundedSender<ClientEvent>,
        cancel: CancellationToken,
        logger: Logger,
    ) {
        let mut buf = [0u8; READ_BUFFER_LEN];

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    logger.debug(format_args!("disconnecting client {}", handle));
                    break;
                }
                r = Self::read_with_timeout(&mut stream, &mut buf, idle_timeout) => r,
            };

            match read {
                Ok(Some(0)) => {
                    logger.debug(format_args!("client {} closed the connection", handle));
                    break;
                }
                Ok(Some(len)) => {
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    logger.trace(format_args!(
                        "RX {} bytes from {}: {}",
                        len,
                        handle,
                        Utils::hex(&data)
                    ));
                    if events
                        .send(ClientEvent::DataReceived(data, handle.clone()))
                        .is_err()
                    {
                        // nobody is listening any more
                        break;
                    }
                }
                Ok(None) => {
                    logger.info(format_args!(
                        "client {} idle for {}s, disconnecting",
                        handle,
                        idle_timeout.map(|d| d.as_secs()).unwrap_or_default()
                    ));
                    break;
                }
                Err(e) => {
                    logger.debug(format_args!("read error from client {}: {}", handle, e));
                    break;
                }
            }
        }

        drop(stream);
        let _ = events.send(ClientEvent::Disconnected(handle.clone()));
        logger.info(format_args!("disconnected from client {}", handle));
    }

    // Ok(None) means the idle timeout expired
    async fn read_with_timeout(
        stream: &mut TcpStream,
        buf: &mut [u8],
        idle_timeout: Option<Duration>,
    ) -> std::io::Result<Option<usize>> {
        match idle_timeout {
            Some(duration) => match tokio::time::timeout(duration, stream.read(buf)).await {
                Ok(r) => r.map(Some),
                Err(_) => Ok(None),
            },
            None => stream.read(buf).await.map(Some),
        }
    }
}

impl Drop for ConnectedClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
