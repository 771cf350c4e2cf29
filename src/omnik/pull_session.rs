use crate::error::Error;
use crate::logging::Logger;
use crate::omnik::packet::FrameCodec;
use crate::utils::Utils;

use {
    bytes::Bytes,
    net2::TcpStreamExt,
    std::sync::{Arc, Mutex},
    std::time::Duration,
    tokio::io::{AsyncReadExt, AsyncWriteExt},
    tokio::net::TcpStream,
    tokio::sync::mpsc,
};

const READ_BUFFER_LEN: usize = 1024;
const TCP_KEEPALIVE_SECS: u64 = 60;

/// Identity of one pull attempt, carried in its events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: u64,
    pub address: String,
    pub port: u16,
    pub serial: String,
}

impl std::fmt::Display for SessionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} (serial {})", self.address, self.port, self.serial)
    }
}

impl SessionInfo {
    /// Failure reason for a request that could not be written. A socket
    /// the peer already closed gets its own message.
    pub fn write_failure_reason(&self, e: &std::io::Error) -> String {
        match e.kind() {
            std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => {
                format!("can't send to {} because the connection is closed", self)
            }
            _ => format!("failed to send request to {}: {}", self, e),
        }
    }
}

#[derive(Clone, Debug)]
pub enum SessionEvent {
    DataReceived(Bytes, SessionInfo),
    Failed { session: SessionInfo, reason: String },
    Finished(SessionInfo, PullState),
}
pub type Sender = mpsc::UnboundedSender<SessionEvent>;
pub type Receiver = mpsc::UnboundedReceiver<SessionEvent>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PullState {
    Idle,
    Connecting,
    AwaitingResponse,
    Completed,
    Failed,
}

impl PullState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PullState::Completed | PullState::Failed)
    }
}

/// Connect/read bounds for outbound sessions. `None` waits forever.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Option<Duration>,
    pub read: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Some(Duration::from_secs(10)),
            read: Some(Duration::from_secs(30)),
        }
    }
}

impl Timeouts {
    pub fn unbounded() -> Self {
        Self {
            connect: None,
            read: None,
        }
    }
}

enum ReadOutcome {
    Data(usize),
    Closed,
    TimedOut,
    Error(std::io::Error),
}

/// One outbound request/response exchange with a device.
///
/// Runs `Idle -> Connecting -> AwaitingResponse -> Completed`, or ends in
/// `Failed`. Nothing is retried. A connect or write failure is reported as
/// `SessionEvent::Failed`; a device that hangs up or errors before sending
/// anything is only logged unless `report_read_failures` is set.
pub struct PullSession {
    info: SessionInfo,
    timeouts: Timeouts,
    report_read_failures: bool,
    state: Arc<Mutex<PullState>>,
    events: Sender,
    logger: Logger,
}

impl PullSession {
    pub fn new(id: u64, address: &str, port: u16, serial: &str, events: Sender) -> Self {
        Self {
            info: SessionInfo {
                id,
                address: address.to_string(),
                port,
                serial: serial.to_string(),
            },
            timeouts: Timeouts::default(),
            report_read_failures: false,
            state: Arc::new(Mutex::new(PullState::Idle)),
            events,
            logger: Logger::noop(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_report_read_failures(mut self, report: bool) -> Self {
        self.report_read_failures = report;
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn state(&self) -> PullState {
        self.state.lock().map(|s| *s).unwrap_or(PullState::Failed)
    }

    /// Shared view of the state, for observing a session that has been
    /// moved into its own task.
    pub fn state_handle(&self) -> Arc<Mutex<PullState>> {
        self.state.clone()
    }

    fn set_state(&self, state: PullState) {
        if let Ok(mut s) = self.state.lock() {
            *s = state;
        }
    }

    /// Runs the whole exchange and returns the terminal state. The outcome
    /// is also visible through events, so callers may spawn this and forget
    /// about it.
    pub async fn retrieve_data(self) -> PullState {
        let state = self.run().await;
        self.set_state(state);
        let _ = self
            .events
            .send(SessionEvent::Finished(self.info.clone(), state));
        state
    }

    async fn run(&self) -> PullState {
        self.set_state(PullState::Connecting);
        self.logger.debug(format_args!(
            "connecting to {} to pull data",
            self.info
        ));

        let mut stream = match self.connect().await {
            Ok(stream) => stream,
            Err(e) => return self.fail(&e.to_string()),
        };

        // built fresh for every attempt, never cached
        let frame = match FrameCodec::encode(&self.info.serial) {
            Ok(frame) => frame,
            Err(e) => return self.fail(&e.to_string()),
        };

        self.logger.debug(format_args!(
            "TX request to {}: {}",
            self.info,
            Utils::hex(frame.as_bytes())
        ));

        if let Err(e) = self.write(&mut stream, frame.as_bytes()).await {
            return self.fail(&e);
        }

        self.set_state(PullState::AwaitingResponse);

        let mut buf = [0u8; READ_BUFFER_LEN];
        let mut completed = false;

        loop {
            match self.read(&mut stream, &mut buf).await {
                ReadOutcome::Data(len) => {
                    let data = Bytes::copy_from_slice(&buf[..len]);
                    self.logger.debug(format_args!(
                        "RX {} bytes from {}: {}",
                        len,
                        self.info,
                        Utils::hex(&data)
                    ));
                    if !completed {
                        completed = true;
                        self.set_state(PullState::Completed);
                    }
                    let _ = self
                        .events
                        .send(SessionEvent::DataReceived(data, self.info.clone()));
                }
                ReadOutcome::Closed if completed => break,
                ReadOutcome::TimedOut if completed => break,
                ReadOutcome::Error(_) if completed => break,
                ReadOutcome::Closed => {
                    return self.read_failed("disconnected after data pull request");
                }
                ReadOutcome::TimedOut => {
                    return self.read_failed("no reply to data pull request");
                }
                ReadOutcome::Error(e) => {
                    return self.read_failed(&format!("disconnected while delivering data: {}", e));
                }
            }
        }

        self.logger
            .debug(format_args!("pull session to {} completed", self.info));
        PullState::Completed
    }

    async fn connect(&self) -> Result<TcpStream, Error> {
        let target = (self.info.address.as_str(), self.info.port);
        let connect_failed = |reason: String| Error::ConnectFailed {
            address: self.info.address.clone(),
            port: self.info.port,
            reason,
        };

        let stream = match self.timeouts.connect {
            Some(limit) => match tokio::time::timeout(limit, TcpStream::connect(target)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(connect_failed(e.to_string())),
                Err(_) => {
                    return Err(connect_failed(format!(
                        "connection timeout after {} seconds",
                        limit.as_secs()
                    )))
                }
            },
            None => TcpStream::connect(target)
                .await
                .map_err(|e| connect_failed(e.to_string()))?,
        };

        let std_stream = stream
            .into_std()
            .map_err(|e| connect_failed(e.to_string()))?;
        if let Err(e) =
            TcpStreamExt::set_keepalive(&std_stream, Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        {
            self.logger
                .warn(format_args!("failed to set TCP keepalive: {}", e));
        }
        let stream = TcpStream::from_std(std_stream).map_err(|e| connect_failed(e.to_string()))?;

        if let Err(e) = stream.set_nodelay(true) {
            self.logger
                .warn(format_args!("failed to set TCP_NODELAY: {}", e));
        }

        self.logger
            .info(format_args!("connected to {}", self.info));
        Ok(stream)
    }

    async fn write(&self, stream: &mut TcpStream, bytes: &[u8]) -> Result<(), String> {
        let result = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        };

        let result = match self.timeouts.read {
            Some(limit) => match tokio::time::timeout(limit, result).await {
                Ok(r) => r,
                Err(_) => return Err(format!("write timeout after {} seconds", limit.as_secs())),
            },
            None => result.await,
        };

        result.map_err(|e| self.info.write_failure_reason(&e))
    }

    async fn read(&self, stream: &mut TcpStream, buf: &mut [u8]) -> ReadOutcome {
        let result = match self.timeouts.read {
            Some(limit) => match tokio::time::timeout(limit, stream.read(buf)).await {
                Ok(r) => r,
                Err(_) => return ReadOutcome::TimedOut,
            },
            None => stream.read(buf).await,
        };

        match result {
            Ok(0) => ReadOutcome::Closed,
            Ok(len) => ReadOutcome::Data(len),
            Err(e) => ReadOutcome::Error(e),
        }
    }

    fn fail(&self, reason: &str) -> PullState {
        self.logger
            .warn(format_args!("pull session to {} failed: {}", self.info, reason));
        let _ = self.events.send(SessionEvent::Failed {
            session: self.info.clone(),
            reason: reason.to_string(),
        });
        PullState::Failed
    }

    fn read_failed(&self, reason: &str) -> PullState {
        if self.report_read_failures {
            return self.fail(reason);
        }

        self.logger
            .info(format_args!("{} {}", self.info, reason));
        PullState::Failed
    }
}
