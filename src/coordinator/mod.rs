use crate::channels::{Channels, Event};
use crate::error::{Error, Result};
use crate::logging::Logger;
use crate::omnik::listener::{self, Listener, ListenerEvent};
use crate::omnik::packet::FrameCodec;
use crate::omnik::pull_session::{self, PullSession, PullState, SessionEvent, SessionInfo, Timeouts};

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct EngineStats {
    pub push_frames_received: u64,
    pub pull_frames_received: u64,
    pub statistics_decoded: u64,
    pub decode_errors: u64,
    pub pull_sessions_started: u64,
    pub pull_sessions_completed: u64,
    pub pull_sessions_failed: u64,
    pub clients_connected: u64,
    pub clients_disconnected: u64,
    pub bind_failures: u64,
}

impl EngineStats {
    pub fn print_summary(&self, logger: &Logger) {
        logger.info(format_args!("Engine Statistics:"));
        logger.info(format_args!("  Frames received:"));
        logger.info(format_args!("    Push: {}", self.push_frames_received));
        logger.info(format_args!("    Pull: {}", self.pull_frames_received));
        logger.info(format_args!("  Decoding:"));
        logger.info(format_args!("    Statistics decoded: {}", self.statistics_decoded));
        logger.info(format_args!("    Errors: {}", self.decode_errors));
        logger.info(format_args!("  Pull sessions:"));
        logger.info(format_args!("    Started: {}", self.pull_sessions_started));
        logger.info(format_args!("    Completed: {}", self.pull_sessions_completed));
        logger.info(format_args!("    Failed: {}", self.pull_sessions_failed));
        logger.info(format_args!("  Connection Stats:"));
        logger.info(format_args!("    Clients connected: {}", self.clients_connected));
        logger.info(format_args!("    Clients disconnected: {}", self.clients_disconnected));
        logger.info(format_args!("    Bind failures: {}", self.bind_failures));
    }
}

/// Knobs shared by every listener and pull session the coordinator creates.
#[derive(Clone, Debug)]
pub struct CoordinatorOptions {
    pub bind_address: IpAddr,
    pub timeouts: Timeouts,
    pub client_idle: Option<Duration>,
    pub report_read_failures: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            timeouts: Timeouts::default(),
            client_idle: Some(Duration::from_secs(900)),
            report_read_failures: false,
        }
    }
}

type Slot<T> = Arc<Mutex<Option<T>>>;
type SessionSet = Arc<Mutex<BTreeMap<u64, (SessionInfo, JoinHandle<PullState>)>>>;

/// Owns the listeners and in-flight pull sessions and turns everything they
/// report into `Event`s on `Channels::events`.
///
/// Events only flow while `start()` is running, so spawn it before starting
/// listeners or pulling data.
#[derive(Clone)]
pub struct Coordinator {
    channels: Channels,
    options: CoordinatorOptions,
    logger: Logger,
    listeners: Arc<tokio::sync::Mutex<BTreeMap<String, Listener>>>,
    sessions: SessionSet,
    listener_tx: listener::Sender,
    listener_rx: Slot<listener::Receiver>,
    session_tx: pull_session::Sender,
    session_rx: Slot<pull_session::Receiver>,
    next_session_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
    pub stats: Arc<Mutex<EngineStats>>,
}

impl Coordinator {
    pub fn new(channels: Channels, options: CoordinatorOptions) -> Self {
        let (listener_tx, listener_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();

        Self {
            channels,
            options,
            logger: Logger::noop(),
            listeners: Arc::new(tokio::sync::Mutex::new(BTreeMap::new())),
            sessions: Arc::new(Mutex::new(BTreeMap::new())),
            listener_tx,
            listener_rx: Arc::new(Mutex::new(Some(listener_rx))),
            session_tx,
            session_rx: Arc::new(Mutex::new(Some(session_rx))),
            next_session_id: Arc::new(AtomicU64::new(1)),
            shutdown: CancellationToken::new(),
            stats: Arc::new(Mutex::new(EngineStats::default())),
        }
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn stats(&self) -> EngineStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn print_summary(&self) {
        self.stats().print_summary(&self.logger);
    }

    /// Event pump. Runs until `stop()` is called.
    pub async fn start(&self) -> Result<()> {
        futures::try_join!(self.listener_receiver(), self.session_receiver())?;

        Ok(())
    }

    /// Ends the event pump and abandons in-flight pull sessions. Listeners
    /// are left alone; call `stop_listeners()` first to drain them.
    pub fn stop(&self) {
        self.shutdown.cancel();

        if let Ok(mut sessions) = self.sessions.lock() {
            while let Some((_, (info, task))) = sessions.pop_first() {
                self.logger
                    .debug(format_args!("abandoning pull session to {}", info));
                task.abort();
            }
        }

        let _ = self.channels.events.send(Event::Shutdown);
    }

    /// Creates and starts one listener per `(name, port)` entry, in order.
    ///
    /// Names and ports are checked before anything is started. The first bind failure
    /// is reported as `Event::BindFailed` and returned; listeners started
    /// before it keep running.
    pub async fn start_listeners<I, S>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, u32)>,
        S: AsRef<str>,
    {
        let entries: Vec<(String, u32)> = entries
            .into_iter()
            .map(|(name, port)| (name.as_ref().to_string(), port))
            .collect();

        let mut listeners = self.listeners.lock().await;

        {
            let mut seen = HashSet::new();
            for (name, port) in &entries {
                if !(1..=65535).contains(port) {
                    return Err(Error::InvalidPort(*port));
                }
                if name.is_empty() {
                    return Err(Error::Configuration("listener name cannot be empty".into()));
                }
                if listeners.contains_key(name) || !seen.insert(name.as_str()) {
                    return Err(Error::Configuration(format!(
                        "duplicate listener name {}",
                        name
                    )));
                }
            }
        }

        for (name, port) in entries {
            let mut listener = Listener::new(&name, port, self.listener_tx.clone())?
                .with_logger(self.logger.clone())
                .with_bind_address(self.options.bind_address)
                .with_idle_timeout(self.options.client_idle);

            if let Err(e) = listener.start().await {
                if let Error::BindFailed { name, port, .. } = &e {
                    self.count(|s| s.bind_failures += 1);
                    let _ = self.channels.events.send(Event::BindFailed {
                        name: name.clone(),
                        port: *port,
                    });
                }
                return Err(e);
            }

            listeners.insert(name, listener);
        }

        Ok(())
    }

    /// Stops and forgets every listener.
    pub async fn stop_listeners(&self) {
        let mut listeners = self.listeners.lock().await;

        while let Some((_, mut listener)) = listeners.pop_first() {
            listener.stop().await;
        }
    }

    pub async fn listener_names(&self) -> Vec<String> {
        self.listeners.lock().await.keys().cloned().collect()
    }

    /// Starts one pull session in the background and returns its identity.
    /// The outcome arrives as `PullDataReceived`/`StatisticsAvailable` or
    /// `PullSessionFailed`.
    pub fn pull_data(&self, address: &str, port: u16, serial: &str) -> SessionInfo {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        let session = PullSession::new(id, address, port, serial, self.session_tx.clone())
            .with_timeouts(self.options.timeouts)
            .with_report_read_failures(self.options.report_read_failures)
            .with_logger(self.logger.clone());
        let info = session.info().clone();

        self.count(|s| s.pull_sessions_started += 1);

        // registered under the lock so the pump cannot see Finished first
        match self.sessions.lock() {
            Ok(mut sessions) => {
                let task = tokio::spawn(session.retrieve_data());
                sessions.insert(id, (info.clone(), task));
            }
            Err(_) => {
                tokio::spawn(session.retrieve_data());
            }
        }

        info
    }

    pub fn in_flight_sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .lock()
            .map(|s| s.values().map(|(info, _)| info.clone()).collect())
            .unwrap_or_default()
    }

    async fn listener_receiver(&self) -> Result<()> {
        let mut receiver = Self::take(&*self.listener_rx)?;

        loop {
            tokio::select! {
                biased;
                event = receiver.recv() => match event {
                    Some(event) => self.process_listener_event(event),
                    None => break,
                },
                _ = self.shutdown.cancelled() => break,
            }
        }

        while let Ok(event) = receiver.try_recv() {
            self.process_listener_event(event);
        }

        Ok(())
    }

    async fn session_receiver(&self) -> Result<()> {
        let mut receiver = Self::take(&*self.session_rx)?;

        loop {
            tokio::select! {
                biased;
                event = receiver.recv() => match event {
                    Some(event) => self.process_session_event(event),
                    None => break,
                },
                _ = self.shutdown.cancelled() => break,
            }
        }

        while let Ok(event) = receiver.try_recv() {
            self.process_session_event(event);
        }

        Ok(())
    }

    fn process_listener_event(&self, event: ListenerEvent) {
        let event = match event {
            ListenerEvent::Ready(info) => Event::ListenerReady(info),
            ListenerEvent::ClientConnected(handle) => {
                self.count(|s| s.clients_connected += 1);
                Event::ClientConnected(handle)
            }
            ListenerEvent::ClientDisconnected(remote, listener) => {
                self.count(|s| s.clients_disconnected += 1);
                Event::ClientDisconnected { remote, listener }
            }
            ListenerEvent::DataReceived(data, handle) => {
                self.count(|s| s.push_frames_received += 1);
                let len = data.len();
                let _ = self
                    .channels
                    .events
                    .send(Event::PushDataReceived(data.clone(), handle.clone()));

                if FrameCodec::is_push_frame(len) {
                    self.decode(&data, &handle.to_string());
                } else {
                    self.logger.debug(format_args!(
                        "ignoring {} byte push from {}, not a statistics frame",
                        len, handle
                    ));
                }
                return;
            }
        };

        let _ = self.channels.events.send(event);
    }

    fn process_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::DataReceived(data, session) => {
                self.count(|s| s.pull_frames_received += 1);
                let len = data.len();
                let _ = self
                    .channels
                    .events
                    .send(Event::PullDataReceived(data.clone(), session.clone()));

                if FrameCodec::is_pull_frame(len) {
                    self.decode(&data, &session.to_string());
                } else {
                    self.logger.debug(format_args!(
                        "ignoring {} byte reply from {}, not a statistics frame",
                        len, session
                    ));
                }
            }
            SessionEvent::Failed { session, reason } => {
                let _ = self
                    .channels
                    .events
                    .send(Event::PullSessionFailed { session, reason });
            }
            SessionEvent::Finished(session, state) => {
                match state {
                    PullState::Completed => self.count(|s| s.pull_sessions_completed += 1),
                    _ => self.count(|s| s.pull_sessions_failed += 1),
                }
                if let Ok(mut sessions) = self.sessions.lock() {
                    sessions.remove(&session.id);
                }
                self.logger
                    .debug(format_args!("pull session to {} ended {:?}", session, state));
            }
        }
    }

    fn decode(&self, data: &[u8], source: &str) {
        match FrameCodec::decode(data) {
            Ok(statistics) => {
                self.count(|s| s.statistics_decoded += 1);
                self.logger.debug(format_args!(
                    "decoded statistics from {} for inverter {}",
                    source,
                    statistics.inverter_serial_number()
                ));
                let _ = self
                    .channels
                    .events
                    .send(Event::StatisticsAvailable(statistics));
            }
            Err(e) => {
                self.count(|s| s.decode_errors += 1);
                self.logger
                    .warn(format_args!("failed to decode frame from {}: {}", source, e));
            }
        }
    }

    fn count<F: FnOnce(&mut EngineStats)>(&self, f: F) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    fn take<T>(slot: &Mutex<Option<T>>) -> Result<T> {
        slot.lock()
            .ok()
            .and_then(|mut r| r.take())
            .ok_or_else(|| Error::Configuration("coordinator already started".into()))
    }
}
