use crate::prelude::*;

use bytes::Bytes;
use std::net::SocketAddr;

/// Everything the engine reports to the outside world.
#[derive(Debug, Clone)]
pub enum Event {
    ListenerReady(ListenerInfo),
    ClientConnected(ClientHandle),
    ClientDisconnected {
        remote: SocketAddr,
        listener: ListenerInfo,
    },
    PushDataReceived(Bytes, ClientHandle),
    PullDataReceived(Bytes, SessionInfo),
    StatisticsAvailable(Statistics),
    PullSessionFailed {
        session: SessionInfo,
        reason: String,
    },
    BindFailed {
        name: String,
        port: u16,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct Channels {
    pub events: broadcast::Sender<Event>,
}

impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}

impl Channels {
    pub fn new() -> Self {
        Self {
            events: Self::channel(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    fn channel<T: Clone>() -> broadcast::Sender<T> {
        broadcast::channel(2048).0
    }
}
