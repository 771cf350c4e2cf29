pub mod client;
pub mod listener;
pub mod packet;
pub mod pull_session;

pub use client::{ClientHandle, ConnectedClient};
pub use listener::{Listener, ListenerEvent, ListenerInfo, ListenerState};
pub use packet::{Channel, FrameCodec, RequestFrame, Statistics, WifiSerial};
pub use pull_session::{PullSession, PullState, SessionEvent, SessionInfo, Timeouts};
