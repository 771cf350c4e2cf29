pub use anyhow::{anyhow, bail, Result};
pub use log::{debug, error, info, trace, warn};
pub use tokio::sync::broadcast;

pub use crate::channels::{Channels, Event};
pub use crate::config::{self, Config};
pub use crate::coordinator::{Coordinator, CoordinatorOptions, EngineStats};
pub use crate::error::Error;
pub use crate::logging::{Level, Logger};
pub use crate::omnik::{
    Channel, ClientHandle, FrameCodec, Listener, ListenerInfo, PullSession, PullState,
    SessionInfo, Statistics, Timeouts, WifiSerial,
};
pub use crate::options::Options;
pub use crate::scheduler::Scheduler;
