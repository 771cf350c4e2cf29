/// Errors raised by the protocol engine.
///
/// Failures are always scoped to the one listener, connection or session
/// they happened on; nothing here is fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed listener configuration (duplicate or empty names).
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("port {0} is outside the range 1-65535")]
    InvalidPort(u32),

    #[error("could not listen at TCP {port} for listener {name}: {source}")]
    BindFailed {
        name: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("could not connect to {address}:{port}: {reason}")]
    ConnectFailed {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("frame too short: got {len} bytes, need at least {min}")]
    FrameTooShort { len: usize, min: usize },

    #[error("invalid wifi serial number {0:?}")]
    InvalidSerialNumber(String),

    /// Accessing a telemetry value the decoder does not support. Distinct
    /// from a decode failure: the frame itself was fine.
    #[error("{0} is not implemented")]
    NotImplemented(&'static str),

    #[error("frame parse error: {0}")]
    Parse(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Port carried by a bind failure, if this is one.
    pub fn port(&self) -> Option<u16> {
        match self {
            Error::BindFailed { port, .. } => Some(*port),
            Error::ConnectFailed { port, .. } => Some(*port),
            _ => None,
        }
    }
}
