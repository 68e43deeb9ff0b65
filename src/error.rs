use thiserror::Error;

#[derive(Error, Debug)]
pub enum L1Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed command batch: {0}")]
    MalformedBatch(String),
    #[error("command element is missing required attribute {0}")]
    UnknownCommandShape(&'static str),
    #[error("command {command} is missing parameter {parameter}")]
    MissingParameter {
        command: String,
        parameter: &'static str,
    },
    #[error("Unimplemented command {0}")]
    UnimplementedCommand(String),
    #[error("command batch exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    #[error("login to {address} failed: {reason}")]
    Login { address: String, reason: String },
    #[error("Error: Status \"{status}\": {reply}")]
    DeviceCommand { status: String, reply: String },
    #[error("End of recv stream without encountering termination pattern for ctag {counter}")]
    UnexpectedDisconnect { counter: u64 },
    #[error("no reply for ctag {counter} within {secs}s")]
    DeviceTimeout { counter: u64, secs: u64 },
    #[error("not logged in, call Login command first")]
    NotLoggedIn,

    #[error("invalid port address: {0}")]
    InvalidPort(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("unable to parse device reply: {0}")]
    Parse(String),
    #[error("config error: {0}")]
    Config(String),
}

impl L1Error {
    /// Device reply text attached to the error, if any.
    #[must_use]
    pub fn device_reply(&self) -> Option<&str> {
        match self {
            Self::DeviceCommand { reply, .. } => Some(reply),
            _ => None,
        }
    }

    /// Transport-level failures leave the session without a usable stream.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::UnexpectedDisconnect { .. })
    }
}
