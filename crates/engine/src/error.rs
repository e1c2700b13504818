use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("setup failed: {0}")]
    Setup(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(
        "receive sharding requested but the per-socket CPU affinity option \
         (SO_INCOMING_CPU) is not supported on this platform"
    )]
    AffinityUnsupported,

    #[error("buffer depth and frame size don't allow for enough buffered stream")]
    BufferTooShallow,

    #[error("no target addresses configured for the connect role")]
    NoTargetAddress,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] jitterpump_protocol::Error),
}

impl EngineError {
    /// The OS-style error code reported to the socket state machine for this
    /// error, when one applies.
    pub fn os_code(&self) -> i32 {
        match self {
            EngineError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EINVAL,
        }
    }
}
