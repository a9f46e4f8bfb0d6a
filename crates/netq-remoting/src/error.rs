use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemotingError {
    #[error("failed to send to {addr}: {reason}")]
    SendFailure { addr: String, reason: String },

    #[error("request {correlation_id} to {addr} timed out after {timeout_ms}ms")]
    Timeout {
        addr: String,
        correlation_id: i32,
        timeout_ms: u64,
    },

    #[error("request {correlation_id} cancelled: channel to {addr} closed")]
    Cancelled { addr: String, correlation_id: i32 },

    #[error("request code {code} not supported")]
    UnsupportedRequestCode { code: i32 },

    #[error("system busy: {reason}")]
    SystemBusy { reason: String },

    #[error("protocol decode error: {reason}")]
    ProtocolDecode { reason: String },

    #[error("protocol encode error: {reason}")]
    ProtocolEncode { reason: String },

    #[error("TLS handshake with {peer} failed: {reason}")]
    TlsHandshake { peer: String, reason: String },

    #[error("invalid TLS configuration: {reason}")]
    TlsConfig { reason: String },

    #[error("failed to bind {addr}: {source}")]
    BindFailure {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("processor failed: {0}")]
    Processor(String),

    #[error("rpc hook failed: {0}")]
    Hook(String),

    #[error("scheduler has been disposed")]
    SchedulerStopped,

    #[error("channel to {0} is closed")]
    ChannelClosed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RemotingError>;
