use serde_json::Value;

/// Result alias used throughout this crate.
pub type Result<T> = ::std::result::Result<T, Error>;

/// Errors surfaced by the voice protocol engine.
///
/// Variants map directly onto the error kinds a caller needs to branch on:
/// most are terminal (surface to the caller), a few are handled internally
/// (rate-limiter sleeps, gateway reconnection, join retries).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Identify/Resume prerequisites were not all populated.
    #[error("missing credential: {0}")]
    MissingCredential(&'static str),

    /// Dial failure, Hello timeout, or an unexpected op where Hello was expected.
    #[error("voice gateway handshake failed: {0}")]
    HandshakeFailed(String),

    /// One of the documented unrecoverable voice-gateway close codes.
    #[error("voice gateway closed with fatal code {0}")]
    FatalCloseCode(u16),

    /// The transport observed a WebSocket close frame carrying a code that
    /// isn't in the fatal list; the caller decides whether to retry.
    #[error("voice gateway closed with code {0}")]
    GatewayClosed(u16),

    /// The caller's context expired or was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// No heartbeat echo arrived within `2 * heartrate`.
    #[error("pacemaker received no echo in time")]
    PacemakerDead,

    /// IP discovery datagram was short or missing its NUL terminator.
    #[error("IP discovery response malformed")]
    IPDiscoveryMalformed,

    /// UDP `Write` was attempted before `SessionDescription` installed a secret key.
    #[error("voice UDP connection not ready")]
    NotReady,

    /// A rate-limit header failed to parse as the expected numeric type.
    #[error("rate limit header parse error: {0}")]
    RateLimitParseError(String),

    /// A voice-gateway frame arrived with zero bytes of payload.
    #[error("empty voice gateway payload")]
    EmptyPayload,

    /// `Send` was attempted on a transport that already closed.
    #[error("transport already closed")]
    TransportClosed,

    /// An op code with no registered handler; logged, not fatal.
    #[error("unknown voice gateway op {0}")]
    UnknownEvent(u8),

    /// A `std::io` failure (socket dial, datagram send/recv).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A `serde_json` (de)serialization failure.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A `tokio-tungstenite` / underlying WebSocket failure.
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A malformed JSON value where a specific shape was expected.
    #[error("decode error: {0}")]
    Decode(&'static str, Value),
}

impl Error {
    /// True for the fatal voice-gateway close codes listed in the gateway client's contract.
    pub fn is_fatal_close_code(code: u16) -> bool {
        matches!(
            code,
            4003 | 4004 | 4006 | 4009 | 4011 | 4012 | 4014 | 4016
        )
    }
}
