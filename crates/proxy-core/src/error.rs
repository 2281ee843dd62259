use std::fmt;

/// Error kinds surfaced by the request pipeline.
///
/// These map to the HTTP status codes in spec.md §6/§7 at the service
/// boundary; the core itself never constructs an HTTP response directly.
#[derive(Debug)]
pub enum ProxyError {
    /// Malformed command grammar. Never escapes to an HTTP error; surfaced
    /// only via `CommandResult::success = false`.
    CommandParse(String),
    /// A handler rejected a value (range, unknown backend, bad path, ...).
    HandlerValidation(String),
    /// Adapter-side failure: network, upstream 5xx, upstream auth failure.
    Backend(String),
    /// Local rate-limit gate or provider 429 propagated through failover.
    RateLimit { retry_after: Option<u64> },
    /// Mid-stream loop pattern exceeded the configured threshold.
    LoopDetection,
    /// Internal control signal consumed by the request processor; a second
    /// empty response after retry is returned as-is, not as an error.
    EmptyResponseRetry { recovery_prompt: String },
    /// Resource exhaustion / setup failure.
    Capacity(String),
    Initialization(String),
    /// Malformed request shape (e.g. empty `messages` after processing).
    InvalidRequest { message: String, param: Option<String>, code: Option<String> },
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::CommandParse(e) => write!(f, "command parse error: {e}"),
            ProxyError::HandlerValidation(e) => write!(f, "handler validation error: {e}"),
            ProxyError::Backend(e) => write!(f, "backend error: {e}"),
            ProxyError::RateLimit { retry_after } => {
                write!(f, "rate limited, retry_after={retry_after:?}")
            }
            ProxyError::LoopDetection => write!(f, "loop detection error"),
            ProxyError::EmptyResponseRetry { .. } => write!(f, "empty response retry signal"),
            ProxyError::Capacity(e) => write!(f, "capacity error: {e}"),
            ProxyError::Initialization(e) => write!(f, "initialization error: {e}"),
            ProxyError::InvalidRequest { message, .. } => {
                write!(f, "invalid request: {message}")
            }
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::InvalidRequest {
            message: format!("{err} at line {} column {}", err.line(), err.column()),
            param: None,
            code: Some("json_parse_error".to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
