//! Gateway error taxonomy.
//!
//! Transport failures (`Connect`, `Timeout`, `Closed`) are handled inside the reader loop
//! by the heartbeat and reconnection logic; callers only see them when an operation they
//! awaited could not complete. `Service` carries a non-200 status reported by the server.

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("cannot connect: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("timed out waiting for the server")]
    Timeout,

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("service error {status}: {message}")]
    Service {
        status: u16,
        message: String,
        stack: Option<String>,
    },

    #[error("request id already in flight: {0}")]
    DuplicateRequestId(String),

    #[error("invalid frame: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gave up after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<GatewayError>,
    },
}

impl GatewayError {
    /// True for failures that may succeed when the same request is sent again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::Send(_)
                | GatewayError::Timeout
                | GatewayError::Closed(_)
                | GatewayError::Service { .. }
        )
    }

    /// Owned copy, for handing one failure to several waiters. Wrapped foreign errors
    /// are carried over as `Send` with their message.
    pub(crate) fn replicate(&self) -> GatewayError {
        match self {
            GatewayError::Connect(m) => GatewayError::Connect(m.clone()),
            GatewayError::Send(m) => GatewayError::Send(m.clone()),
            GatewayError::Timeout => GatewayError::Timeout,
            GatewayError::Closed(m) => GatewayError::Closed(m.clone()),
            GatewayError::Service {
                status,
                message,
                stack,
            } => GatewayError::Service {
                status: *status,
                message: message.clone(),
                stack: stack.clone(),
            },
            GatewayError::DuplicateRequestId(id) => GatewayError::DuplicateRequestId(id.clone()),
            GatewayError::Protocol(_) | GatewayError::Http(_) => GatewayError::Send(self.to_string()),
            GatewayError::RetriesExhausted { attempts, last } => GatewayError::RetriesExhausted {
                attempts: *attempts,
                last: Box::new(last.replicate()),
            },
        }
    }

    /// Status code of a service-level failure.
    pub fn status(&self) -> Option<u16> {
        match self {
            GatewayError::Service { status, .. } => Some(*status),
            GatewayError::RetriesExhausted { last, .. } => last.status(),
            _ => None,
        }
    }
}
