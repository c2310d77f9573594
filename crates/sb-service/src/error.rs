use sb_bus::BusError;
use serde_json::{Map, Value};

/// Protocol-layer failures surfaced to request callers and handlers.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The liveness window is valid and the chosen listener is not in it.
    #[error("no live worker for the target service")]
    Unavailable,
    /// The peer answered with an internal `error` response.
    #[error("the peer service failed to fulfill the request")]
    Remote,
    #[error("timed out waiting for the first reply")]
    Timeout,
    /// A response operation that is illegal in the request's current state.
    #[error("illegal response transition: {0}")]
    InvalidTransition(&'static str),
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Handler(String),
}

impl ServiceError {
    /// Convenience for handlers bailing out with a domain message.
    pub fn handler(message: impl Into<String>) -> ServiceError {
        ServiceError::Handler(message.into())
    }
}

/// A peer rejected the request with a kind and structured arguments.
///
/// Kinds the backend emits are listed in [`sb_proto::envelope::rejection`];
/// unknown kinds are carried through verbatim.
#[derive(Debug, Clone, thiserror::Error)]
#[error("request rejected: {kind}")]
pub struct Rejection {
    pub kind: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl Rejection {
    pub fn new(kind: impl Into<String>) -> Rejection {
        Rejection {
            kind: kind.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    /// First positional argument, when it is a string message.
    pub fn message(&self) -> Option<&str> {
        self.args.first().and_then(Value::as_str)
    }
}
