//! JSON envelopes published on service channels.
//!
//! Every payload is an object with the common keys `source` (service name),
//! `worker` (worker index) and `type`.  The `type` key discriminates the
//! body; application fields on requests ride along in a flattened map.
//!
//! ```json
//! { "source": "gateway", "worker": 0, "type": "request",
//!   "request_type": "get-me", "request_id": "…", "session": "…" }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Broadcast channel carrying ping / pong / ping-result traffic.
pub const HEALTHCHECK_CHANNEL: &str = "service:healthcheck";

/// Canonical listener id: `"<name>@<worker>"`.
pub fn listener_id(name: &str, worker: u32) -> String {
    format!("{name}@{worker}")
}

/// Channel a listener subscribes to: `"service:<name>@<worker>"`.
pub fn listener_channel(name: &str, worker: u32) -> String {
    format!("service:{name}@{worker}")
}

/// A complete bus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: String,
    pub worker: u32,
    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    /// Parse an envelope from the raw channel payload.
    pub fn from_json(payload: &str) -> Result<Envelope, serde_json::Error> {
        serde_json::from_str(payload)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("envelope serialization cannot fail")
    }
}

/// Type-discriminated envelope bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Body {
    Request(RequestBody),
    Response(ResponseBody),
    Ping {
        ping_id: String,
    },
    Pong {
        ping_id: String,
        success: u64,
        errors: u64,
    },
    PingResult {
        /// Authoritative `listener id → counters` map for the last round.
        pings: HashMap<String, WorkerCounters>,
    },
    /// Published by the updater once a full mirror run has committed.
    UpdateDone,
}

/// Success / error counters a worker reports in each pong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerCounters {
    pub success: u64,
    pub errors: u64,
}

/// The request half of an RPC.
///
/// `request_id` is opaque and unique within the originating service until
/// the response terminates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestBody {
    pub request_type: String,
    pub request_id: String,
    /// Application fields, passed through untouched.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

/// The response half of an RPC.
///
/// A non-stream exchange is exactly one `simple` or one `end`.  A stream is
/// one `stream` opener, zero or more `content` frames and exactly one
/// terminator (`end` or `error`).  `reject` is always terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub request_id: String,
    pub response_type: ResponseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub kwargs: Map<String, Value>,
}

impl ResponseBody {
    pub fn new(request_id: impl Into<String>, response_type: ResponseType) -> ResponseBody {
        ResponseBody {
            request_id: request_id.into(),
            response_type,
            content: None,
            rejection_type: None,
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_content(mut self, content: Value) -> ResponseBody {
        self.content = Some(content);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Simple,
    Stream,
    Content,
    End,
    Reject,
    Error,
}

impl ResponseType {
    /// Whether this frame closes the request on the responder side.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ResponseType::Stream | ResponseType::Content)
    }
}

/// Rejection kinds services may translate domain problems into.
///
/// Unknown kinds are surfaced verbatim to callers; the constants below are
/// the ones the backend emits.
pub mod rejection {
    pub const NOT_FOUND: &str = "NotFound";
    pub const MISSING_PRIVILEGES: &str = "MissingPrivileges";
    pub const INVALID_CREDENTIALS: &str = "InvalidCredentials";
    pub const EXPIRED_TOKEN: &str = "ExpiredToken";
    pub const ALREADY_CANCELLED: &str = "AlreadyCancelled";
    pub const INVALID_STATE: &str = "InvalidState";
    pub const WRONG_METHOD: &str = "WrongMethod";
    pub const BAD_REQUEST: &str = "BadRequest";
    pub const UNKNOWN_FIELD: &str = "UnknownField";
    pub const FORBIDDEN: &str = "Forbidden";
    pub const NOT_IMPLEMENTED: &str = "NotImplemented";
    pub const UNAVAILABLE: &str = "Unavailable";
}
