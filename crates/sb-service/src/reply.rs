//! Replies observed by the requesting side.

use sb_proto::envelope::{ResponseBody, ResponseType};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::ServiceError;
use crate::service::Service;

/// The first reply to an outgoing request.
pub enum Reply {
    /// A `simple` response (with content) or a bare `end` (without).
    Simple(Option<Value>),
    /// A `stream` opener; consume the frames through [`ResponseStream`].
    Stream(ResponseStream),
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Simple(content) => f.debug_tuple("Simple").field(content).finish(),
            Reply::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
        }
    }
}

impl Reply {
    pub fn is_stream(&self) -> bool {
        matches!(self, Reply::Stream(_))
    }

    /// The content of a simple reply; `None` for streams and empty replies.
    pub fn content(self) -> Option<Value> {
        match self {
            Reply::Simple(content) => content,
            Reply::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<ResponseStream> {
        match self {
            Reply::Simple(_) => None,
            Reply::Stream(stream) => Some(stream),
        }
    }
}

/// Lazy sequence of `content` payloads, terminated by `end` or `error`.
///
/// The reply waiter stays registered until the terminator arrives (or the
/// stream is dropped), so frames cannot be lost between polls.
pub struct ResponseStream {
    service: Service,
    request_id: String,
    rx: mpsc::UnboundedReceiver<ResponseBody>,
    done: bool,
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("request_id", &self.request_id)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl ResponseStream {
    pub(crate) fn new(
        service: Service,
        request_id: String,
        rx: mpsc::UnboundedReceiver<ResponseBody>,
    ) -> ResponseStream {
        ResponseStream {
            service,
            request_id,
            rx,
            done: false,
        }
    }

    /// Next `content` payload; `Ok(None)` on normal stream end.
    pub async fn next(&mut self) -> Result<Option<Value>, ServiceError> {
        if self.done {
            return Ok(None);
        }
        loop {
            let Some(response) = self.rx.recv().await else {
                self.done = true;
                return Err(ServiceError::Remote);
            };
            match response.response_type {
                ResponseType::Content => {
                    return Ok(Some(response.content.unwrap_or(Value::Null)));
                }
                ResponseType::End => {
                    self.finish();
                    return Ok(None);
                }
                ResponseType::Error => {
                    self.finish();
                    return Err(ServiceError::Remote);
                }
                other => {
                    warn!(request_id = %self.request_id, ?other, "unexpected frame inside stream");
                }
            }
        }
    }

    /// Drain the whole stream into a vector.
    pub async fn collect(mut self) -> Result<Vec<Value>, ServiceError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        Ok(items)
    }

    fn finish(&mut self) {
        self.done = true;
        self.service.unregister_waiter(&self.request_id);
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if !self.done {
            self.service.unregister_waiter(&self.request_id);
        }
    }
}
