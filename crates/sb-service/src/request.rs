//! Incoming request objects and their terminal-state machine.

use sb_proto::envelope::{RequestBody, ResponseBody, ResponseType};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};

use crate::error::ServiceError;
use crate::service::Service;

/// Response lifecycle of one incoming request.
///
/// Fresh → (SimpleSent | StreamOpen | Rejected | Errored | Ended); every
/// state but StreamOpen is terminal and collapses to `Done` here.  Exactly
/// one terminator is ever emitted; operations on a dead request are no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    StreamOpen,
    Done,
}

/// An incoming request, handed to the registered handler.
///
/// Cheap to clone; the runtime keeps a clone to synthesize the terminator
/// when a handler returns without sending one.
#[derive(Clone)]
pub struct Request {
    shared: Arc<Shared>,
}

struct Shared {
    service: Service,
    source: String,
    source_worker: u32,
    id: String,
    request_type: String,
    data: Map<String, Value>,
    state: Mutex<State>,
}

impl Request {
    pub(crate) fn new(
        service: Service,
        source: String,
        source_worker: u32,
        body: RequestBody,
    ) -> Request {
        Request {
            shared: Arc::new(Shared {
                service,
                source,
                source_worker,
                id: body.request_id,
                request_type: body.request_type,
                data: body.data,
                state: Mutex::new(State::Fresh),
            }),
        }
    }

    pub fn request_type(&self) -> &str {
        &self.shared.request_type
    }

    /// Service name of the requester.
    pub fn source(&self) -> &str {
        &self.shared.source
    }

    pub fn source_worker(&self) -> u32 {
        self.shared.source_worker
    }

    /// The application fields that rode along with the request.
    pub fn data(&self) -> &Map<String, Value> {
        &self.shared.data
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.shared.data.get(key)
    }

    /// The service this request arrived on (for issuing sub-requests).
    pub fn service(&self) -> &Service {
        &self.shared.service
    }

    /// Whether no terminator has been emitted yet.
    pub fn is_alive(&self) -> bool {
        *self.shared.state.lock().expect("request state lock") != State::Done
    }

    /// Open a stream; legal only before any response frame.
    pub async fn open_stream(&self) -> Result<(), ServiceError> {
        {
            let mut state = self.shared.state.lock().expect("request state lock");
            match *state {
                State::Done => return Ok(()),
                State::StreamOpen => {
                    return Err(ServiceError::InvalidTransition("stream is already open"))
                }
                State::Fresh => *state = State::StreamOpen,
            }
        }
        self.emit(ResponseType::Stream, None).await
    }

    /// Send content: a terminal `simple` before streaming, a non-terminal
    /// `content` frame after [`Request::open_stream`].
    pub async fn send(&self, content: Value) -> Result<(), ServiceError> {
        let response_type = {
            let mut state = self.shared.state.lock().expect("request state lock");
            match *state {
                State::Done => return Ok(()),
                State::StreamOpen => ResponseType::Content,
                State::Fresh => {
                    *state = State::Done;
                    ResponseType::Simple
                }
            }
        };
        self.emit(response_type, Some(content)).await
    }

    /// Terminate normally (empty response, or stream end).
    pub async fn end(&self) -> Result<(), ServiceError> {
        {
            let mut state = self.shared.state.lock().expect("request state lock");
            if *state == State::Done {
                return Ok(());
            }
            *state = State::Done;
        }
        self.emit(ResponseType::End, None).await
    }

    /// Reject with a kind and positional arguments.
    ///
    /// Illegal once a stream is open: the client has already committed to
    /// stream consumption.
    pub async fn reject(
        &self,
        kind: &str,
        args: impl IntoIterator<Item = Value>,
    ) -> Result<(), ServiceError> {
        self.reject_with(kind, args, Map::new()).await
    }

    /// Reject with positional and keyword arguments.
    pub async fn reject_with(
        &self,
        kind: &str,
        args: impl IntoIterator<Item = Value>,
        kwargs: Map<String, Value>,
    ) -> Result<(), ServiceError> {
        {
            let mut state = self.shared.state.lock().expect("request state lock");
            match *state {
                State::Done => return Ok(()),
                State::StreamOpen => {
                    return Err(ServiceError::InvalidTransition("cannot reject after streaming"))
                }
                State::Fresh => *state = State::Done,
            }
        }
        let mut body = ResponseBody::new(self.shared.id.clone(), ResponseType::Reject);
        body.rejection_type = Some(kind.to_owned());
        body.args = args.into_iter().collect();
        body.kwargs = kwargs;
        self.send_body(body).await
    }

    /// Terminate with an internal `error`; the caller raises a generic
    /// service error.
    pub async fn error(&self) -> Result<(), ServiceError> {
        {
            let mut state = self.shared.state.lock().expect("request state lock");
            if *state == State::Done {
                return Ok(());
            }
            *state = State::Done;
        }
        self.emit(ResponseType::Error, None).await
    }

    async fn emit(
        &self,
        response_type: ResponseType,
        content: Option<Value>,
    ) -> Result<(), ServiceError> {
        let mut body = ResponseBody::new(self.shared.id.clone(), response_type);
        body.content = content;
        self.send_body(body).await
    }

    async fn send_body(&self, body: ResponseBody) -> Result<(), ServiceError> {
        self.shared
            .service
            .send_response(&self.shared.source, self.shared.source_worker, body)
            .await
    }
}
