//! Service runtime: a typed request/response substrate over the bus.
//!
//! A service binds the listener channel `service:<name>@<worker>`, registers
//! request handlers, answers healthcheck pings, and issues requests to peers
//! with round-robin worker selection gated by the liveness table.
//!
//! # Lifecycle
//! 1. [`ServiceBuilder`] collects handlers and hooks.
//! 2. [`ServiceBuilder::start`] connects the bus and returns a live
//!    [`Service`] (used directly in tests and embedded callers).
//! 3. [`ServiceBuilder::run`] additionally fans out worker processes and
//!    blocks until SIGINT/SIGTERM, draining in-flight requests.

mod config;
mod error;
mod liveness;
mod pinger;
mod reply;
mod request;
mod service;

pub use config::InfraConfig;
pub use error::{Rejection, ServiceError};
pub use reply::{Reply, ResponseStream};
pub use request::Request;
pub use sb_proto::envelope::rejection;
pub use service::{RequestOptions, Service, ServiceBuilder};
