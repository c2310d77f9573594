//! Bus client for the pub/sub key-value broker.
//!
//! A client owns two framed TCP links to the broker:
//!   - *channels*: carries subscriptions and pushed channel messages, no
//!     reply correlation;
//!   - *main*: command/response, replies strictly ordered with sends.
//!
//! Reconnection is automatic.  The desired subscription set survives a
//! drop and is replayed before any queued command is flushed, so no
//! publish can overtake its subscription after a reconnect.

mod client;
mod connection;
mod error;

pub use client::{BusClient, BusConfig, BusEvent};
pub use connection::Link;
pub use error::BusError;
