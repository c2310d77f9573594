//! Umbrella crate for the game-statistics backend core.
//!
//! The real code lives in the workspace crates; this package re-exports
//! them and hosts the end-to-end integration suites under
//! `tests/integration/`.
//!
//! - [`proto`]: broker wire protocol + bus envelope types
//! - [`bus`]: reconnecting pub/sub bus client
//! - [`service`]: the service runtime (handlers, liveness, workers)
//! - [`db`]: shared data-access contract (pool, transcoding, table meta)

pub use sb_bus as bus;
pub use sb_db as db;
pub use sb_proto as proto;
pub use sb_service as service;
