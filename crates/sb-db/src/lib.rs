//! Shared data-access contract.
//!
//! The pooled MySQL connection (with an idle keepalive ping), the dynamic
//! column value used by batched statements, table metadata introspection
//! for the mirror pipeline, the score formulas, and the declarative
//! row→entity transcoding layer.

mod error;
mod formulas;
mod meta;
mod pool;
mod schema;
mod value;

pub use error::DbError;
pub use formulas::{composite_formulas, overall_formula, Period};
pub use meta::{fetch_column, TableMeta};
pub use pool::{Db, DbConfig};
pub use schema::{as_entity, as_entity_list};
pub use value::{row_to_json, SqlValue};
