pub mod sql;

pub use sql::{SqlEngine, SqlOutput};
