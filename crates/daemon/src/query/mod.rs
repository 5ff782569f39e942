//! One-shot query sessions.
//!
//! A query spawns a subprocess per request, turns its stream-json output into
//! [`protocol::QueryEvent`]s and never touches the session registry.

pub mod runner;
pub mod stream;

pub use runner::{QueryError, QueryOutcome, QueryRunner, MAX_STDERR_BYTES};
pub use stream::{parse_line, LineBuffer, ParsedLine};
