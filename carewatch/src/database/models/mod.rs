//! Database models for carewatch.
//!
//! Rows map directly onto the schema: enums are stored as their
//! SCREAMING_SNAKE strings, timestamps as epoch milliseconds and nested
//! values as JSON text.

pub mod attempt;
pub mod batch;
pub mod escalation;
pub mod notification;
pub mod template;

pub use attempt::*;
pub use batch::*;
pub use escalation::*;
pub use notification::*;
pub use template::*;

use crate::{Error, Result};

/// Parse a stored enum column, reporting the column on failure.
pub(crate) fn parse_column<T>(
    column: &'static str,
    value: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<T> {
    parse(value).ok_or_else(|| Error::Database(format!("invalid {} value: {}", column, value)))
}

/// Convert a stored non-negative integer column.
pub(crate) fn to_u32(column: &'static str, value: i64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| Error::Database(format!("invalid {} value: {}", column, value)))
}
