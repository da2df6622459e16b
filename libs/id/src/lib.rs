//! # cloudterm-id
//!
//! Typed identifiers for the relay: client channels, bridge sessions and
//! HTTP requests.
//!
//! Every id renders as `{prefix}_{ulid}`, for example
//! `sess_01HV4Z2WQXKJNM8GPQY6VBKC3D`. The prefix keeps a channel id from being
//! passed where a session id is expected, both in code and in logs.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid so the `define_id!` expansion resolves from other crates.
pub use ulid::Ulid;

/// Splits `{prefix}_{ulid}` and validates both halves.
#[doc(hidden)]
pub fn parse_prefixed(expected: &'static str, s: &str) -> Result<Ulid, IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    let Some((prefix, raw)) = s.split_once('_') else {
        return Err(IdError::MissingSeparator);
    };

    if prefix != expected {
        return Err(IdError::InvalidPrefix {
            expected,
            actual: prefix.to_string(),
        });
    }

    raw.parse::<Ulid>()
        .map_err(|e| IdError::InvalidUlid(e.to_string()))
}
