//! # hostdeck-id
//!
//! Typed identifiers used by the hostdeck agent.
//!
//! All IDs use a prefixed format: `{prefix}_{ulid}`, for example
//! `app_01HV4Z3MXNKPQR9HSTZ7WCLD4E`.
//!
//! App IDs end up inside generated proxy configuration, container names and
//! compose project names, so the typed form is the only way to get one: it
//! can only ever contain ASCII letters, digits and a single underscore.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
