//! # Conclave Common
//!
//! Shared types, constants, and errors used across Conclave components.
//!
//! ## Modules
//! - `types` - Wire types (ServerInfo, Session, JoinIntent, ServicesPut, etc.)
//! - `error` - Common error types
//! - `constants` - Shared configuration constants

pub mod constants;
pub mod error;
pub mod types;

pub use error::ConclaveError;
pub use types::*;
