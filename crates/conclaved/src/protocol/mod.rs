//! Session establishment protocol.
//!
//! The CLI drives a session through the daemon's local control socket;
//! both sides exchange [`conclave_common::Session`] frames over a
//! [`crate::gateway::Gateway`]. Failures after the websocket is up are
//! reported to the other side as a close reason.

pub mod client;
pub mod server;

pub use client::{InitiatingOptions, JoiningOptions, SessionObserver, initiating_session, joining_session};
pub use server::handle_session;
