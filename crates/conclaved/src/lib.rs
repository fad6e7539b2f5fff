//! # Conclave
//!
//! Trust establishment and cluster formation for a group of systems.
//!
//! ## Architecture
//! ```text
//! conclave (CLI) ──ws──► conclaved ◄──multicast──► conclaved (peers)
//!                            │  ▲
//!                            │  └── mutual TLS REST (/1.0/session, /1.0/services)
//!                            ▼
//!                  clustered services (orchestrator, compute, storage, network)
//! ```

pub mod auth;
pub mod certs;
pub mod config;
pub mod context;
pub mod control;
pub mod discovery;
pub mod formation;
pub mod gateway;
pub mod handler;
pub mod protocol;
pub mod routes;
pub mod services;
pub mod session;
pub mod state;
pub mod tls;
