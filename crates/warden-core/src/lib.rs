//! Access and resilience core for a chat-command service.
//!
//! Transport-agnostic: adapters drive `access::AccessGate`, which owns users,
//! one-time codes, the self-healing error log and settings, and persists them
//! through `store::PersistenceStore`.

pub mod access;
pub mod config;
pub mod crypto;
pub mod domain;
pub mod error_controller;
pub mod errors;
pub mod logging;
pub mod otp;
pub mod ports;
pub mod scheduler;
pub mod settings;
pub mod stats;
pub mod store;

pub use errors::{Error, Result};
