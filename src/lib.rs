//! # Stratus - Request Scheduling for Cloud Storage Clients
//!
//! The transport control layer of a cloud storage SDK: it admits requests,
//! schedules them under group, signal, cellular and time constraints, and
//! settles redirects, interrupted downloads and certificate trust before
//! handing each request exactly one terminal outcome.
//!
//! ## Architecture
//!
//! - **network**: request model, queue, redirect and resume handling, transport
//! - **security**: certificate trust decisions and the TLS verifier
//! - **auth**: pluggable authentication methods and their registry
//! - **events**: completion delivery to registered handlers
//! - **config**: queue and transport settings
//! - **utils**: shared utilities and error types

pub mod auth;
pub mod config;
pub mod events;
pub mod network;
pub mod security;
pub mod utils;

// Re-export main types for convenience
pub use config::StratusConfig;
pub use network::{Completion, NetworkStack, Request, RequestQueue, Response, Ticket};
pub use utils::error::{NetworkError, Result, StratusError};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = "Stratus";
