//! core-agent: lifecycle controller for an embedded network-proxy engine
//!
//! This library owns the single running proxy engine of a host application,
//! enforces a strict state machine around its lifecycle, and turns every
//! internal failure (panics included) into a reportable error instead of
//! taking the host down.
//!
//! # Architecture
//!
//! The host drives the core through a narrow command surface: setup, parse
//! config, start, stop, restart, select outbound, run connectivity probes,
//! and manage auxiliary command clients. It does so either in-process
//! through [`bridge::Bridge`] or, in the server setup modes, over the TCP
//! control server.
//!
//! # Modules
//!
//! - `state`: Lifecycle state registry with push notifications
//! - `controller`: Engine slot, lifecycle, command clients, outbound control, fault boundary
//! - `engine`: Engine abstraction and the profile-backed reference engine
//! - `bridge`: Flat host-facing surface returning message strings
//! - `control`: Control API for external applications
//! - `config`: Configuration parsing, settings, profiles and validation
//! - `security`: Server key pair and client key registry
//! - `logging`: Structured logging setup
//! - `error`: Error types and handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bridge;
pub mod config;
pub mod control;
pub mod controller;
pub mod engine;
pub mod error;
pub mod logging;
pub mod security;
pub mod state;

// Re-export commonly used types
pub use bridge::Bridge;
pub use controller::{Controller, ControllerBuilder};
pub use error::{CoreError, Result};
pub use state::{CoreState, CoreStatus, MessageType};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
