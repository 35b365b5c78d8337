//! Control API for external applications
//!
//! In the server setup modes the host drives the core over a TCP control
//! connection speaking newline-delimited JSON, authenticated by the shared
//! secret and the registered client public keys.

mod api;
mod handler;
mod server;

pub use api::{
    ApiError, ApiRequest, ApiResponse, CommandParams, ControlAction, SelectParams, StartParams,
    UrlTestParams,
};
pub use handler::{AuthPolicy, CommandHandler};
pub use server::ControlServer;
