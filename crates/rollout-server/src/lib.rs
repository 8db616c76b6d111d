//! HTTP surface for the deployment controller: `GET /events`,
//! `POST /deploy` and `GET /health`, plus process-level plumbing
//! (graceful shutdown and the diagnostic event tap).

pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod server;
pub mod shutdown;
pub mod tap;

pub use config::ServerConfig;
pub use error::ApiError;
pub use server::{build_router, start, AppState, ServerHandle};
pub use shutdown::ShutdownCoordinator;
