//! appgate-server library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.

pub mod analytics;
pub mod auth;
pub mod config;
pub mod console;
pub mod dispatch;
pub mod lifecycle;
pub mod resource;
pub mod server;

pub use config::{Endpoint, ServerOptions};
pub use server::{RequestServer, ServerError, SocketKind, SocketName};
