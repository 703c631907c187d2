//! HTTP adapter for protecting axum routes with the window enforcer.

pub mod demo;
mod middleware;
mod server;

pub use middleware::{enforce, ErrorResponse, RouteGuard};
pub use server::{BoundServer, HttpServer};
