//! REST API server module.
//!
//! Exposes the job lifecycle over HTTP: creation, part upload, status
//! polling, output download, and destruction.

pub mod error;
pub mod models;
pub mod routes;
pub mod server;

pub use server::ApiServer;
