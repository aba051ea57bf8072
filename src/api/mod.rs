//! HTTP surface for the download service.

pub mod error;
pub mod routes;

pub use routes::{AppState, download_routes};
