//! Chat download service: background chat download jobs behind an HTTP API.

pub mod api;
pub mod artifact;
pub mod config;
pub mod error;
pub mod jobs;
pub mod source;
