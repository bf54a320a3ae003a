//! # scanforge-api
//!
//! HTTP surface for the scanforge pipeline: the analysis-server webhook
//! intake plus health and readiness probes, and the service binary that
//! wires dispatchers, the reconciler, and the intake together.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod routes;
pub mod server;

pub use error::{ApiError, ApiResult};
pub use server::{AppState, router, serve};
