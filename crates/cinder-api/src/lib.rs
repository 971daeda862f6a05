//! # cinder-api
//!
//! HTTP control plane for the cinder workflow engine. A thin façade over
//! the store: every read is a store query, and the only writes are document
//! inserts (submitting workflows and tasks) plus the admin kill switch that
//! exercises watchdog recovery.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
