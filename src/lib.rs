//! Real-time arrival predictions for 511.org transit stops.
//!
//! [`orchestrator::Handle`] polls each configured stop on its own timer and
//! keeps a display-ready [`model::StopSnapshot`] per stop, falling back to the
//! last good data when the upstream misbehaves.

pub mod aggregate;
pub mod cache;
pub mod config;
pub mod diagnostics;
pub mod entity;
pub mod error;
pub mod fetch;
pub mod health;
pub mod mapper;
pub mod model;
pub mod orchestrator;
pub mod output;
pub mod parser;
pub mod retry;

#[cfg(test)]
mod test_support;

pub use config::{ServiceConfig, StopConfig, TimeFormat};
pub use error::{ConfigError, FetchError, ParseError, ServiceError};
pub use model::StopSnapshot;
pub use orchestrator::{Handle, StopStatus};
