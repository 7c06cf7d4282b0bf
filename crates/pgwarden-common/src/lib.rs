//! Common utilities for pgwarden
//!
//! This crate provides the shared error type used across the pgwarden crates.

pub mod error;

pub use error::{GatewayError, Result};
