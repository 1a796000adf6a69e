//! Common utilities shared by the parallel backend crates.
//!
//! This crate provides the error type and the payload codec every rank uses.

pub mod codec;
pub mod error;

pub use error::{CommonError, Result};
