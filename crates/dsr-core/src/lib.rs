//! Core domain + application logic for the data subject rights engine.
//!
//! This crate is storage-agnostic. Concrete data stores (PostgREST, file
//! trees, third-party REST services) live behind the `StoreAdapter` port
//! implemented in adapter crates.

pub mod archive;
pub mod audit;
pub mod config;
pub mod crypto;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod locator;
pub mod logging;
pub mod operations;
pub mod ports;
pub mod restriction;
pub mod security;

pub use errors::{Error, Result};
