//! offer-reconciler: trade offer reconciliation engine.
//!
//! Library root. Exposes all modules for use by the binary and
//! integration tests.

pub mod config;
pub mod types;
pub mod error;
pub mod balance;
pub mod engine;
pub mod services;
pub mod storage;
pub mod status;
