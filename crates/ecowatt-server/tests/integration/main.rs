//! Integration test entry point for ecowatt-server.
//!
//! Run with: cargo test --test integration

mod harness;
mod fota;
mod upload;
