//! THETA: intraday 0DTE credit spread engine
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod alerts;
pub mod broker;
pub mod config;
pub mod engine;
pub mod market_data;
pub mod strategy;
pub mod types;
