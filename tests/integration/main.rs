//! Session-level integration tests.

mod harness;
mod session_flow;
