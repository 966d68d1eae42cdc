//! Sandbox Relay - streams Claude worker output to clients over SSE.

pub mod config;
pub mod relay;
pub mod server;
pub mod session;
pub mod worker;
