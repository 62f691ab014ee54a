//! crucible-daemon: the API gateway / status service.
//!
//! `main.rs` wires the full control plane; the library half exposes the
//! router and state so scenario tests can drive everything in-process.

pub mod api_types;
pub mod routes;
pub mod state;
