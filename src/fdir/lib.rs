//! Library half of the `fdir` binary: kept separate from `main.rs` so
//! integration tests can start nodes in-process the same way `main` does.

#[macro_use]
extern crate tracing;

pub mod cli;
pub mod server;
