//! Utility crate for FastDIR: configuration loading, the error taxonomy,
//! time helpers and small opaque data types shared across the workspace.

#[macro_use]
extern crate tracing;

pub mod config;
pub mod data;
pub mod error;
pub mod persister;
pub mod time;
