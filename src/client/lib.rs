//! The FastDIR client: resolves master/readable connections and packs the
//! service-facing wire calls, the way `k2v-client` sits alongside
//! `garage_api` without depending on the server's storage crates.

#[macro_use]
extern crate tracing;

pub mod client;
pub mod list;
pub mod router;

pub use client::{Client, ClientConfig};
pub use list::{DentryEntry, ListPage};
pub use router::Router;
