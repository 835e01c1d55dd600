//! The in-memory dentry tree: minimal by design (spec.md puts its internal
//! data structure out of scope), but real enough to make mutations
//! applicable and listable, exercising `fdir_rpc`'s replication engine
//! end to end the way `garage_model` hosts table schemas on top of
//! `garage_table`.

#[macro_use]
extern crate tracing;

pub mod listing;
pub mod tree;

pub use listing::ListingManager;
pub use tree::{DentryAttrs, DentryInfo, Tree};
