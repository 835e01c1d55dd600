//! Binlog record model for FastDIR: the wire/file record format, a
//! reference-counted record buffer pool, and the append-only binlog file.
//!
//! The in-memory dentry tree itself is out of scope for this crate (see
//! spec's Non-goals); it is represented here only by the [`store::DentryStore`]
//! trait, which `fdir_model` implements and `fdir_rpc`'s replica consumer and
//! write thread call against.

#[macro_use]
extern crate tracing;

pub mod binlog_file;
pub mod buffer;
pub mod record;
pub mod store;

pub use buffer::{BufferPool, RecordBuffer};
pub use record::Record;
pub use store::DentryStore;
