//! The seam between replication and the dentry tree.
//!
//! spec.md puts the tree itself out of scope: this crate only needs to know
//! that a record is "applicable" and yields a pass/fail result. `fdir_model`
//! implements this trait; `fdir_rpc`'s replica consumer and request handler
//! are generic over it.

use crate::record::Record;

/// Applies replicated mutations to whatever local state backs the dentry
/// tree. Implementations must be safe to call from a single replay task at a
/// time per replication session (spec.md §5: "replay thread calls it
/// single-threaded per session").
pub trait DentryStore: Send + Sync {
	/// Apply one record. Errors here are application errors (already exists,
	/// not found, bad name) and do not themselves constitute a binlog gap;
	/// the caller is responsible for enforcing `data_version` contiguity
	/// before calling this.
	fn apply(&self, record: &Record) -> Result<(), fdir_util::error::Error>;

	/// The `data_version` of the last record this store has applied, used to
	/// seed the counter after a binlog replay or to idempotent-skip stale
	/// records.
	fn applied_data_version(&self) -> u64;
}
