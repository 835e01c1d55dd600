//! The dentry tree itself: one `BTreeMap<String, DentryAttrs>` per
//! namespace, keyed by full path. Good enough to make `create`/`remove`
//! applicable and `list` enumerable; the real data structure (the one
//! spec.md puts out of scope) would replace this map with something
//! radix-tree-shaped without touching the `DentryStore` seam fdir_rpc
//! depends on.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use fdir_db::record::{OpType, Record};
use fdir_db::DentryStore;
use fdir_util::error::{errno, Error};

/// The attributes carried by one dentry, mirroring the fields a
/// `Record` mutates (spec.md §3's "inode-like attributes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DentryAttrs {
	pub inode: u64,
	pub mode: u32,
	pub flags: u32,
	pub timestamp: u64,
}

/// One entry returned by [`Tree::list`]: a direct child's name plus its
/// attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DentryInfo {
	pub name: String,
	pub attrs: DentryAttrs,
}

#[derive(Default)]
struct Namespace {
	entries: BTreeMap<String, DentryAttrs>,
}

/// The dentry store: one tree per running node, mutated only through
/// [`DentryStore::apply`] so the replay worker and the master's own request
/// handler go through the same path.
pub struct Tree {
	namespaces: RwLock<HashMap<String, Namespace>>,
	applied_data_version: AtomicU64,
}

impl Tree {
	pub fn new() -> Self {
		Self {
			namespaces: RwLock::new(HashMap::new()),
			applied_data_version: AtomicU64::new(0),
		}
	}

	/// Seeds `applied_data_version` after a binlog replay (spec.md §6:
	/// "applied to in-memory state at startup by replaying the local
	/// binlog up to its end").
	pub fn set_applied_data_version(&self, v: u64) {
		self.applied_data_version.store(v, Ordering::SeqCst);
	}

	pub fn create(&self, ns: &str, path: &str, attrs: DentryAttrs) -> Result<(), Error> {
		let mut namespaces = self.namespaces.write().unwrap();
		let namespace = namespaces.entry(ns.to_string()).or_default();

		if namespace.entries.contains_key(path) {
			return Err(Error::application(errno::EEXIST, format!("{}:{} already exists", ns, path)));
		}
		if let Some(parent) = parent_path(path) {
			if !parent.is_empty() && !namespace.entries.contains_key(&parent) {
				return Err(Error::application(errno::ENOENT, format!("{}:{} has no parent directory", ns, path)));
			}
		}
		namespace.entries.insert(path.to_string(), attrs);
		Ok(())
	}

	pub fn remove(&self, ns: &str, path: &str) -> Result<(), Error> {
		let mut namespaces = self.namespaces.write().unwrap();
		let namespace = namespaces
			.get_mut(ns)
			.ok_or_else(|| Error::application(errno::ENOENT, format!("namespace {} does not exist", ns)))?;

		if !namespace.entries.contains_key(path) {
			return Err(Error::application(errno::ENOENT, format!("{}:{} does not exist", ns, path)));
		}
		let child_prefix = format!("{}/", path.trim_end_matches('/'));
		if namespace.entries.keys().any(|p| p.starts_with(&child_prefix)) {
			return Err(Error::application(errno::ENOTEMPTY, format!("{}:{} is not empty", ns, path)));
		}
		namespace.entries.remove(path);
		Ok(())
	}

	/// Lists every direct child of `path` within `ns`, sorted by name
	/// (spec.md §4.11's first/next paging operates over this ordering).
	pub fn list(&self, ns: &str, path: &str) -> Result<Vec<DentryInfo>, Error> {
		let namespaces = self.namespaces.read().unwrap();
		let namespace = match namespaces.get(ns) {
			Some(n) => n,
			None => return Ok(Vec::new()),
		};
		let prefix = format!("{}/", path.trim_end_matches('/'));
		let mut out: Vec<DentryInfo> = namespace
			.entries
			.iter()
			.filter_map(|(child_path, attrs)| {
				let rest = child_path.strip_prefix(&prefix)?;
				if rest.is_empty() || rest.contains('/') {
					return None;
				}
				Some(DentryInfo {
					name: rest.to_string(),
					attrs: *attrs,
				})
			})
			.collect();
		out.sort_by(|a, b| a.name.cmp(&b.name));
		Ok(out)
	}
}

impl Default for Tree {
	fn default() -> Self {
		Self::new()
	}
}

fn parent_path(path: &str) -> Option<String> {
	let trimmed = path.trim_end_matches('/');
	trimmed.rfind('/').map(|i| trimmed[..i].to_string())
}

impl DentryStore for Tree {
	/// Applies one mutation and always advances `applied_data_version`,
	/// whether or not the mutation itself succeeded: the counter tracks
	/// binlog position, not application outcome (spec.md §4.8's idempotent
	/// skip compares against this counter for every record, applied or
	/// rejected).
	fn apply(&self, record: &Record) -> Result<(), Error> {
		let result = match record.op_type {
			OpType::Create => self.create(
				&record.ns,
				&record.path,
				DentryAttrs {
					inode: record.inode,
					mode: record.mode,
					flags: record.flags,
					timestamp: record.timestamp,
				},
			),
			OpType::Remove => self.remove(&record.ns, &record.path),
		};
		if let Err(ref e) = result {
			debug!("record {} not applicable: {}", record.data_version, e);
		}
		self.applied_data_version.store(record.data_version, Ordering::SeqCst);
		result
	}

	fn applied_data_version(&self) -> u64 {
		self.applied_data_version.load(Ordering::SeqCst)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn attrs(inode: u64) -> DentryAttrs {
		DentryAttrs {
			inode,
			mode: 0o755,
			flags: 0,
			timestamp: 0,
		}
	}

	#[test]
	fn create_then_list_finds_direct_child() {
		let tree = Tree::new();
		tree.create("test", "/a", attrs(1)).unwrap();
		tree.create("test", "/a/b", attrs(2)).unwrap();
		let listing = tree.list("test", "/a").unwrap();
		assert_eq!(listing.len(), 1);
		assert_eq!(listing[0].name, "b");
	}

	#[test]
	fn create_rejects_duplicate_and_missing_parent() {
		let tree = Tree::new();
		tree.create("test", "/a", attrs(1)).unwrap();
		assert_eq!(tree.create("test", "/a", attrs(1)).unwrap_err().code(), errno::EEXIST);
		assert_eq!(tree.create("test", "/missing/child", attrs(2)).unwrap_err().code(), errno::ENOENT);
	}

	#[test]
	fn remove_rejects_non_empty_directory() {
		let tree = Tree::new();
		tree.create("test", "/a", attrs(1)).unwrap();
		tree.create("test", "/a/b", attrs(2)).unwrap();
		assert_eq!(tree.remove("test", "/a").unwrap_err().code(), errno::ENOTEMPTY);
		tree.remove("test", "/a/b").unwrap();
		tree.remove("test", "/a").unwrap();
	}

	#[test]
	fn apply_advances_data_version_even_on_application_error() {
		let tree = Tree::new();
		let rec = Record::new(OpType::Create, 1, 1, "test".into(), "/a".into(), 0o755, 0, 0).unwrap();
		tree.apply(&rec).unwrap();

		let dup = Record::new(OpType::Create, 2, 1, "test".into(), "/a".into(), 0o755, 0, 0).unwrap();
		assert!(tree.apply(&dup).is_err());
		assert_eq!(tree.applied_data_version(), 2);
	}

	#[test]
	fn list_of_unknown_namespace_is_empty() {
		let tree = Tree::new();
		assert!(tree.list("nope", "/a").unwrap().is_empty());
	}

	#[test]
	fn paged_listing_covers_all_inserted_names() {
		let tree = Tree::new();
		tree.create("test", "/x", attrs(0)).unwrap();
		for i in 0..300 {
			tree.create("test", &format!("/x/{:03}", i), attrs(i as u64 + 1)).unwrap();
		}
		let listing = tree.list("test", "/x").unwrap();
		assert_eq!(listing.len(), 300);
		assert_eq!(listing[0].name, "000");
		assert_eq!(listing[299].name, "299");
	}
}
