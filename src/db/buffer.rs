//! Record buffers and the pool that recycles their backing storage.
//!
//! A `RecordBuffer` is a contiguous region holding one or more packed
//! records plus `last_data_version`. It is shared across the write thread
//! and every active slave's push queue; each consumer calls [`release`]
//! once it is done, and the buffer's storage returns to its [`BufferPool`]
//! when the refcount reaches zero (spec.md §3, §4.7).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

use crate::record::Record;
use fdir_util::error::Error;

/// A packed run of records, reference-counted across its consumers.
#[derive(Debug, Clone)]
pub struct RecordBuffer {
	bytes: Bytes,
	pub last_data_version: u64,
	refcount: Arc<AtomicUsize>,
}

impl RecordBuffer {
	pub fn new(bytes: Bytes, last_data_version: u64, initial_refcount: usize) -> Self {
		Self {
			bytes,
			last_data_version,
			refcount: Arc::new(AtomicUsize::new(initial_refcount)),
		}
	}

	pub fn len(&self) -> usize {
		self.bytes.len()
	}

	/// The packed, wire/file-ready bytes this buffer holds.
	pub fn raw_bytes(&self) -> Bytes {
		self.bytes.clone()
	}

	pub fn is_empty(&self) -> bool {
		self.bytes.is_empty()
	}

	pub fn refcount(&self) -> usize {
		self.refcount.load(Ordering::SeqCst)
	}

	/// One consumer is done with the buffer. Returns the refcount after the
	/// decrement; the caller that observes `0` is responsible for returning
	/// the storage to a pool, since only it knows which pool to use.
	pub fn release(&self) -> usize {
		let prev = self.refcount.fetch_sub(1, Ordering::SeqCst);
		debug_assert!(prev > 0, "RecordBuffer refcount underflow");
		prev - 1
	}

	/// Releases this buffer and, if the refcount just reached zero, returns
	/// its storage to `pool` (spec.md §4.7: "release callback returns the
	/// buffer to its pool when refcount hits 0"). Returns whether this call
	/// freed the buffer.
	pub fn release_to_pool(&self, pool: &BufferPool) -> bool {
		if self.release() == 0 {
			pool.release(BytesMut::with_capacity(self.len()));
			true
		} else {
			false
		}
	}

	/// Decodes every record packed into this buffer, in order.
	pub fn records(&self) -> Result<Vec<Record>, Error> {
		let mut remaining = self.bytes.clone();
		let mut out = Vec::new();
		while !remaining.is_empty() {
			match Record::unpack(&mut remaining)? {
				Some(rec) => out.push(rec),
				None => return Err(Error::Protocol("truncated record buffer".into())),
			}
		}
		Ok(out)
	}
}

/// Recycles `BytesMut` allocations so the producer and replica consumer
/// don't pay a fresh allocation per buffer. Not itself size-bounded beyond
/// `max_free`; callers enforce their own backpressure via bounded channels.
pub struct BufferPool {
	free: Mutex<VecDeque<BytesMut>>,
	min_size: usize,
	max_free: usize,
}

impl BufferPool {
	pub fn new(min_size: usize, max_free: usize) -> Self {
		Self {
			free: Mutex::new(VecDeque::new()),
			min_size,
			max_free,
		}
	}

	/// Acquires a buffer with at least `hint_len` bytes of capacity,
	/// resizing a recycled one if it's too small or wastefully large (spec.md
	/// §4.8: "resizes adaptively, grow if too small, shrink if >=10x
	/// over-provisioned above minimum").
	pub fn acquire(&self, hint_len: usize) -> BytesMut {
		let target = hint_len.max(self.min_size);
		let mut free = self.free.lock().unwrap();
		if let Some(mut buf) = free.pop_front() {
			buf.clear();
			if buf.capacity() < target {
				// `len` is 0 after `clear`, so `reserve(target)` alone gets
				// capacity up to `target`.
				buf.reserve(target);
			} else if buf.capacity() >= 10 * target {
				buf = BytesMut::with_capacity(target);
			}
			buf
		} else {
			BytesMut::with_capacity(target)
		}
	}

	pub fn release(&self, buf: BytesMut) {
		let mut free = self.free.lock().unwrap();
		if free.len() < self.max_free {
			free.push_back(buf);
		}
	}

	pub fn free_count(&self) -> usize {
		self.free.lock().unwrap().len()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::record::OpType;

	fn sample_bytes(versions: &[u64]) -> (Bytes, u64) {
		let mut buf = BytesMut::new();
		let mut last = 0;
		for &v in versions {
			Record::new(OpType::Create, v, 1, "ns".into(), "/p".into(), 0o644, 0, 0)
				.unwrap()
				.pack(&mut buf);
			last = v;
		}
		(buf.freeze(), last)
	}

	#[test]
	fn refcount_reaches_zero_after_all_releases() {
		let (bytes, last) = sample_bytes(&[1, 2, 3]);
		let rb = RecordBuffer::new(bytes, last, 3);
		assert_eq!(rb.release(), 2);
		assert_eq!(rb.release(), 1);
		assert_eq!(rb.release(), 0);
	}

	#[test]
	fn release_to_pool_only_frees_storage_at_zero() {
		let pool = BufferPool::new(64, 4);
		let (bytes, last) = sample_bytes(&[1]);
		let rb = RecordBuffer::new(bytes, last, 2);
		assert!(!rb.release_to_pool(&pool));
		assert_eq!(pool.free_count(), 0);
		assert!(rb.release_to_pool(&pool));
		assert_eq!(pool.free_count(), 1);
	}

	#[test]
	fn records_decode_in_order() {
		let (bytes, last) = sample_bytes(&[5, 6]);
		let rb = RecordBuffer::new(bytes, last, 1);
		let recs = rb.records().unwrap();
		assert_eq!(recs.len(), 2);
		assert_eq!(recs[0].data_version, 5);
		assert_eq!(recs[1].data_version, 6);
	}

	#[test]
	fn pool_recycles_and_shrinks_oversized_buffers() {
		let pool = BufferPool::new(64, 4);
		let big = pool.acquire(4096);
		assert!(big.capacity() >= 4096);
		pool.release(big);
		assert_eq!(pool.free_count(), 1);

		let small = pool.acquire(64);
		assert!(small.capacity() < 4096, "oversized buffer should have been reallocated smaller");
	}

	#[test]
	fn pool_grows_undersized_buffers() {
		let pool = BufferPool::new(16, 4);
		let small = pool.acquire(16);
		pool.release(small);
		let bigger = pool.acquire(1024);
		assert!(bigger.capacity() >= 1024);
	}
}
