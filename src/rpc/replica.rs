//! Slave-side replica consumer (spec.md §4.8), grounded on
//! `replica_consumer_thread.c`'s free/input/result queue pipeline: a pushed
//! buffer is decoded and applied in order against the local [`DentryStore`]
//! by a single replay worker, which reports one `{data_version, err_no}`
//! result per record; a gap in `data_version` is fatal to the session.
//!
//! This crate's push is request/response rather than free-running threads
//! pumping independent queues, so the `result` queue collapses to a
//! per-push oneshot: the worker still drains `input` (the `mpsc` below) in
//! FIFO order and still produces the same per-record result list, but the
//! caller that enqueued a buffer is also the one that awaits its results.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

use fdir_db::{BufferPool, DentryStore, RecordBuffer};
use fdir_util::error::Error;

/// Packs `PUSH_BINLOG_RESP { count, [{data_version, err_no}] }` (spec.md
/// §4.8).
pub fn pack_push_binlog_resp(results: &[(u64, i32)]) -> Bytes {
	let mut out = BytesMut::with_capacity(4 + results.len() * 12);
	out.put_u32(results.len() as u32);
	for (data_version, err_no) in results {
		out.put_u64(*data_version);
		out.put_i32(*err_no);
	}
	out.freeze()
}

pub fn unpack_push_binlog_resp(mut body: Bytes) -> Result<Vec<(u64, i32)>, Error> {
	if body.len() < 4 {
		return Err(Error::Protocol("truncated PUSH_BINLOG_RESP".into()));
	}
	let count = body.get_u32() as usize;
	if body.len() < count * 12 {
		return Err(Error::Protocol("truncated PUSH_BINLOG_RESP records".into()));
	}
	let mut results = Vec::with_capacity(count);
	for _ in 0..count {
		results.push((body.get_u64(), body.get_i32()));
	}
	Ok(results)
}

type PushResult = Vec<(u64, i32)>;

/// The input handle a connection-handling task pushes received
/// `PUSH_BINLOG_REQ` bodies into; `push` returns once the replay worker has
/// actually applied (or rejected) every record in the buffer.
#[derive(Clone)]
pub struct ReplicaConsumer {
	tx: mpsc::Sender<(Bytes, oneshot::Sender<PushResult>)>,
}

impl ReplicaConsumer {
	pub async fn push(&self, body: Bytes) -> Result<PushResult, Error> {
		let (result_tx, result_rx) = oneshot::channel();
		self.tx
			.send((body, result_tx))
			.await
			.map_err(|_| Error::Resource("replica consumer queue closed".into()))?;
		result_rx.await.map_err(|_| Error::Invariant("replica worker stopped before replying (binlog gap)".into()))
	}
}

/// Builds the ack for an inbound push: enqueues the buffer for replay, waits
/// for the replay worker's per-record results, and packs them.
pub async fn handle_push_binlog(consumer: &ReplicaConsumer, body: Bytes) -> Result<Bytes, Error> {
	let results = consumer.push(body).await?;
	Ok(pack_push_binlog_resp(&results))
}

/// Spawns the replay worker and returns the handle connections push into.
pub fn spawn<S: DentryStore + 'static>(
	store: Arc<S>,
	pool: Arc<BufferPool>,
	queue_capacity: usize,
	continue_flag: Arc<AtomicBool>,
) -> (ReplicaConsumer, tokio::task::JoinHandle<()>) {
	let (tx, rx) = mpsc::channel(queue_capacity);
	let handle = tokio::spawn(run(rx, pool, store, continue_flag));
	(ReplicaConsumer { tx }, handle)
}

async fn run<S: DentryStore>(
	mut rx: mpsc::Receiver<(Bytes, oneshot::Sender<PushResult>)>,
	pool: Arc<BufferPool>,
	store: Arc<S>,
	continue_flag: Arc<AtomicBool>,
) {
	while continue_flag.load(Ordering::SeqCst) {
		let (body, result_tx) = match rx.recv().await {
			Some(v) => v,
			None => break,
		};
		let buffer = RecordBuffer::new(body, 0, 1);
		let outcome = replay_one(&buffer, store.as_ref());
		buffer.release_to_pool(&pool);
		match outcome {
			Some(results) => {
				let _ = result_tx.send(results);
			}
			None => {
				continue_flag.store(false, Ordering::SeqCst);
				drop(result_tx);
				break;
			}
		}
	}
}

/// Decodes and applies every record in `buffer`, producing one
/// `{data_version, err_no}` per record (`err_no` 0 on success, the
/// application error code on a deterministic rejection such as `EEXIST`).
/// Returns `None` on a malformed buffer or a binlog gap, either of which is
/// fatal to the replication session (spec.md §8: "gap in data_version is
/// fatal, not retried").
fn replay_one(buffer: &RecordBuffer, store: &dyn DentryStore) -> Option<Vec<(u64, i32)>> {
	let records = match buffer.records() {
		Ok(r) => r,
		Err(e) => {
			error!("malformed push_binlog buffer: {}", e);
			return None;
		}
	};
	let mut results = Vec::with_capacity(records.len());
	for rec in records {
		let applied = store.applied_data_version();
		if rec.data_version <= applied {
			debug!("skipping already-applied record {} (applied {})", rec.data_version, applied);
			results.push((rec.data_version, 0));
			continue;
		}
		if rec.data_version != applied + 1 {
			error!("binlog gap detected: applied {}, next record {}", applied, rec.data_version);
			return None;
		}
		let err_no = match store.apply(&rec) {
			Ok(()) => 0,
			Err(e) => {
				warn!("replica apply failed for data_version {}: {}", rec.data_version, e);
				e.code()
			}
		};
		results.push((rec.data_version, err_no));
	}
	Some(results)
}

#[cfg(test)]
mod test {
	use super::*;
	use fdir_db::record::{OpType, Record};
	use std::sync::atomic::AtomicU64;
	use std::sync::Mutex;
	use std::time::Duration;

	struct TestStore {
		applied: AtomicU64,
		applied_records: Mutex<Vec<Record>>,
	}

	impl TestStore {
		fn new() -> Self {
			Self {
				applied: AtomicU64::new(0),
				applied_records: Mutex::new(Vec::new()),
			}
		}
	}

	impl DentryStore for TestStore {
		fn apply(&self, record: &Record) -> Result<(), Error> {
			self.applied.store(record.data_version, Ordering::SeqCst);
			self.applied_records.lock().unwrap().push(record.clone());
			Ok(())
		}

		fn applied_data_version(&self) -> u64 {
			self.applied.load(Ordering::SeqCst)
		}
	}

	fn sample(v: u64) -> Record {
		Record::new(OpType::Create, v, 1, "ns".into(), "/p".into(), 0o644, 0, 0).unwrap()
	}

	fn packed(records: &[Record]) -> Bytes {
		let mut buf = BytesMut::new();
		for r in records {
			r.pack(&mut buf);
		}
		buf.freeze()
	}

	#[test]
	fn applies_contiguous_records_in_order() {
		let store = TestStore::new();
		let buffer = RecordBuffer::new(packed(&[sample(1), sample(2)]), 2, 1);
		let results = replay_one(&buffer, &store).unwrap();
		assert_eq!(results, vec![(1, 0), (2, 0)]);
		assert_eq!(store.applied_data_version(), 2);
		assert_eq!(store.applied_records.lock().unwrap().len(), 2);
	}

	#[test]
	fn skips_already_applied_records_idempotently() {
		let store = TestStore::new();
		store.apply(&sample(1)).unwrap();
		let buffer = RecordBuffer::new(packed(&[sample(1), sample(2)]), 2, 1);
		let results = replay_one(&buffer, &store).unwrap();
		assert_eq!(results, vec![(1, 0), (2, 0)]);
		assert_eq!(store.applied_records.lock().unwrap().len(), 2);
	}

	#[test]
	fn gap_in_data_version_is_fatal() {
		let store = TestStore::new();
		let buffer = RecordBuffer::new(packed(&[sample(5)]), 5, 1);
		assert!(replay_one(&buffer, &store).is_none());
		assert_eq!(store.applied_data_version(), 0);
	}

	#[tokio::test]
	async fn push_binlog_resp_round_trips() {
		let body = pack_push_binlog_resp(&[(3, 0), (4, 17)]);
		assert_eq!(unpack_push_binlog_resp(body).unwrap(), vec![(3, 0), (4, 17)]);
	}

	#[tokio::test]
	async fn push_returns_per_record_results() {
		let store = Arc::new(TestStore::new());
		let pool = Arc::new(BufferPool::new(64, 4));
		let continue_flag = Arc::new(AtomicBool::new(true));
		let (consumer, _handle) = spawn(store.clone(), pool, 4, continue_flag.clone());

		let results = consumer.push(packed(&[sample(1), sample(2)])).await.unwrap();
		assert_eq!(results, vec![(1, 0), (2, 0)]);
	}

	#[tokio::test]
	async fn gap_via_consumer_clears_continue_flag_and_fails_the_push() {
		let store = Arc::new(TestStore::new());
		let pool = Arc::new(BufferPool::new(64, 4));
		let continue_flag = Arc::new(AtomicBool::new(true));
		let (consumer, handle) = spawn(store.clone(), pool, 4, continue_flag.clone());

		assert!(consumer.push(packed(&[sample(9)])).await.is_err());
		tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
		assert!(!continue_flag.load(Ordering::SeqCst));
	}
}
