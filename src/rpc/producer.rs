//! Producer (master side): assembles committed mutations into record
//! buffers and fans them out to the write thread and every active slave's
//! push queue (spec.md §4.7).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use fdir_db::{BufferPool, Record, RecordBuffer};
use fdir_util::error::Error;

/// Per-slave push queues, registered when a slave's replica session is
/// accepted and removed when it disconnects (spec.md §4.3's `active_slaves`,
/// realised here as the producer's fan-out targets).
#[derive(Default)]
pub struct SlaveQueues {
	inner: Mutex<HashMap<u32, mpsc::Sender<RecordBuffer>>>,
}

impl SlaveQueues {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&self, server_id: u32, tx: mpsc::Sender<RecordBuffer>) {
		self.inner.lock().unwrap().insert(server_id, tx);
	}

	pub fn unregister(&self, server_id: u32) {
		self.inner.lock().unwrap().remove(&server_id);
	}

	pub fn snapshot(&self) -> Vec<(u32, mpsc::Sender<RecordBuffer>)> {
		self.inner.lock().unwrap().iter().map(|(id, tx)| (*id, tx.clone())).collect()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().unwrap().len()
	}
}

/// Packs a batch of records into one buffer, refcounted for the write
/// thread plus every currently active slave (spec.md §4.7: "refcount = 1
/// (write_thread) + N_active_slaves").
pub fn pack_batch(records: &[Record], pool: &BufferPool, active_slave_count: usize) -> RecordBuffer {
	let hint = records.len() * 64;
	let mut raw = pool.acquire(hint);
	for rec in records {
		rec.pack(&mut raw);
	}
	let last_data_version = records.last().map(|r| r.data_version).unwrap_or(0);
	RecordBuffer::new(raw.freeze(), last_data_version, 1 + active_slave_count)
}

/// The producer's input handle: request handlers submit committed mutations
/// here.
#[derive(Clone)]
pub struct ProducerHandle {
	tx: mpsc::Sender<Record>,
}

impl ProducerHandle {
	pub async fn submit(&self, record: Record) -> Result<(), Error> {
		self.tx
			.send(record)
			.await
			.map_err(|_| Error::Resource("producer queue closed".into()))
	}
}

/// Spawns the producer task and returns a handle to submit records to it.
/// Buffers are flushed either once `flush_batch_size` records have
/// accumulated or `flush_interval` has elapsed since the first unflushed
/// record (spec.md §4.7).
pub fn spawn(
	pool: Arc<BufferPool>,
	write_tx: mpsc::Sender<RecordBuffer>,
	slaves: Arc<SlaveQueues>,
	flush_batch_size: usize,
	flush_interval: Duration,
	continue_flag: Arc<AtomicBool>,
) -> ProducerHandle {
	let (tx, rx) = mpsc::channel(flush_batch_size.max(1) * 4);
	tokio::spawn(run(rx, pool, write_tx, slaves, flush_batch_size, flush_interval, continue_flag));
	ProducerHandle { tx }
}

async fn run(
	mut rx: mpsc::Receiver<Record>,
	pool: Arc<BufferPool>,
	write_tx: mpsc::Sender<RecordBuffer>,
	slaves: Arc<SlaveQueues>,
	flush_batch_size: usize,
	flush_interval: Duration,
	continue_flag: Arc<AtomicBool>,
) {
	let mut batch: Vec<Record> = Vec::with_capacity(flush_batch_size);
	let mut deadline = Instant::now() + flush_interval;

	while continue_flag.load(Ordering::SeqCst) {
		tokio::select! {
			maybe_rec = rx.recv() => {
				match maybe_rec {
					Some(rec) => {
						batch.push(rec);
						if batch.len() >= flush_batch_size {
							flush(&mut batch, &pool, &write_tx, &slaves).await;
							deadline = Instant::now() + flush_interval;
						}
					}
					None => break,
				}
			}
			_ = tokio::time::sleep_until(deadline) => {
				if !batch.is_empty() {
					flush(&mut batch, &pool, &write_tx, &slaves).await;
				}
				deadline = Instant::now() + flush_interval;
			}
		}
	}
	if !batch.is_empty() {
		flush(&mut batch, &pool, &write_tx, &slaves).await;
	}
}

async fn flush(batch: &mut Vec<Record>, pool: &BufferPool, write_tx: &mpsc::Sender<RecordBuffer>, slaves: &SlaveQueues) {
	let slave_txs = slaves.snapshot();
	let buffer = pack_batch(batch, pool, slave_txs.len());
	batch.clear();

	if write_tx.send(buffer.clone()).await.is_err() {
		error!("write thread queue closed, binlog durability lost for this buffer");
	}
	for (server_id, tx) in slave_txs {
		if tx.send(buffer.clone()).await.is_err() {
			warn!("slave {} push queue closed, dropping from this buffer's fan-out", server_id);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use fdir_db::record::OpType;

	fn sample(v: u64) -> Record {
		Record::new(OpType::Create, v, 1, "ns".into(), "/p".into(), 0o644, 0, 0).unwrap()
	}

	#[test]
	fn pack_batch_sets_refcount_for_write_thread_plus_slaves() {
		let pool = BufferPool::new(64, 4);
		let records = vec![sample(1), sample(2)];
		let buffer = pack_batch(&records, &pool, 3);
		assert_eq!(buffer.refcount(), 4);
		assert_eq!(buffer.last_data_version, 2);
	}

	#[tokio::test]
	async fn flushes_on_batch_size() {
		let pool = Arc::new(BufferPool::new(64, 4));
		let (write_tx, mut write_rx) = mpsc::channel(8);
		let slaves = Arc::new(SlaveQueues::new());
		let continue_flag = Arc::new(AtomicBool::new(true));
		let handle = spawn(pool, write_tx, slaves, 2, Duration::from_secs(60), continue_flag.clone());

		handle.submit(sample(1)).await.unwrap();
		handle.submit(sample(2)).await.unwrap();

		let buffer = tokio::time::timeout(Duration::from_secs(1), write_rx.recv())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(buffer.last_data_version, 2);
		continue_flag.store(false, Ordering::SeqCst);
	}

	#[tokio::test]
	async fn flushes_on_interval_with_partial_batch() {
		let pool = Arc::new(BufferPool::new(64, 4));
		let (write_tx, mut write_rx) = mpsc::channel(8);
		let slaves = Arc::new(SlaveQueues::new());
		let continue_flag = Arc::new(AtomicBool::new(true));
		let handle = spawn(pool, write_tx, slaves, 100, Duration::from_millis(20), continue_flag.clone());

		handle.submit(sample(1)).await.unwrap();

		let buffer = tokio::time::timeout(Duration::from_secs(1), write_rx.recv())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(buffer.last_data_version, 1);
		continue_flag.store(false, Ordering::SeqCst);
	}
}
