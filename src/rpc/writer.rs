//! Write thread (spec.md §4.9): the single consumer that appends every
//! produced buffer to the binlog file, in order, and fsyncs at group
//! boundaries. An append failure is fatal and clears the process-wide
//! `continue_flag` (spec.md §5, §8: "binlog append failure is fatal, not
//! retried").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use fdir_db::binlog_file::BinlogFile;
use fdir_db::{BufferPool, RecordBuffer};

/// Runs until the channel closes or `continue_flag` clears. Each buffer is
/// appended then released back to `pool`; since the write thread always
/// holds one of the buffer's reference counts, this release is always one
/// of the ones that may bring it to zero (spec.md §4.7).
pub async fn run(
	mut rx: mpsc::Receiver<RecordBuffer>,
	mut binlog: BinlogFile,
	pool: Arc<BufferPool>,
	continue_flag: Arc<AtomicBool>,
) {
	while continue_flag.load(Ordering::SeqCst) {
		let buffer = match rx.recv().await {
			Some(b) => b,
			None => break,
		};
		if let Err(e) = binlog.append(&buffer).await {
			error!("binlog append failed, stopping: {}", e);
			continue_flag.store(false, Ordering::SeqCst);
			buffer.release_to_pool(&pool);
			break;
		}
		buffer.release_to_pool(&pool);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use fdir_db::record::{OpType, Record};

	fn sample(v: u64) -> Record {
		Record::new(OpType::Create, v, 1, "ns".into(), "/p".into(), 0o644, 0, 0).unwrap()
	}

	#[tokio::test]
	async fn appends_then_releases_to_pool() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let binlog = BinlogFile::open(&dir, 1 << 20).await.unwrap();
		let pool = Arc::new(BufferPool::new(64, 4));
		let (tx, rx) = mpsc::channel(4);
		let continue_flag = Arc::new(AtomicBool::new(true));

		let mut raw = pool.acquire(64);
		sample(1).pack(&mut raw);
		let buffer = RecordBuffer::new(raw.freeze(), 1, 1);

		tx.send(buffer).await.unwrap();
		drop(tx);

		run(rx, binlog, pool.clone(), continue_flag.clone()).await;

		let (records, last_version) = fdir_db::binlog_file::replay(&dir).await.unwrap();
		assert_eq!(records.len(), 1);
		assert_eq!(last_version, 1);
		assert_eq!(pool.free_count(), 1);
		assert!(continue_flag.load(Ordering::SeqCst));
	}

	#[tokio::test]
	async fn stops_consuming_once_continue_flag_clears() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let binlog = BinlogFile::open(&dir, 1 << 20).await.unwrap();
		let pool = Arc::new(BufferPool::new(64, 4));
		let (_tx, rx) = mpsc::channel(4);
		let continue_flag = Arc::new(AtomicBool::new(false));

		run(rx, binlog, pool, continue_flag.clone()).await;
		assert!(!continue_flag.load(Ordering::SeqCst));
	}
}
