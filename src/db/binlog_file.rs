//! The append-only binlog file the write thread appends record buffers to,
//! and the replay reader used at startup to bring the dentry store forward
//! (spec.md §4.9, §6: "binlog/ ... rotated by size ... applied to in-memory
//! state at startup by replaying the local binlog up to its end").
//!
//! The on-disk layout beyond what replication requires is explicitly out of
//! scope (spec.md §1); this just needs files that can be appended to,
//! fsynced, rotated, and replayed back into a stream of [`Record`]s.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::buffer::RecordBuffer;
use crate::record::Record;
use fdir_util::error::Error;

const FILE_PREFIX: &str = "binlog";

/// A single binlog segment file, open for append.
pub struct BinlogFile {
	dir: PathBuf,
	index: u64,
	file: File,
	size: u64,
	rotate_size: u64,
}

impl BinlogFile {
	/// Opens (creating if necessary) the highest-indexed segment under `dir`,
	/// or starts segment 0 if the directory is empty.
	pub async fn open(dir: impl AsRef<Path>, rotate_size: u64) -> Result<Self, Error> {
		let dir = dir.as_ref().to_path_buf();
		fs::create_dir_all(&dir)
			.await
			.map_err(|e| Error::Message(format!("cannot create binlog dir {}: {}", dir.display(), e)))?;

		let index = list_segments(&dir).await?.into_iter().max().unwrap_or(0);
		let path = segment_path(&dir, index);
		let file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(&path)
			.await
			.map_err(|e| Error::Message(format!("cannot open binlog segment {}: {}", path.display(), e)))?;
		let size = file
			.metadata()
			.await
			.map_err(|e| Error::Message(format!("cannot stat {}: {}", path.display(), e)))?
			.len();

		Ok(Self {
			dir,
			index,
			file,
			size,
			rotate_size,
		})
	}

	/// Appends one buffer and fsyncs: the write thread treats each buffer as
	/// a group boundary (spec.md §4.9: "fsyncing at group boundaries").
	/// Rotates to a new segment first if this write would exceed
	/// `rotate_size`.
	pub async fn append(&mut self, buffer: &RecordBuffer) -> Result<(), Error> {
		if self.size > 0 && self.size + buffer.len() as u64 > self.rotate_size {
			self.rotate().await?;
		}
		let bytes = buffer.raw_bytes();
		self.write_bytes(&bytes).await
	}

	async fn write_bytes(&mut self, bytes: &Bytes) -> Result<(), Error> {
		self.file.write_all(bytes).await.map_err(|e| {
			error!("binlog append failed, segment {}: {}", self.index, e);
			Error::Invariant(format!("binlog append failed: {}", e))
		})?;
		self.file.sync_data().await.map_err(|e| {
			error!("binlog fsync failed, segment {}: {}", self.index, e);
			Error::Invariant(format!("binlog fsync failed: {}", e))
		})?;
		self.size += bytes.len() as u64;
		Ok(())
	}

	async fn rotate(&mut self) -> Result<(), Error> {
		self.index += 1;
		debug!("rotating binlog to segment {}", self.index);
		let path = segment_path(&self.dir, self.index);
		self.file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(&path)
			.await
			.map_err(|e| Error::Message(format!("cannot create binlog segment {}: {}", path.display(), e)))?;
		self.size = 0;
		Ok(())
	}

	pub fn current_segment(&self) -> u64 {
		self.index
	}
}

/// Replays every segment under `dir` in order, returning the full decoded
/// record stream and the highest `data_version` seen (used to seed the
/// in-memory counter after restart, spec.md §6).
pub async fn replay(dir: impl AsRef<Path>) -> Result<(Vec<Record>, u64), Error> {
	let dir = dir.as_ref();
	if !dir.exists() {
		return Ok((Vec::new(), 0));
	}
	let mut indices = list_segments(dir).await?;
	indices.sort_unstable();

	let mut records = Vec::new();
	let mut max_version = 0u64;
	for index in indices {
		let path = segment_path(dir, index);
		let mut file = File::open(&path)
			.await
			.map_err(|e| Error::Message(format!("cannot open {}: {}", path.display(), e)))?;
		let mut data = Vec::new();
		file.read_to_end(&mut data)
			.await
			.map_err(|e| Error::Message(format!("cannot read {}: {}", path.display(), e)))?;
		let mut bytes = Bytes::from(data);
		while !bytes.is_empty() {
			match Record::unpack(&mut bytes)? {
				Some(rec) => {
					max_version = max_version.max(rec.data_version);
					records.push(rec);
				}
				None => return Err(Error::Invariant(format!("truncated binlog segment {}", path.display()))),
			}
		}
	}
	Ok((records, max_version))
}

fn segment_path(dir: &Path, index: u64) -> PathBuf {
	dir.join(format!("{}.{:06}", FILE_PREFIX, index))
}

async fn list_segments(dir: &Path) -> Result<Vec<u64>, Error> {
	let mut entries = match fs::read_dir(dir).await {
		Ok(e) => e,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
		Err(e) => return Err(Error::Message(format!("cannot list {}: {}", dir.display(), e))),
	};
	let mut indices = Vec::new();
	while let Some(entry) = entries
		.next_entry()
		.await
		.map_err(|e| Error::Message(format!("cannot list {}: {}", dir.display(), e)))?
	{
		let name = entry.file_name();
		let name = name.to_string_lossy();
		if let Some(rest) = name.strip_prefix(&format!("{}.", FILE_PREFIX)) {
			if let Ok(idx) = rest.parse::<u64>() {
				indices.push(idx);
			}
		}
	}
	Ok(indices)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::record::OpType;
	use bytes::BytesMut;

	fn make_buffer(versions: &[u64]) -> RecordBuffer {
		let mut buf = BytesMut::new();
		let mut last = 0;
		for &v in versions {
			Record::new(OpType::Create, v, 1, "ns".into(), "/p".into(), 0o644, 0, 0)
				.unwrap()
				.pack(&mut buf);
			last = v;
		}
		RecordBuffer::new(buf.freeze(), last, 1)
	}

	#[tokio::test]
	async fn append_then_replay_round_trips() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let mut file = BinlogFile::open(&dir, 1 << 20).await.unwrap();
		file.append(&make_buffer(&[1, 2])).await.unwrap();
		file.append(&make_buffer(&[3])).await.unwrap();

		let (records, max_version) = replay(&dir).await.unwrap();
		assert_eq!(records.iter().map(|r| r.data_version).collect::<Vec<_>>(), vec![1, 2, 3]);
		assert_eq!(max_version, 3);
	}

	#[tokio::test]
	async fn rotates_when_segment_would_exceed_limit() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let buf = make_buffer(&[1]);
		let rotate_size = buf.len() as u64; // first write fills the segment exactly
		let mut file = BinlogFile::open(&dir, rotate_size).await.unwrap();
		file.append(&buf).await.unwrap();
		assert_eq!(file.current_segment(), 0);
		file.append(&make_buffer(&[2])).await.unwrap();
		assert_eq!(file.current_segment(), 1);

		let (records, _) = replay(&dir).await.unwrap();
		assert_eq!(records.len(), 2);
	}

	#[tokio::test]
	async fn replay_of_missing_dir_is_empty() {
		let dir = mktemp::Temp::new_dir().unwrap();
		let missing = dir.join("does-not-exist");
		let (records, max_version) = replay(&missing).await.unwrap();
		assert!(records.is_empty());
		assert_eq!(max_version, 0);
	}
}
