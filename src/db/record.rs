//! Mutation records: the unit the master produces, the write thread appends
//! to the binlog file, and the replica consumer replays against the local
//! dentry store.
//!
//! Encoding is line-oriented and length-prefixed (one packed record follows
//! the next with no separator needed), suitable for both file storage and
//! wire push: `u32_be total_len | u8 op_type | u64_be data_version |
//! u64_be inode | u8 ns_len | ns | u16_be path_len | path | u32_be mode |
//! u32_be flags | u64_be timestamp`.

use std::convert::TryInto;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use fdir_util::error::{errno, Error};

pub const NAME_MAX: usize = 255;
pub const PATH_MAX: usize = 4096;

/// Mutation kind carried by a record. Mirrors the `CREATE_DENTRY` /
/// `REMOVE_DENTRY` command family (spec.md §6); a rewrite that grows the
/// dentry tree's own feature set would add variants here, not change the
/// framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
	Create,
	Remove,
}

impl OpType {
	fn as_u8(self) -> u8 {
		match self {
			OpType::Create => 1,
			OpType::Remove => 2,
		}
	}

	fn from_u8(v: u8) -> Result<Self, Error> {
		match v {
			1 => Ok(OpType::Create),
			2 => Ok(OpType::Remove),
			_ => Err(Error::Protocol(format!("unknown op_type {}", v))),
		}
	}
}

/// One mutation, as produced by the master's request handler and applied
/// on every peer in `data_version` order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
	pub op_type: OpType,
	pub data_version: u64,
	pub inode: u64,
	pub ns: String,
	pub path: String,
	pub mode: u32,
	pub flags: u32,
	pub timestamp: u64,
}

impl Record {
	pub fn new(
		op_type: OpType,
		data_version: u64,
		inode: u64,
		ns: String,
		path: String,
		mode: u32,
		flags: u32,
		timestamp: u64,
	) -> Result<Self, Error> {
		if ns.is_empty() || ns.len() > NAME_MAX {
			return Err(Error::invalid(format!("ns length {} out of range", ns.len())));
		}
		if path.is_empty() || path.len() > PATH_MAX {
			return Err(Error::invalid(format!("path length {} out of range", path.len())));
		}
		Ok(Self {
			op_type,
			data_version,
			inode,
			ns,
			path,
			mode,
			flags,
			timestamp,
		})
	}

	/// Appends the packed record to `out`, returning the number of bytes
	/// written (including the length prefix).
	pub fn pack(&self, out: &mut BytesMut) -> usize {
		let start = out.len();
		out.put_u32(0); // length patched below
		out.put_u8(self.op_type.as_u8());
		out.put_u64(self.data_version);
		out.put_u64(self.inode);
		out.put_u8(self.ns.len() as u8);
		out.put_slice(self.ns.as_bytes());
		out.put_u16(self.path.len() as u16);
		out.put_slice(self.path.as_bytes());
		out.put_u32(self.mode);
		out.put_u32(self.flags);
		out.put_u64(self.timestamp);
		let written = out.len() - start;
		let body_len = (written - 4) as u32;
		out[start..start + 4].copy_from_slice(&body_len.to_be_bytes());
		written
	}

	/// Decodes one packed record from the front of `buf`, advancing it past
	/// the record. Returns `Ok(None)` if `buf` does not yet hold a full
	/// record (caller should wait for more bytes).
	pub fn unpack(buf: &mut Bytes) -> Result<Option<Self>, Error> {
		if buf.len() < 4 {
			return Ok(None);
		}
		let body_len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
		if buf.len() < 4 + body_len {
			return Ok(None);
		}
		buf.advance(4);
		let mut body = buf.split_to(body_len);

		if body.len() < 1 + 8 + 8 + 1 {
			return Err(Error::Protocol("truncated record header".into()));
		}
		let op_type = OpType::from_u8(body.get_u8())?;
		let data_version = body.get_u64();
		let inode = body.get_u64();
		let ns_len = body.get_u8() as usize;
		if body.len() < ns_len {
			return Err(Error::Protocol("truncated record ns".into()));
		}
		let ns = String::from_utf8(body.split_to(ns_len).to_vec())
			.map_err(|_| Error::Protocol("record ns not utf8".into()))?;
		if body.len() < 2 {
			return Err(Error::Protocol("truncated record path length".into()));
		}
		let path_len = body.get_u16() as usize;
		if body.len() < path_len {
			return Err(Error::Protocol("truncated record path".into()));
		}
		let path = String::from_utf8(body.split_to(path_len).to_vec())
			.map_err(|_| Error::Protocol("record path not utf8".into()))?;
		if body.len() < 4 + 4 + 8 {
			return Err(Error::Protocol("truncated record tail".into()));
		}
		let mode = body.get_u32();
		let flags = body.get_u32();
		let timestamp = body.get_u64();

		Record::new(op_type, data_version, inode, ns, path, mode, flags, timestamp)
			.map(Some)
			.map_err(|_| Error::application(errno::EINVAL, "invalid record fields"))
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn sample(v: u64) -> Record {
		Record::new(OpType::Create, v, 42, "test".into(), "/a/b".into(), 0o755, 0, 1000).unwrap()
	}

	#[test]
	fn pack_unpack_round_trips() {
		let rec = sample(7);
		let mut buf = BytesMut::new();
		rec.pack(&mut buf);
		let mut bytes = buf.freeze();
		let decoded = Record::unpack(&mut bytes).unwrap().unwrap();
		assert_eq!(decoded, rec);
		assert!(bytes.is_empty());
	}

	#[test]
	fn unpack_waits_for_full_frame() {
		let rec = sample(1);
		let mut buf = BytesMut::new();
		rec.pack(&mut buf);
		let full_len = buf.len();
		let mut partial = buf.freeze().slice(..full_len - 1);
		assert!(Record::unpack(&mut partial).unwrap().is_none());
	}

	#[test]
	fn multiple_records_pack_contiguously() {
		let mut buf = BytesMut::new();
		sample(1).pack(&mut buf);
		sample(2).pack(&mut buf);
		let mut bytes = buf.freeze();
		let first = Record::unpack(&mut bytes).unwrap().unwrap();
		let second = Record::unpack(&mut bytes).unwrap().unwrap();
		assert_eq!(first.data_version, 1);
		assert_eq!(second.data_version, 2);
		assert!(bytes.is_empty());
	}

	#[test]
	fn rejects_oversized_ns() {
		let long_ns = "x".repeat(NAME_MAX + 1);
		assert!(Record::new(OpType::Create, 1, 1, long_ns, "/a".into(), 0, 0, 0).is_err());
	}
}
