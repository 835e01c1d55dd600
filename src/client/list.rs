//! Client-side paged listing (spec.md §4.11, §6): wire pack/unpack for
//! `LIST_DENTRY_FIRST_REQ`/`LIST_DENTRY_NEXT_REQ` and the page they return.
//! This is a client-local type, not `fdir_model::DentryInfo` — the client
//! crate has no business depending on the server's storage crate.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use fdir_rpc::proto::{get_str16, put_str16};
use fdir_util::data::Token;
use fdir_util::error::Error;

/// One entry in a listing response: a direct child's name and attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DentryEntry {
	pub name: String,
	pub inode: u64,
	pub mode: u32,
	pub flags: u32,
	pub timestamp: u64,
}

/// One page of a listing, plus whatever's needed to fetch the next one.
#[derive(Debug, Clone)]
pub struct ListPage {
	pub entries: Vec<DentryEntry>,
	pub is_last: bool,
	pub token: Token,
}

pub fn pack_list_first_req(ns: &str, path: &str) -> Bytes {
	let mut out = BytesMut::with_capacity(4 + ns.len() + path.len());
	put_str16(&mut out, ns);
	put_str16(&mut out, path);
	out.freeze()
}

/// `{u8[16] token, u32_be offset}`: `offset` is the count of entries the
/// client has accumulated so far across this listing (spec.md §4.11).
pub fn pack_list_next_req(token: Token, offset: u32) -> Bytes {
	let mut out = BytesMut::with_capacity(20);
	out.put_slice(&token.0);
	out.put_u32(offset);
	out.freeze()
}

pub fn unpack_list_next_req(mut body: Bytes) -> Result<(Token, u32), Error> {
	if body.len() < 20 {
		return Err(Error::Protocol("truncated LIST_DENTRY_NEXT_REQ".into()));
	}
	let mut raw = [0u8; 16];
	body.copy_to_slice(&mut raw);
	let offset = body.get_u32();
	Ok((Token(raw), offset))
}

/// Packs a listing response: `{u32_be count, u8 is_last, u8[16] token,
/// [parts]}`, each part `{u8 name_len, name_bytes, u64 inode, u32 mode, u32
/// flags, u64 timestamp}` (spec.md §6).
pub fn pack_list_resp(entries: &[DentryEntry], is_last: bool, token: Token) -> Bytes {
	let mut out = BytesMut::with_capacity(4 + 1 + 16 + entries.len() * 32);
	out.put_u32(entries.len() as u32);
	out.put_u8(is_last as u8);
	out.put_slice(&token.0);
	for e in entries {
		out.put_u8(e.name.len() as u8);
		out.put_slice(e.name.as_bytes());
		out.put_u64(e.inode);
		out.put_u32(e.mode);
		out.put_u32(e.flags);
		out.put_u64(e.timestamp);
	}
	out.freeze()
}

pub fn unpack_list_resp(mut body: Bytes) -> Result<ListPage, Error> {
	if body.len() < 4 + 1 + 16 {
		return Err(Error::Protocol("truncated list response header".into()));
	}
	let count = body.get_u32() as usize;
	let is_last = body.get_u8() != 0;
	let mut token = [0u8; 16];
	body.copy_to_slice(&mut token);

	let mut entries = Vec::with_capacity(count);
	for _ in 0..count {
		if body.is_empty() {
			return Err(Error::Protocol("truncated list entry".into()));
		}
		let name_len = body.get_u8() as usize;
		if body.len() < name_len + 8 + 4 + 4 + 8 {
			return Err(Error::Protocol("truncated list entry body".into()));
		}
		let name = String::from_utf8(body.split_to(name_len).to_vec()).map_err(|_| Error::Protocol("entry name not utf8".into()))?;
		let inode = body.get_u64();
		let mode = body.get_u32();
		let flags = body.get_u32();
		let timestamp = body.get_u64();
		entries.push(DentryEntry {
			name,
			inode,
			mode,
			flags,
			timestamp,
		});
	}
	Ok(ListPage {
		entries,
		is_last,
		token: Token(token),
	})
}

/// `{u16_be ns_len, ns, u16_be path_len, path}` req body shared by create
/// and remove, plus their mutation-specific fields.
pub fn pack_create_dentry_req(ns: &str, path: &str, mode: u32, flags: u32) -> Bytes {
	let mut out = BytesMut::with_capacity(4 + ns.len() + path.len() + 8);
	put_str16(&mut out, ns);
	put_str16(&mut out, path);
	out.put_u32(mode);
	out.put_u32(flags);
	out.freeze()
}

pub struct CreateDentryReq {
	pub ns: String,
	pub path: String,
	pub mode: u32,
	pub flags: u32,
}

pub fn unpack_create_dentry_req(mut body: Bytes) -> Result<CreateDentryReq, Error> {
	let ns = get_str16(&mut body)?;
	let path = get_str16(&mut body)?;
	if body.len() < 8 {
		return Err(Error::Protocol("truncated CREATE_DENTRY body".into()));
	}
	let mode = body.get_u32();
	let flags = body.get_u32();
	Ok(CreateDentryReq { ns, path, mode, flags })
}

pub fn pack_remove_dentry_req(ns: &str, path: &str) -> Bytes {
	let mut out = BytesMut::with_capacity(4 + ns.len() + path.len());
	put_str16(&mut out, ns);
	put_str16(&mut out, path);
	out.freeze()
}

pub struct RemoveDentryReq {
	pub ns: String,
	pub path: String,
}

pub fn unpack_remove_dentry_req(mut body: Bytes) -> Result<RemoveDentryReq, Error> {
	let ns = get_str16(&mut body)?;
	let path = get_str16(&mut body)?;
	Ok(RemoveDentryReq { ns, path })
}

pub fn unpack_list_first_req(mut body: Bytes) -> Result<(String, String), Error> {
	let ns = get_str16(&mut body)?;
	let path = get_str16(&mut body)?;
	Ok((ns, path))
}

#[cfg(test)]
mod test {
	use super::*;

	fn entries() -> Vec<DentryEntry> {
		vec![
			DentryEntry {
				name: "a".into(),
				inode: 1,
				mode: 0o755,
				flags: 0,
				timestamp: 10,
			},
			DentryEntry {
				name: "b".into(),
				inode: 2,
				mode: 0o644,
				flags: 1,
				timestamp: 20,
			},
		]
	}

	#[test]
	fn list_resp_round_trips() {
		let token = Token::random();
		let body = pack_list_resp(&entries(), false, token);
		let page = unpack_list_resp(body).unwrap();
		assert_eq!(page.entries, entries());
		assert!(!page.is_last);
		assert_eq!(page.token, token);
	}

	#[test]
	fn list_next_req_round_trips() {
		let token = Token::random();
		let body = pack_list_next_req(token, 42);
		assert_eq!(unpack_list_next_req(body).unwrap(), (token, 42));
	}

	#[test]
	fn create_dentry_req_round_trips() {
		let body = pack_create_dentry_req("ns", "/a/b", 0o755, 3);
		let req = unpack_create_dentry_req(body).unwrap();
		assert_eq!(req.ns, "ns");
		assert_eq!(req.path, "/a/b");
		assert_eq!(req.mode, 0o755);
		assert_eq!(req.flags, 3);
	}

	#[test]
	fn remove_dentry_req_round_trips() {
		let body = pack_remove_dentry_req("ns", "/a/b");
		let req = unpack_remove_dentry_req(body).unwrap();
		assert_eq!(req.ns, "ns");
		assert_eq!(req.path, "/a/b");
	}
}
