//! The wire frame: every message is an 8-byte header followed by a body
//! (spec.md §4.1, §6). This module owns header pack/unpack, timed reads off
//! a socket, and the `send_request_recv_response` helper used by every
//! higher-level caller (client router, election, heartbeat, replication).

use std::convert::TryInto;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use fdir_util::error::Error;

pub const HEADER_LEN: usize = 8;

/// Command codes, grouped by family as spec.md §6 describes. Values are
/// this rewrite's own numbering; they need only be self-consistent.
pub mod cmd {
	// Service (client-facing)
	pub const ACK: u8 = 0;
	pub const CREATE_DENTRY: u8 = 1;
	pub const REMOVE_DENTRY: u8 = 2;
	pub const LIST_DENTRY_FIRST_REQ: u8 = 3;
	pub const LIST_DENTRY_FIRST_RESP: u8 = 4;
	pub const LIST_DENTRY_NEXT_REQ: u8 = 5;
	pub const LIST_DENTRY_NEXT_RESP: u8 = 6;
	pub const SERVICE_STAT_REQ: u8 = 7;
	pub const SERVICE_STAT_RESP: u8 = 8;
	pub const CLUSTER_STAT_REQ: u8 = 9;
	pub const CLUSTER_STAT_RESP: u8 = 10;
	pub const GET_MASTER_REQ: u8 = 11;
	pub const GET_MASTER_RESP: u8 = 12;
	pub const GET_SLAVES_REQ: u8 = 13;
	pub const GET_SLAVES_RESP: u8 = 14;
	pub const GET_READABLE_SERVER_REQ: u8 = 15;
	pub const GET_READABLE_SERVER_RESP: u8 = 16;

	// Cluster (peer-facing)
	pub const GET_SERVER_STATUS_REQ: u8 = 40;
	pub const GET_SERVER_STATUS_RESP: u8 = 41;
	pub const JOIN_MASTER: u8 = 42;
	pub const PING_MASTER_REQ: u8 = 43;
	pub const PING_MASTER_RESP: u8 = 44;
	pub const PRE_SET_NEXT_MASTER: u8 = 45;
	pub const COMMIT_NEXT_MASTER: u8 = 46;

	// Replica (master -> slave)
	pub const PUSH_BINLOG_REQ: u8 = 80;
	pub const PUSH_BINLOG_RESP: u8 = 81;
}

/// Status byte: 0 means success/ack; nonzero is an errno-like application
/// code (spec.md §7 "surfaced verbatim to the client in the response status
/// byte").
pub const STATUS_OK: u8 = 0;

#[derive(Debug, Clone, Copy)]
pub struct Header {
	pub cmd: u8,
	pub status: u8,
	pub flags: u8,
	pub reserved: u8,
	pub body_len: u32,
}

impl Header {
	pub fn new(cmd: u8, status: u8, body_len: u32) -> Self {
		Self {
			cmd,
			status,
			flags: 0,
			reserved: 0,
			body_len,
		}
	}

	pub fn pack(&self) -> [u8; HEADER_LEN] {
		let mut buf = [0u8; HEADER_LEN];
		buf[0] = self.cmd;
		buf[1] = self.status;
		buf[2] = self.flags;
		buf[3] = self.reserved;
		buf[4..8].copy_from_slice(&self.body_len.to_be_bytes());
		buf
	}

	pub fn unpack(buf: &[u8; HEADER_LEN]) -> Self {
		Self {
			cmd: buf[0],
			status: buf[1],
			flags: buf[2],
			reserved: buf[3],
			body_len: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
		}
	}
}

/// Reads one header off `stream`, bounded by `network_timeout`.
pub async fn read_header<S: AsyncReadExt + Unpin>(stream: &mut S, network_timeout: Duration) -> Result<Header, Error> {
	let mut buf = [0u8; HEADER_LEN];
	timeout(network_timeout, stream.read_exact(&mut buf))
		.await
		.map_err(|_| Error::Network("peer".into(), "timed out reading header".into()))?
		.map_err(|e| Error::Network("peer".into(), format!("EOF/error reading header: {}", e)))?;
	Ok(Header::unpack(&buf))
}

/// Reads exactly `len` bytes of body, bounded by `network_timeout` and
/// `max_body_len` (spec.md §4.1: "body lengths are bounded; over-length is
/// a protocol error").
pub async fn read_body<S: AsyncReadExt + Unpin>(
	stream: &mut S,
	len: u32,
	max_body_len: u32,
	network_timeout: Duration,
) -> Result<Bytes, Error> {
	if len > max_body_len {
		return Err(Error::Protocol(format!("body_len {} exceeds max {}", len, max_body_len)));
	}
	let mut buf = BytesMut::with_capacity(len as usize);
	buf.resize(len as usize, 0);
	timeout(network_timeout, stream.read_exact(&mut buf))
		.await
		.map_err(|_| Error::Network("peer".into(), "timed out reading body".into()))?
		.map_err(|e| Error::Network("peer".into(), format!("EOF/error reading body: {}", e)))?;
	Ok(buf.freeze())
}

/// Writes one full frame (header + body), bounded by `network_timeout`.
pub async fn write_frame<S: AsyncWriteExt + Unpin>(
	stream: &mut S,
	cmd: u8,
	status: u8,
	body: &[u8],
	network_timeout: Duration,
) -> Result<(), Error> {
	let header = Header::new(cmd, status, body.len() as u32);
	let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
	out.put_slice(&header.pack());
	out.put_slice(body);
	timeout(network_timeout, stream.write_all(&out))
		.await
		.map_err(|_| Error::Network("peer".into(), "timed out writing frame".into()))?
		.map_err(|e| Error::Network("peer".into(), format!("write failed: {}", e)))?;
	Ok(())
}

/// Sends one request and reads back exactly one response frame, failing if
/// its `cmd` doesn't match `expected_resp_cmd` or its `status` is nonzero
/// (spec.md §4.1: "send request, read one response of expected cmd, fail
/// if cmd or length mismatches").
pub async fn send_request_recv_response<S: AsyncReadExt + AsyncWriteExt + Unpin>(
	stream: &mut S,
	req_cmd: u8,
	req_body: &[u8],
	expected_resp_cmd: u8,
	max_body_len: u32,
	network_timeout: Duration,
) -> Result<Bytes, Error> {
	write_frame(stream, req_cmd, STATUS_OK, req_body, network_timeout).await?;
	let header = read_header(stream, network_timeout).await?;
	let body = read_body(stream, header.body_len, max_body_len, network_timeout).await?;
	if header.status != STATUS_OK {
		let msg = String::from_utf8_lossy(&body).to_string();
		return Err(Error::application(header.status as i32, msg));
	}
	if header.cmd != expected_resp_cmd {
		return Err(Error::unexpected_rpc_message(header));
	}
	Ok(body)
}

/// Reads a `{u16_be len, bytes}` wire string.
pub fn get_str16(buf: &mut Bytes) -> Result<String, Error> {
	if buf.len() < 2 {
		return Err(Error::Protocol("truncated string length".into()));
	}
	let len = buf.get_u16() as usize;
	if buf.len() < len {
		return Err(Error::Protocol("truncated string body".into()));
	}
	String::from_utf8(buf.split_to(len).to_vec()).map_err(|_| Error::Protocol("string not utf8".into()))
}

pub fn put_str16(out: &mut BytesMut, s: &str) {
	out.put_u16(s.len() as u16);
	out.put_slice(s.as_bytes());
}

pub fn check_name_len(len: usize, max: usize, what: &str) -> Result<(), Error> {
	if len == 0 || len > max {
		return Err(Error::invalid(format!("{} length {} out of range (max {})", what, len, max)));
	}
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn header_round_trips() {
		let h = Header::new(cmd::CREATE_DENTRY, STATUS_OK, 42);
		let packed = h.pack();
		let decoded = Header::unpack(&packed);
		assert_eq!(decoded.cmd, cmd::CREATE_DENTRY);
		assert_eq!(decoded.body_len, 42);
	}

	#[tokio::test]
	async fn send_request_recv_response_round_trips() {
		let (mut client, mut server) = tokio::io::duplex(4096);
		let server_task = tokio::spawn(async move {
			let header = read_header(&mut server, Duration::from_secs(1)).await.unwrap();
			let body = read_body(&mut server, header.body_len, 4096, Duration::from_secs(1))
				.await
				.unwrap();
			assert_eq!(&body[..], b"ping");
			write_frame(&mut server, cmd::ACK, STATUS_OK, b"pong", Duration::from_secs(1))
				.await
				.unwrap();
		});

		let resp = send_request_recv_response(
			&mut client,
			cmd::PING_MASTER_REQ,
			b"ping",
			cmd::ACK,
			4096,
			Duration::from_secs(1),
		)
		.await
		.unwrap();
		assert_eq!(&resp[..], b"pong");
		server_task.await.unwrap();
	}

	#[tokio::test]
	async fn oversized_body_is_rejected() {
		let (mut client, mut server) = tokio::io::duplex(8192);
		let server_task = tokio::spawn(async move {
			write_frame(&mut server, cmd::ACK, STATUS_OK, &[0u8; 100], Duration::from_secs(1))
				.await
				.unwrap();
		});
		let header = read_header(&mut client, Duration::from_secs(1)).await.unwrap();
		let err = read_body(&mut client, header.body_len, 10, Duration::from_secs(1))
			.await
			.unwrap_err();
		assert!(matches!(err, Error::Protocol(_)));
		server_task.await.unwrap();
	}
}
