//! Client router (spec.md §4.10): resolves and caches a master connection
//! and a round-robin readable-server connection, failing over per call
//! rather than defaulting to `servers[0]` (spec.md §9 open issue, redesigned
//! here rather than reproduced).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use fdir_rpc::conn::PeerConn;
use fdir_rpc::proto::{cmd, get_str16, put_str16};
use fdir_util::error::Error;

/// Wire shape shared by `GET_MASTER_RESP` and `GET_READABLE_SERVER_RESP`:
/// one `{server_id, addr}` pair.
pub fn pack_server_ref_resp(server_id: u32, addr: SocketAddr) -> Bytes {
	let mut out = BytesMut::with_capacity(8);
	out.put_u32(server_id);
	put_str16(&mut out, &addr.to_string());
	out.freeze()
}

pub fn unpack_server_ref_resp(mut body: Bytes) -> Result<(u32, SocketAddr), Error> {
	if body.len() < 4 {
		return Err(Error::Protocol("truncated server-ref response".into()));
	}
	let server_id = body.get_u32();
	let addr_str = get_str16(&mut body)?;
	let addr = addr_str
		.parse()
		.map_err(|_| Error::Protocol(format!("bad address {:?} in server-ref response", addr_str)))?;
	Ok((server_id, addr))
}

pub fn pack_get_slaves_resp(slaves: &[(u32, SocketAddr)]) -> Bytes {
	let mut out = BytesMut::with_capacity(2 + slaves.len() * 12);
	out.put_u16(slaves.len() as u16);
	for (server_id, addr) in slaves {
		out.put_u32(*server_id);
		put_str16(&mut out, &addr.to_string());
	}
	out.freeze()
}

pub fn unpack_get_slaves_resp(mut body: Bytes) -> Result<Vec<(u32, SocketAddr)>, Error> {
	if body.len() < 2 {
		return Err(Error::Protocol("truncated GET_SLAVES_RESP".into()));
	}
	let count = body.get_u16() as usize;
	let mut out = Vec::with_capacity(count);
	for _ in 0..count {
		if body.len() < 4 {
			return Err(Error::Protocol("truncated GET_SLAVES_RESP entry".into()));
		}
		let server_id = body.get_u32();
		let addr_str = get_str16(&mut body)?;
		let addr = addr_str
			.parse()
			.map_err(|_| Error::Protocol(format!("bad address {:?} in GET_SLAVES_RESP", addr_str)))?;
		out.push((server_id, addr));
	}
	Ok(out)
}

/// Resolves master/readable-server connections against a bootstrap list of
/// service addresses, caching the result until invalidated by a failed
/// call.
pub struct Router {
	bootstrap: Vec<SocketAddr>,
	connect_timeout: Duration,
	network_timeout: Duration,
	max_body_len: u32,

	master_addr: Mutex<Option<SocketAddr>>,
	readable_servers: Mutex<Vec<SocketAddr>>,
	slave_cursor: AtomicUsize,
}

impl Router {
	pub fn new(bootstrap: Vec<SocketAddr>, connect_timeout: Duration, network_timeout: Duration, max_body_len: u32) -> Self {
		Self {
			bootstrap,
			connect_timeout,
			network_timeout,
			max_body_len,
			master_addr: Mutex::new(None),
			readable_servers: Mutex::new(Vec::new()),
			slave_cursor: AtomicUsize::new(0),
		}
	}

	/// Tries every bootstrap server in turn, returning the first one that
	/// answers `req_cmd` successfully.
	async fn resolve<T>(&self, req_cmd: u8, resp_cmd: u8, unpack: impl Fn(Bytes) -> Result<T, Error>) -> Result<T, Error> {
		let mut last_err = None;
		for &addr in &self.bootstrap {
			let mut conn = PeerConn::new(addr, self.connect_timeout, self.network_timeout);
			match conn.request(req_cmd, b"", resp_cmd, self.max_body_len).await {
				Ok(body) => match unpack(body) {
					Ok(v) => return Ok(v),
					Err(e) => last_err = Some(e),
				},
				Err(e) => {
					debug!("bootstrap server {} unreachable: {}", addr, e);
					last_err = Some(e);
				}
			}
		}
		Err(last_err.unwrap_or_else(|| Error::Network("router".into(), "no bootstrap server reachable".into())))
	}

	/// Returns a connection to the current master, resolving via
	/// `GET_MASTER_REQ` on first use or after [`invalidate_master`].
	pub async fn get_master_connection(&self) -> Result<PeerConn, Error> {
		if let Some(addr) = *self.master_addr.lock().unwrap() {
			return Ok(PeerConn::new(addr, self.connect_timeout, self.network_timeout));
		}
		let (_, addr) = self.resolve(cmd::GET_MASTER_REQ, cmd::GET_MASTER_RESP, unpack_server_ref_resp).await?;
		*self.master_addr.lock().unwrap() = Some(addr);
		Ok(PeerConn::new(addr, self.connect_timeout, self.network_timeout))
	}

	pub fn invalidate_master(&self) {
		*self.master_addr.lock().unwrap() = None;
	}

	/// Returns a connection to the next readable server in round-robin
	/// order across the known active slaves, falling back to the master if
	/// no slaves are reachable.
	pub async fn get_readable_connection(&self) -> Result<PeerConn, Error> {
		let mut candidates = self.readable_servers.lock().unwrap().clone();
		if candidates.is_empty() {
			let slaves = self.resolve(cmd::GET_SLAVES_REQ, cmd::GET_SLAVES_RESP, unpack_get_slaves_resp).await?;
			candidates = slaves.into_iter().map(|(_, addr)| addr).collect();
			if candidates.is_empty() {
				return self.get_master_connection().await;
			}
			*self.readable_servers.lock().unwrap() = candidates.clone();
		}
		let idx = self.slave_cursor.fetch_add(1, Ordering::SeqCst) % candidates.len();
		Ok(PeerConn::new(candidates[idx], self.connect_timeout, self.network_timeout))
	}

	pub fn invalidate_readable(&self) {
		self.readable_servers.lock().unwrap().clear();
	}
}
