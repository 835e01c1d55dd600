//! The high-level client API: create/remove route to the master, listing
//! routes to any readable server, and [`Client::list_all`] is the
//! supplemented convenience call that drives first/next to completion
//! (spec.md §3, mirroring the original's `fdir_client_list_dentry`).

use std::net::SocketAddr;
use std::time::Duration;

use fdir_rpc::proto::cmd;
use fdir_util::data::Token;
use fdir_util::error::Error;

use crate::list::{pack_create_dentry_req, pack_list_first_req, pack_list_next_req, pack_remove_dentry_req, unpack_list_resp, DentryEntry, ListPage};
use crate::router::Router;

pub struct ClientConfig {
	pub servers: Vec<SocketAddr>,
	pub connect_timeout: Duration,
	pub network_timeout: Duration,
	pub max_body_len: u32,
}

/// One FastDIR client: a router plus the wire calls built on top of it.
/// Cheap to clone-by-reference (`Arc` it at the call site) since the router
/// holds only cached addresses and an atomic cursor.
pub struct Client {
	router: Router,
	max_body_len: u32,
}

impl Client {
	pub fn new(config: ClientConfig) -> Self {
		Self {
			router: Router::new(config.servers, config.connect_timeout, config.network_timeout, config.max_body_len),
			max_body_len: config.max_body_len,
		}
	}

	pub async fn create(&self, ns: &str, path: &str, mode: u32, flags: u32) -> Result<(), Error> {
		let body = pack_create_dentry_req(ns, path, mode, flags);
		let mut conn = self.router.get_master_connection().await?;
		let result = conn.request(cmd::CREATE_DENTRY, &body, cmd::ACK, self.max_body_len).await;
		if let Err(e) = &result {
			if e.is_retryable() {
				self.router.invalidate_master();
			}
		}
		result.map(|_| ())
	}

	pub async fn remove(&self, ns: &str, path: &str) -> Result<(), Error> {
		let body = pack_remove_dentry_req(ns, path);
		let mut conn = self.router.get_master_connection().await?;
		let result = conn.request(cmd::REMOVE_DENTRY, &body, cmd::ACK, self.max_body_len).await;
		if let Err(e) = &result {
			if e.is_retryable() {
				self.router.invalidate_master();
			}
		}
		result.map(|_| ())
	}

	pub async fn list_first(&self, ns: &str, path: &str) -> Result<ListPage, Error> {
		let body = pack_list_first_req(ns, path);
		let mut conn = self.router.get_readable_connection().await?;
		let resp = conn.request(cmd::LIST_DENTRY_FIRST_REQ, &body, cmd::LIST_DENTRY_FIRST_RESP, self.max_body_len).await;
		match resp {
			Ok(b) => unpack_list_resp(b),
			Err(e) => {
				if e.is_retryable() {
					self.router.invalidate_readable();
				}
				Err(e)
			}
		}
	}

	/// `offset` is the client's accumulated entry count across this listing
	/// so far (spec.md §4.11).
	pub async fn list_next(&self, token: Token, offset: u32) -> Result<ListPage, Error> {
		let body = pack_list_next_req(token, offset);
		let mut conn = self.router.get_readable_connection().await?;
		let resp = conn.request(cmd::LIST_DENTRY_NEXT_REQ, &body, cmd::LIST_DENTRY_NEXT_RESP, self.max_body_len).await;
		match resp {
			Ok(b) => unpack_list_resp(b),
			Err(e) => {
				if e.is_retryable() {
					self.router.invalidate_readable();
				}
				Err(e)
			}
		}
	}

	/// Drives `list_first`/`list_next` to completion and returns every
	/// entry. A supplemented convenience call absent from the distilled
	/// module table but present in the system this was distilled from.
	pub async fn list_all(&self, ns: &str, path: &str) -> Result<Vec<DentryEntry>, Error> {
		let mut page = self.list_first(ns, path).await?;
		let mut all = std::mem::take(&mut page.entries);
		let mut is_last = page.is_last;
		let mut token = page.token;
		while !is_last {
			let next = self.list_next(token, all.len() as u32).await?;
			all.extend(next.entries);
			is_last = next.is_last;
			token = next.token;
		}
		Ok(all)
	}
}
