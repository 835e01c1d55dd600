//! Master election (spec.md §4.4), grounded on
//! `cluster_relationship.c`'s `cluster_select_master`/`cluster_notify_master_changed`:
//! fan out `GetServerStatus`, retry with backoff until enough peers are
//! responsive, rank candidates, and two-phase commit the winner.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use fdir_util::error::{errno, Error};

use crate::cluster::ClusterView;
use crate::conn::PeerConn;
use crate::proto::cmd;

const BACKOFF_SECS: [u64; 5] = [2, 4, 8, 16, 32];

/// One peer's answer to `GetServerStatus`, or a synthesised local answer for
/// `myself`. `up_time` is a supplemented field (not in the distilled module
/// table) carried for the CLI's status display, the seconds elapsed since
/// that peer's process started.
#[derive(Debug, Clone, Copy)]
pub struct ServerStatus {
	pub server_id: u32,
	pub is_master: bool,
	pub data_version: u64,
	pub up_time: u64,
}

pub fn pack_get_server_status_resp(status: &ServerStatus) -> Bytes {
	let mut out = BytesMut::with_capacity(21);
	out.put_u32(status.server_id);
	out.put_u8(status.is_master as u8);
	out.put_u64(status.data_version);
	out.put_u64(status.up_time);
	out.freeze()
}

pub fn unpack_get_server_status_resp(mut body: Bytes) -> Result<ServerStatus, Error> {
	if body.len() < 21 {
		return Err(Error::Protocol("truncated GetServerStatus response".into()));
	}
	Ok(ServerStatus {
		server_id: body.get_u32(),
		is_master: body.get_u8() != 0,
		data_version: body.get_u64(),
		up_time: body.get_u64(),
	})
}

/// Fans out `GET_SERVER_STATUS_REQ` to every peer, synthesising the local
/// answer for `myself` (spec.md §4.4 step 1). Connection failures are
/// tolerated: only responsive peers are returned.
async fn poll_server_statuses(
	view: &ClusterView,
	started_at: u64,
	connect_timeout: Duration,
	network_timeout: Duration,
	max_body_len: u32,
) -> Vec<ServerStatus> {
	let myself = view.myself();
	let mut statuses = vec![ServerStatus {
		server_id: myself.server_id,
		is_master: myself.is_master(),
		data_version: myself.data_version(),
		up_time: fdir_util::time::now_sec().saturating_sub(started_at),
	}];

	for peer in view.iterate_peers() {
		if peer.server_id == myself.server_id {
			continue;
		}
		let mut conn = PeerConn::new(peer.cluster_addr, connect_timeout, network_timeout);
		match conn.request(cmd::GET_SERVER_STATUS_REQ, b"", cmd::GET_SERVER_STATUS_RESP, max_body_len).await {
			Ok(body) => match unpack_get_server_status_resp(body) {
				Ok(status) => statuses.push(status),
				Err(e) => warn!("malformed GetServerStatus from server {}: {}", peer.server_id, e),
			},
			Err(e) => debug!("server {} unresponsive during election: {}", peer.server_id, e),
		}
	}
	statuses
}

/// Runs the election algorithm to completion: retries up to 5 rounds with
/// exponential backoff until all peers answer or at least two are active
/// and one reports itself master, then picks the ranking maximum.
pub async fn elect(
	view: &ClusterView,
	started_at: u64,
	connect_timeout: Duration,
	network_timeout: Duration,
	max_body_len: u32,
) -> Result<ServerStatus, Error> {
	let total = view.len();
	let mut statuses = Vec::new();
	for (round, backoff) in BACKOFF_SECS.iter().enumerate() {
		statuses = poll_server_statuses(view, started_at, connect_timeout, network_timeout, max_body_len).await;
		let active_count = statuses.len();
		let some_master = statuses.iter().any(|s| s.is_master);
		if active_count == total || (active_count >= 2 && some_master) {
			break;
		}
		if round + 1 == BACKOFF_SECS.len() {
			break;
		}
		info!(
			"election round {}: {}/{} peers active, retrying in {}s",
			round + 1,
			active_count,
			total,
			backoff
		);
		tokio::time::sleep(Duration::from_secs(*backoff)).await;
	}

	statuses
		.into_iter()
		.max_by_key(|s| (s.is_master, s.data_version, s.server_id))
		.ok_or_else(|| Error::Network("cluster".into(), "no peer responded during election".into()))
}

/// Phase 1: tell every peer (including self) who the candidate is. Requires
/// at least one non-connection-failure success; any explicit rejection
/// aborts (spec.md §4.4 "Two-phase master commit").
pub async fn pre_set_next_master(
	view: &ClusterView,
	local_state: &NextMasterState,
	candidate_server_id: u32,
	connect_timeout: Duration,
	network_timeout: Duration,
) -> Result<(), Error> {
	broadcast_master_change(
		view,
		local_state,
		cmd::PRE_SET_NEXT_MASTER,
		candidate_server_id,
		connect_timeout,
		network_timeout,
	)
	.await
}

/// Phase 2: commit the candidate cluster-wide.
pub async fn commit_next_master(
	view: &ClusterView,
	local_state: &NextMasterState,
	candidate_server_id: u32,
	connect_timeout: Duration,
	network_timeout: Duration,
) -> Result<(), Error> {
	broadcast_master_change(
		view,
		local_state,
		cmd::COMMIT_NEXT_MASTER,
		candidate_server_id,
		connect_timeout,
		network_timeout,
	)
	.await
}

async fn broadcast_master_change(
	view: &ClusterView,
	local_state: &NextMasterState,
	phase_cmd: u8,
	candidate_server_id: u32,
	connect_timeout: Duration,
	network_timeout: Duration,
) -> Result<(), Error> {
	let mut body = BytesMut::with_capacity(4);
	body.put_u32(candidate_server_id);
	let body = body.freeze();

	let mut success = 0usize;
	for peer in view.iterate_peers() {
		let result = if peer.server_id == view.myself().server_id {
			// Self is short-circuited: drive the local state machine
			// directly instead of looping a request back through the wire
			// (spec.md §4.4: "to every peer (including self, short-circuited)").
			if phase_cmd == cmd::PRE_SET_NEXT_MASTER {
				local_state.pre_set(candidate_server_id)
			} else {
				local_state.commit(candidate_server_id)
			}
		} else {
			let mut conn = PeerConn::new(peer.cluster_addr, connect_timeout, network_timeout);
			match conn.request(phase_cmd, &body, cmd::ACK, 64).await {
				Ok(_) => Ok(()),
				Err(Error::Network(_, _)) => {
					debug!("server {} unreachable during master-change broadcast, skipping", peer.server_id);
					continue;
				}
				Err(e) => Err(e),
			}
		};
		match result {
			Ok(()) => success += 1,
			Err(e) => return Err(e),
		}
	}

	if success == 0 {
		return Err(Error::application(errno::EAGAIN, "no peer accepted the master-change broadcast"));
	}
	Ok(())
}

/// Server-side state for the two-phase commit, held by the cluster task and
/// driven by inbound `PRE_SET_NEXT_MASTER`/`COMMIT_NEXT_MASTER` requests
/// (including the self-addressed ones above).
#[derive(Default)]
pub struct NextMasterState {
	next_master: std::sync::Mutex<Option<u32>>,
}

impl NextMasterState {
	pub fn new() -> Self {
		Self::default()
	}

	/// Handles `PRE_SET_NEXT_MASTER`: accept iff unset or equal to the
	/// candidate; otherwise reject with `EEXIST` and clear (spec.md §4.4
	/// phase 1).
	pub fn pre_set(&self, candidate_server_id: u32) -> Result<(), Error> {
		let mut guard = self.next_master.lock().unwrap();
		match *guard {
			None => {
				*guard = Some(candidate_server_id);
				Ok(())
			}
			Some(existing) if existing == candidate_server_id => Ok(()),
			Some(_) => {
				*guard = None;
				Err(Error::application(errno::EEXIST, "a different master-election round is already in progress"))
			}
		}
	}

	/// Handles `COMMIT_NEXT_MASTER`: requires `next_master == candidate`;
	/// mismatch is `EBUSY` and fatal to the rejecting peer (spec.md §4.4
	/// phase 2; the asymmetric failure model of §9 is preserved verbatim).
	pub fn commit(&self, candidate_server_id: u32) -> Result<(), Error> {
		let mut guard = self.next_master.lock().unwrap();
		let result = match *guard {
			Some(existing) if existing == candidate_server_id => Ok(()),
			_ => Err(Error::application(errno::EBUSY, "next_master mismatch at commit")),
		};
		*guard = None;
		result
	}

	pub fn current(&self) -> Option<u32> {
		*self.next_master.lock().unwrap()
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn pre_set_rejects_concurrent_candidate() {
		let state = NextMasterState::new();
		state.pre_set(1).unwrap();
		state.pre_set(1).unwrap();
		let err = state.pre_set(2).unwrap_err();
		assert_eq!(err.code(), errno::EEXIST);
		assert!(state.current().is_none());
	}

	#[test]
	fn commit_requires_matching_next_master() {
		let state = NextMasterState::new();
		state.pre_set(1).unwrap();
		let err = state.commit(2).unwrap_err();
		assert_eq!(err.code(), errno::EBUSY);

		let state = NextMasterState::new();
		state.pre_set(1).unwrap();
		state.commit(1).unwrap();
		assert!(state.current().is_none());
	}

	#[test]
	fn commit_without_pre_set_is_busy() {
		let state = NextMasterState::new();
		assert_eq!(state.commit(1).unwrap_err().code(), errno::EBUSY);
	}
}
