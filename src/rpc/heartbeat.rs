//! Slave-side heartbeat loop (spec.md §4.5), grounded on
//! `cluster_relationship.c`'s `cluster_thread_entrance`: if there's no known
//! master, run an election round; otherwise join (on first connect) and
//! ping the master, clearing it after 4 consecutive failures.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use fdir_util::error::Error;

use crate::cluster::ClusterView;
use crate::conn::PeerConn;
use crate::election::{self, NextMasterState};
use crate::proto::cmd;

/// Tracks consecutive ping failures and the sleep interval, isolated from
/// I/O so the threshold/backoff behaviour (spec.md §8: "Ping failures
/// strictly less than 4 do NOT clear master; the 4th does") is directly
/// testable.
pub struct HeartbeatBackoff {
	fail_count: u32,
	sleep_ms: u64,
}

const FAIL_THRESHOLD: u32 = 4;
const MAX_SLEEP_MS: u64 = 16_000;
const INITIAL_SLEEP_MS: u64 = 1_000;

impl HeartbeatBackoff {
	pub fn new() -> Self {
		Self {
			fail_count: 0,
			sleep_ms: INITIAL_SLEEP_MS,
		}
	}

	/// Resets on success; interval drops back to 1s.
	pub fn on_success(&mut self) {
		self.fail_count = 0;
		self.sleep_ms = INITIAL_SLEEP_MS;
	}

	/// Records a failure; interval doubles (capped). Returns whether the
	/// local master pointer should now be cleared.
	pub fn on_failure(&mut self) -> bool {
		self.fail_count += 1;
		self.sleep_ms = (self.sleep_ms * 2).min(MAX_SLEEP_MS);
		self.fail_count >= FAIL_THRESHOLD
	}

	pub fn fail_count(&self) -> u32 {
		self.fail_count
	}

	pub fn sleep_duration(&self) -> Duration {
		Duration::from_millis(self.sleep_ms)
	}
}

impl Default for HeartbeatBackoff {
	fn default() -> Self {
		Self::new()
	}
}

fn pack_join_master(cluster_id: u32, server_id: u32, replica_key: &[u8; 16], config_sign: &[u8; 16]) -> Bytes {
	let mut out = BytesMut::with_capacity(40);
	out.put_u32(cluster_id);
	out.put_u32(server_id);
	out.put_slice(replica_key);
	out.put_slice(config_sign);
	out.freeze()
}

pub fn unpack_join_master(mut body: Bytes) -> Result<(u32, u32, [u8; 16], [u8; 16]), Error> {
	if body.len() < 40 {
		return Err(Error::Protocol("truncated JOIN_MASTER".into()));
	}
	let cluster_id = body.get_u32();
	let server_id = body.get_u32();
	let mut replica_key = [0u8; 16];
	body.copy_to_slice(&mut replica_key);
	let mut config_sign = [0u8; 16];
	body.copy_to_slice(&mut config_sign);
	Ok((cluster_id, server_id, replica_key, config_sign))
}

fn pack_ping_master(server_id: u32) -> Bytes {
	let mut out = BytesMut::with_capacity(4);
	out.put_u32(server_id);
	out.freeze()
}

pub fn unpack_ping_master_req(mut body: Bytes) -> Result<u32, Error> {
	if body.len() < 4 {
		return Err(Error::Protocol("truncated PING_MASTER_REQ".into()));
	}
	Ok(body.get_u32())
}

pub fn pack_ping_master_resp(current_inode_sn: u64, status: u8) -> Bytes {
	let mut out = BytesMut::with_capacity(9);
	out.put_u64(current_inode_sn);
	out.put_u8(status);
	out.freeze()
}

fn unpack_ping_master_resp(mut body: Bytes) -> Result<(u64, u8), Error> {
	if body.len() < 9 {
		return Err(Error::Protocol("truncated PING_MASTER_RESP".into()));
	}
	Ok((body.get_u64(), body.get_u8()))
}

/// Runs the heartbeat loop until `continue_flag` clears (spec.md §5:
/// "process-wide `continue_flag` polled at every loop head").
pub async fn run(
	view: Arc<ClusterView>,
	next_master_state: Arc<NextMasterState>,
	next_data_version: Arc<AtomicU64>,
	cluster_id: u32,
	replica_key: [u8; 16],
	started_at: u64,
	connect_timeout: Duration,
	network_timeout: Duration,
	max_body_len: u32,
	continue_flag: Arc<AtomicBool>,
) {
	let mut backoff = HeartbeatBackoff::new();
	let mut master_conn: Option<PeerConn> = None;
	let mut joined = false;

	while continue_flag.load(Ordering::SeqCst) {
		if view.myself().is_master() {
			tokio::time::sleep(Duration::from_millis(INITIAL_SLEEP_MS)).await;
			continue;
		}

		if view.master().is_none() {
			match election::elect(&view, started_at, connect_timeout, network_timeout, max_body_len).await {
				Ok(status) if status.server_id == view.myself().server_id => {
					if let Err(e) = run_commit_as_candidate(&view, &next_master_state, connect_timeout, network_timeout).await {
						warn!("election commit failed: {}", e);
					}
				}
				Ok(status) if status.is_master => {
					if let Some(peer) = view.get_peer_by_id(status.server_id) {
						view.set_master(peer.clone());
					}
				}
				Ok(_) => debug!("waiting for candidate master to notify"),
				Err(e) => warn!("election round failed: {}", e),
			}
			tokio::time::sleep(Duration::from_secs(1)).await;
			continue;
		}

		let master = view.master().unwrap();
		if master_conn.is_none() {
			master_conn = Some(PeerConn::new(master.cluster_addr, connect_timeout, network_timeout));
			joined = false;
		}
		let conn = master_conn.as_mut().unwrap();

		if !joined {
			let body = pack_join_master(cluster_id, view.myself().server_id, &replica_key, &view.config_sign());
			match conn.request(cmd::JOIN_MASTER, &body, cmd::ACK, 64).await {
				Ok(_) => joined = true,
				Err(e) => {
					warn!("JOIN_MASTER to server {} failed: {}", master.server_id, e);
					if backoff.on_failure() {
						view.clear_master();
						master_conn = None;
					}
					tokio::time::sleep(backoff.sleep_duration()).await;
					continue;
				}
			}
		}

		let body = pack_ping_master(view.myself().server_id);
		match conn.request(cmd::PING_MASTER_REQ, &body, cmd::PING_MASTER_RESP, 64).await {
			Ok(resp) => match unpack_ping_master_resp(resp) {
				Ok((current_inode_sn, _status)) => {
					next_data_version.fetch_max(current_inode_sn, Ordering::SeqCst);
					backoff.on_success();
				}
				Err(e) => warn!("malformed PING_MASTER_RESP: {}", e),
			},
			Err(e) => {
				warn!("PING_MASTER to server {} failed ({}): {}", master.server_id, backoff.fail_count() + 1, e);
				if backoff.on_failure() {
					info!("master server {} presumed dead after {} failures, clearing", master.server_id, FAIL_THRESHOLD);
					view.clear_master();
					master_conn = None;
					joined = false;
				}
			}
		}
		tokio::time::sleep(backoff.sleep_duration()).await;
	}
}

async fn run_commit_as_candidate(
	view: &ClusterView,
	next_master_state: &NextMasterState,
	connect_timeout: Duration,
	network_timeout: Duration,
) -> Result<(), Error> {
	let my_id = view.myself().server_id;
	election::pre_set_next_master(view, next_master_state, my_id, connect_timeout, network_timeout).await?;
	election::commit_next_master(view, next_master_state, my_id, connect_timeout, network_timeout).await?;
	view.myself().set_is_master(true);
	view.set_master(view.myself().clone());
	info!("became master (server {})", my_id);
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn fewer_than_threshold_failures_do_not_signal_clear() {
		let mut b = HeartbeatBackoff::new();
		assert!(!b.on_failure());
		assert!(!b.on_failure());
		assert!(!b.on_failure());
		assert!(b.on_failure());
	}

	#[test]
	fn success_resets_backoff() {
		let mut b = HeartbeatBackoff::new();
		b.on_failure();
		b.on_failure();
		b.on_success();
		assert_eq!(b.fail_count(), 0);
		assert_eq!(b.sleep_duration(), Duration::from_millis(INITIAL_SLEEP_MS));
	}

	#[test]
	fn backoff_doubles_and_caps() {
		let mut b = HeartbeatBackoff::new();
		assert_eq!(b.sleep_duration(), Duration::from_millis(1000));
		b.on_failure();
		assert_eq!(b.sleep_duration(), Duration::from_millis(2000));
		b.on_failure();
		assert_eq!(b.sleep_duration(), Duration::from_millis(4000));
		b.on_failure();
		assert_eq!(b.sleep_duration(), Duration::from_millis(8000));
		b.on_failure();
		assert_eq!(b.sleep_duration(), Duration::from_millis(16000));
		b.on_failure();
		assert_eq!(b.sleep_duration(), Duration::from_millis(16000));
	}

	#[test]
	fn join_master_round_trips() {
		let body = pack_join_master(1, 2, &[3u8; 16], &[4u8; 16]);
		let (cluster_id, server_id, replica_key, config_sign) = unpack_join_master(body).unwrap();
		assert_eq!(cluster_id, 1);
		assert_eq!(server_id, 2);
		assert_eq!(replica_key, [3u8; 16]);
		assert_eq!(config_sign, [4u8; 16]);
	}

	#[test]
	fn ping_master_resp_round_trips() {
		let body = pack_ping_master_resp(42, 2);
		let (inode_sn, status) = unpack_ping_master_resp(body).unwrap();
		assert_eq!(inode_sn, 42);
		assert_eq!(status, 2);
	}
}
