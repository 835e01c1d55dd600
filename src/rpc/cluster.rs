//! Cluster membership: the static peer roster and each peer's mutable
//! runtime attributes (spec.md §3, §4.3).
//!
//! Peers are held in an arena (`Vec<Arc<Peer>>`) indexed by roster position,
//! with non-owning index sets for the active/inactive slave groups (spec.md
//! §9: "Realise as arena+index ... to avoid pointer chasing").

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use arc_swap::ArcSwapOption;

use fdir_util::config::{config_sign, Config, RosterEntry};
use fdir_util::data::Token;
use fdir_util::error::{errno, Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerStatus {
	Offline = 0,
	Online = 1,
	Active = 2,
}

impl PeerStatus {
	fn from_u8(v: u8) -> Self {
		match v {
			1 => PeerStatus::Online,
			2 => PeerStatus::Active,
			_ => PeerStatus::Offline,
		}
	}
}

/// One roster member's identity plus its mutable, cluster-thread-owned
/// runtime attributes (spec.md §5: "Peer status/is_master: written only by
/// the cluster thread").
pub struct Peer {
	pub server_id: u32,
	pub cluster_addr: SocketAddr,
	pub service_addr: SocketAddr,

	status: AtomicU8,
	is_master: AtomicBool,
	data_version: AtomicU64,
	replica_key: Mutex<Option<Token>>,
}

impl Peer {
	fn new(entry: &RosterEntry) -> Self {
		Self {
			server_id: entry.server_id,
			cluster_addr: entry.cluster_addr,
			service_addr: entry.service_addr,
			status: AtomicU8::new(PeerStatus::Offline as u8),
			is_master: AtomicBool::new(false),
			data_version: AtomicU64::new(0),
			replica_key: Mutex::new(None),
		}
	}

	pub fn status(&self) -> PeerStatus {
		PeerStatus::from_u8(self.status.load(Ordering::SeqCst))
	}

	pub fn set_status(&self, status: PeerStatus) {
		self.status.store(status as u8, Ordering::SeqCst);
	}

	pub fn is_master(&self) -> bool {
		self.is_master.load(Ordering::SeqCst)
	}

	pub fn set_is_master(&self, v: bool) {
		self.is_master.store(v, Ordering::SeqCst);
	}

	pub fn data_version(&self) -> u64 {
		self.data_version.load(Ordering::SeqCst)
	}

	pub fn set_data_version(&self, v: u64) {
		self.data_version.store(v, Ordering::SeqCst);
	}

	pub fn replica_key(&self) -> Option<Token> {
		*self.replica_key.lock().unwrap()
	}

	pub fn set_replica_key(&self, key: Token) {
		*self.replica_key.lock().unwrap() = Some(key);
	}

	/// The ranking tuple spec.md §4.4 sorts candidates by:
	/// `(is_master, data_version, server_id)`, ascending; the maximum wins.
	pub fn rank(&self) -> (bool, u64, u32) {
		(self.is_master(), self.data_version(), self.server_id)
	}
}

/// The cluster-wide view held on every node: the immutable roster, a
/// pointer to `myself`, the currently-believed master, and the two
/// slave-group index sets the master maintains.
pub struct ClusterView {
	roster: Vec<Arc<Peer>>,
	myself: usize,
	master: ArcSwapOption<Peer>,
	active_slaves: RwLock<Vec<usize>>,
	inactive_slaves: RwLock<Vec<usize>>,
	config_sign: [u8; 16],
}

/// Every IP bound to a local interface, loopback included so a single-host
/// test cluster (every roster entry on `127.0.0.1`) still resolves.
fn local_ips() -> Vec<IpAddr> {
	pnet_datalink::interfaces().into_iter().flat_map(|iface| iface.ips).map(|net| net.ip()).collect()
}

/// Locates `myself` in the roster by matching a local interface IP against
/// each entry's `cluster_addr`/`service_addr`, the port required to equal
/// this node's own configured listen port for that address kind. Grounded on
/// `find_myself_in_cluster_config` in the original server implementation,
/// which walks `get_first_local_ip`/`get_next_local_ip` against the cluster
/// config's `inner_port`/`outer_port` candidates: an IP bound to more than
/// one roster entry is `EEXIST`, no match is `ENOENT`.
fn find_myself(roster: &[Arc<Peer>], local_ips: &[IpAddr], cluster_port: u16, service_port: u16) -> Result<usize, Error> {
	let mut found: Option<usize> = None;
	for (i, peer) in roster.iter().enumerate() {
		let cluster_match = peer.cluster_addr.port() == cluster_port && local_ips.contains(&peer.cluster_addr.ip());
		let service_match = peer.service_addr.port() == service_port && local_ips.contains(&peer.service_addr.ip());
		if !cluster_match && !service_match {
			continue;
		}
		match found {
			None => found = Some(i),
			Some(f) if f == i => {}
			Some(f) => {
				return Err(Error::application(
					errno::EEXIST,
					format!(
						"local ip and listen port match more than one roster entry (server {} and server {})",
						roster[f].server_id, peer.server_id
					),
				));
			}
		}
	}
	found.ok_or_else(|| Error::application(errno::ENOENT, "no roster entry matches this node's local ip and listen port"))
}

impl ClusterView {
	/// Builds the roster from config: locates `myself` by matching the
	/// node's own local IP and listen ports against the roster, and starts
	/// every other peer in `inactive_slaves` (spec.md §3, §4.3).
	pub fn new(config: &Config, roster_entries: Vec<RosterEntry>) -> Result<Self, Error> {
		let sign = config_sign(&roster_entries);
		let roster: Vec<Arc<Peer>> = roster_entries.iter().map(Peer::new).map(Arc::new).collect();

		let myself = find_myself(&roster, &local_ips(), config.cluster_bind_addr.port(), config.service_bind_addr.port())?;

		let inactive_slaves = (0..roster.len()).filter(|&i| i != myself).collect();

		Ok(Self {
			roster,
			myself,
			master: ArcSwapOption::from(None),
			active_slaves: RwLock::new(Vec::new()),
			inactive_slaves: RwLock::new(inactive_slaves),
			config_sign: sign,
		})
	}

	pub fn config_sign(&self) -> [u8; 16] {
		self.config_sign
	}

	pub fn myself(&self) -> &Arc<Peer> {
		&self.roster[self.myself]
	}

	pub fn myself_index(&self) -> usize {
		self.myself
	}

	pub fn len(&self) -> usize {
		self.roster.len()
	}

	pub fn get_peer_by_id(&self, server_id: u32) -> Option<&Arc<Peer>> {
		self.roster.iter().find(|p| p.server_id == server_id)
	}

	pub fn get_peer_by_index(&self, index: usize) -> &Arc<Peer> {
		&self.roster[index]
	}

	pub fn index_of(&self, server_id: u32) -> Option<usize> {
		self.roster.iter().position(|p| p.server_id == server_id)
	}

	pub fn iterate_peers(&self) -> impl Iterator<Item = &Arc<Peer>> {
		self.roster.iter()
	}

	pub fn master(&self) -> Option<Arc<Peer>> {
		self.master.load_full()
	}

	pub fn set_master(&self, peer: Arc<Peer>) {
		info!("cluster master set to server {}", peer.server_id);
		self.master.store(Some(peer));
	}

	pub fn clear_master(&self) {
		self.master.store(None);
	}

	/// Moves a peer from `inactive_slaves` to `active_slaves`, idempotent if
	/// already active (spec.md §4.5: master moves a peer to active slaves on
	/// successful `JOIN_MASTER`).
	pub fn move_to_active(&self, index: usize) {
		let mut inactive = self.inactive_slaves.write().unwrap();
		inactive.retain(|&i| i != index);
		let mut active = self.active_slaves.write().unwrap();
		if !active.contains(&index) {
			active.push(index);
		}
	}

	pub fn move_to_inactive(&self, index: usize) {
		let mut active = self.active_slaves.write().unwrap();
		active.retain(|&i| i != index);
		let mut inactive = self.inactive_slaves.write().unwrap();
		if !inactive.contains(&index) {
			inactive.push(index);
		}
	}

	pub fn active_slaves(&self) -> Vec<usize> {
		self.active_slaves.read().unwrap().clone()
	}

	pub fn inactive_slaves(&self) -> Vec<usize> {
		self.inactive_slaves.read().unwrap().clone()
	}

	pub fn active_slave_count(&self) -> usize {
		self.active_slaves.read().unwrap().len()
	}
}
