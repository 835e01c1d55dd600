//! Ties membership, election, heartbeat, producer, replica consumer and
//! write thread into one running node: the direct analogue of
//! `garage_rpc::system::System`, minus the peering transport (this crate
//! defines its own wire protocol rather than reusing `netapp`).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use fdir_db::binlog_file::BinlogFile;
use fdir_db::record::{OpType, Record};
use fdir_db::{BufferPool, DentryStore, RecordBuffer};
use fdir_util::config::Config;
use fdir_util::error::{errno, Error};

use crate::cluster::ClusterView;
use crate::election::{self, NextMasterState};
use crate::heartbeat;
use crate::producer::{self, ProducerHandle, SlaveQueues};
use crate::proto::{self, cmd, STATUS_OK};
use crate::replica::{self, ReplicaConsumer};

/// All the long-lived state and task handles for one running node.
pub struct System<S: DentryStore> {
	pub config: Config,
	pub view: Arc<ClusterView>,
	pub next_master_state: Arc<NextMasterState>,
	pub store: Arc<S>,
	pub pool: Arc<BufferPool>,
	pub producer: ProducerHandle,
	pub slave_queues: Arc<SlaveQueues>,
	pub replica_consumer: ReplicaConsumer,
	pub continue_flag: Arc<AtomicBool>,
	pub started_at: u64,
	/// Next `data_version`/`inode` to assign on this node as master, also
	/// pulled forward by every successful `PING_MASTER` ack's
	/// `current_inode_sn` (spec.md §4.5) so a slave promoted to master after
	/// a failover does not restart numbering from its own stale counter.
	next_data_version: Arc<AtomicU64>,
}

impl<S: DentryStore + 'static> System<S> {
	/// Wires every component together and spawns the producer, replica
	/// replay worker, write thread and heartbeat loop. Returns the `System`
	/// handle; the caller still needs to call [`run_cluster_accept_loop`] to
	/// start serving inbound cluster connections.
	pub async fn start(config: Config, view: Arc<ClusterView>, store: Arc<S>, binlog: BinlogFile) -> Result<Arc<Self>, Error> {
		let pool = Arc::new(BufferPool::new(config.binlog_buffer_size, 64));
		let continue_flag = Arc::new(AtomicBool::new(true));
		let slave_queues = Arc::new(SlaveQueues::new());

		let (write_tx, write_rx) = mpsc::channel(64);
		tokio::spawn(crate::writer::run(write_rx, binlog, pool.clone(), continue_flag.clone()));

		let producer = producer::spawn(
			pool.clone(),
			write_tx,
			slave_queues.clone(),
			config.binlog_buffer_size / 64 + 1,
			Duration::from_millis(config.reload_interval_ms),
			continue_flag.clone(),
		);

		let (replica_consumer, _replay_handle) = replica::spawn(store.clone(), pool.clone(), 64, continue_flag.clone());
		let next_data_version = Arc::new(AtomicU64::new(store.applied_data_version()));
		view.myself().set_data_version(store.applied_data_version());

		let system = Arc::new(Self {
			config,
			view,
			next_master_state: Arc::new(NextMasterState::new()),
			store,
			pool,
			producer,
			slave_queues,
			replica_consumer,
			continue_flag,
			started_at: fdir_util::time::now_sec(),
			next_data_version,
		});

		let heartbeat_system = system.clone();
		tokio::spawn(async move {
			let replica_key = fdir_util::data::generate_replica_key(heartbeat_system.view.myself().server_id).0;
			heartbeat::run(
				heartbeat_system.view.clone(),
				heartbeat_system.next_master_state.clone(),
				heartbeat_system.next_data_version.clone(),
				heartbeat_system.config.cluster_id,
				replica_key,
				heartbeat_system.started_at,
				Duration::from_millis(heartbeat_system.config.connect_timeout_ms),
				Duration::from_millis(heartbeat_system.config.network_timeout_ms),
				heartbeat_system.config.dentry_max_data_size as u32 + 4096,
				heartbeat_system.continue_flag.clone(),
			)
			.await;
		});

		Ok(system)
	}

	/// Accepts inbound cluster connections on `config.cluster_bind_addr`
	/// until `continue_flag` clears, spawning one task per connection.
	pub async fn run_cluster_accept_loop(self: &Arc<Self>) -> Result<(), Error> {
		let listener = TcpListener::bind(self.config.cluster_bind_addr)
			.await
			.map_err(|e| Error::Message(format!("cannot bind cluster_bind_addr {}: {}", self.config.cluster_bind_addr, e)))?;
		info!("cluster listener bound to {}", self.config.cluster_bind_addr);

		while self.continue_flag.load(Ordering::SeqCst) {
			let (stream, peer_addr) = match tokio::time::timeout(Duration::from_millis(200), listener.accept()).await {
				Ok(Ok(v)) => v,
				Ok(Err(e)) => {
					warn!("accept failed on cluster listener: {}", e);
					continue;
				}
				Err(_) => continue,
			};
			let system = self.clone();
			tokio::spawn(async move {
				if let Err(e) = system.handle_cluster_connection(stream, peer_addr).await {
					debug!("cluster connection from {} ended: {}", peer_addr, e);
				}
			});
		}
		Ok(())
	}

	async fn handle_cluster_connection(self: Arc<Self>, mut stream: TcpStream, peer_addr: SocketAddr) -> Result<(), Error> {
		let network_timeout = Duration::from_millis(self.config.network_timeout_ms);
		let max_body_len = self.config.dentry_max_data_size as u32 + 4096;

		loop {
			if !self.continue_flag.load(Ordering::SeqCst) {
				return Ok(());
			}
			let header = match proto::read_header(&mut stream, network_timeout).await {
				Ok(h) => h,
				Err(_) => return Ok(()),
			};
			let body = proto::read_body(&mut stream, header.body_len, max_body_len, network_timeout).await?;

			let (resp_cmd, status, resp_body) = match self.dispatch(header.cmd, body, peer_addr).await {
				Ok((resp_cmd, body)) => (resp_cmd, STATUS_OK, body),
				Err(e) => (header.cmd, e.code() as u8, Bytes::from(e.to_string())),
			};
			proto::write_frame(&mut stream, resp_cmd, status, &resp_body, network_timeout).await?;
		}
	}

	async fn dispatch(self: &Arc<Self>, req_cmd: u8, body: Bytes, peer_addr: SocketAddr) -> Result<(u8, Bytes), Error> {
		match req_cmd {
			cmd::GET_SERVER_STATUS_REQ => {
				let myself = self.view.myself();
				let status = election::ServerStatus {
					server_id: myself.server_id,
					is_master: myself.is_master(),
					data_version: myself.data_version(),
					up_time: fdir_util::time::now_sec().saturating_sub(self.started_at),
				};
				Ok((cmd::GET_SERVER_STATUS_RESP, election::pack_get_server_status_resp(&status)))
			}
			cmd::JOIN_MASTER => self.handle_join_master(body, peer_addr),
			cmd::PING_MASTER_REQ => self.handle_ping_master(body),
			cmd::PRE_SET_NEXT_MASTER => {
				let candidate = unpack_candidate(body)?;
				self.next_master_state.pre_set(candidate)?;
				Ok((cmd::ACK, Bytes::new()))
			}
			cmd::COMMIT_NEXT_MASTER => {
				let candidate = unpack_candidate(body)?;
				self.next_master_state.commit(candidate)?;
				if candidate == self.view.myself().server_id {
					self.view.myself().set_is_master(true);
					self.view.set_master(self.view.myself().clone());
				}
				Ok((cmd::ACK, Bytes::new()))
			}
			cmd::PUSH_BINLOG_REQ => {
				let resp = replica::handle_push_binlog(&self.replica_consumer, body).await?;
				self.view.myself().set_data_version(self.store.applied_data_version());
				Ok((cmd::PUSH_BINLOG_RESP, resp))
			}
			other => Err(Error::Protocol(format!("unhandled cluster command {}", other))),
		}
	}

	fn handle_join_master(self: &Arc<Self>, body: Bytes, peer_addr: SocketAddr) -> Result<(u8, Bytes), Error> {
		let (cluster_id, server_id, _replica_key, config_sign) = heartbeat::unpack_join_master(body)?;
		if cluster_id != self.config.cluster_id {
			return Err(Error::application(errno::EINVAL, "cluster_id mismatch on JOIN_MASTER"));
		}
		if config_sign != self.view.config_sign() {
			return Err(Error::application(errno::EINVAL, "config_sign mismatch on JOIN_MASTER"));
		}
		let index = self
			.view
			.index_of(server_id)
			.ok_or_else(|| Error::application(errno::EINVAL, format!("unknown server_id {} in JOIN_MASTER", server_id)))?;
		let peer = self.view.get_peer_by_index(index).clone();
		self.view.move_to_active(index);

		let (tx, rx) = mpsc::channel::<RecordBuffer>(64);
		self.slave_queues.register(server_id, tx);
		let system = self.clone();
		tokio::spawn(async move { system.run_push_session(peer, rx).await });

		info!("server {} ({}) joined as active slave", server_id, peer_addr);
		Ok((cmd::ACK, Bytes::new()))
	}

	/// Drains buffers queued for one slave and pushes each over the wire via
	/// `PUSH_BINLOG_REQ`, releasing it back to the pool regardless of outcome
	/// (spec.md §4.7: "pushes ... to each active slave's push queue"). A
	/// send failure demotes the slave back to inactive so the heartbeat loop
	/// re-admits it on its next successful `JOIN_MASTER`.
	async fn run_push_session(self: Arc<Self>, peer: Arc<crate::cluster::Peer>, mut rx: mpsc::Receiver<RecordBuffer>) {
		let mut conn = crate::conn::PeerConn::new(
			peer.cluster_addr,
			Duration::from_millis(self.config.connect_timeout_ms),
			Duration::from_millis(self.config.network_timeout_ms),
		);
		while let Some(buffer) = rx.recv().await {
			let raw = buffer.raw_bytes();
			let resp = conn.request(cmd::PUSH_BINLOG_REQ, &raw, cmd::PUSH_BINLOG_RESP, self.config.dentry_max_data_size as u32 + 4096).await;
			let results = match resp.and_then(replica::unpack_push_binlog_resp) {
				Ok(results) => results,
				Err(e) => {
					warn!("push to slave {} failed, demoting to inactive: {}", peer.server_id, e);
					self.slave_queues.unregister(peer.server_id);
					if let Some(index) = self.view.index_of(peer.server_id) {
						self.view.move_to_inactive(index);
					}
					buffer.release_to_pool(&self.pool);
					return;
				}
			};
			buffer.release_to_pool(&self.pool);
			for (data_version, err_no) in &results {
				if *err_no != 0 {
					warn!("slave {} rejected record {} with errno {}", peer.server_id, data_version, err_no);
				}
			}
			if let Some((last_data_version, _)) = results.last() {
				peer.set_data_version(*last_data_version);
			}
		}
	}

	/// Applies a client-originated mutation locally and hands it to the
	/// producer for replication. Rejects with `EROFS` off the master
	/// (spec.md §4: "one master node accepts mutations"). The mutation's
	/// `data_version` also doubles as its `inode` for creates: both are
	/// simple monotonic ids assigned at commit time, so one counter serves
	/// both roles.
	///
	/// The record is replicated even when the local `apply` rejects it
	/// (e.g. `EEXIST`): every peer applies records in the same order
	/// against the same prior state, so the rejection is deterministic and
	/// replaying it keeps `data_version` contiguous across the cluster
	/// (mirrors `Tree::apply`'s own "counter tracks binlog position, not
	/// application outcome").
	pub async fn mutate(&self, op_type: OpType, ns: String, path: String, mode: u32, flags: u32) -> Result<(), Error> {
		if !self.view.myself().is_master() {
			return Err(Error::application(errno::EROFS, "this server is not the cluster master"));
		}
		let data_version = self.next_data_version.fetch_add(1, Ordering::SeqCst) + 1;
		let record = Record::new(op_type, data_version, data_version, ns, path, mode, flags, fdir_util::time::now_sec())?;
		let apply_result = self.store.apply(&record);
		self.view.myself().set_data_version(self.store.applied_data_version());
		self.producer.submit(record).await?;
		apply_result
	}

	fn handle_ping_master(&self, body: Bytes) -> Result<(u8, Bytes), Error> {
		let server_id = heartbeat::unpack_ping_master_req(body)?;
		if let Some(peer) = self.view.get_peer_by_id(server_id) {
			peer.set_data_version(self.store.applied_data_version());
		}
		let resp = heartbeat::pack_ping_master_resp(self.store.applied_data_version(), STATUS_OK);
		Ok((cmd::PING_MASTER_RESP, resp))
	}
}

fn unpack_candidate(mut body: Bytes) -> Result<u32, Error> {
	if body.len() < 4 {
		return Err(Error::Protocol("truncated master-change body".into()));
	}
	Ok(body.get_u32())
}

#[cfg(test)]
mod test {
	use super::*;
	use fdir_db::record::Record;
	use fdir_util::config::RosterEntry;
	use std::sync::atomic::AtomicU64;
	use std::time::Duration as StdDuration;

	struct NullStore {
		applied: AtomicU64,
	}

	impl DentryStore for NullStore {
		fn apply(&self, record: &Record) -> Result<(), Error> {
			self.applied.store(record.data_version, Ordering::SeqCst);
			Ok(())
		}
		fn applied_data_version(&self) -> u64 {
			self.applied.load(Ordering::SeqCst)
		}
	}

	fn config_for(cluster_addr: SocketAddr) -> Config {
		Config {
			cluster_id: 1,
			cluster_config_filename: "cluster.conf".into(),
			data_path: "/tmp/fdir".into(),
			cluster_bind_addr: cluster_addr,
			service_bind_addr: "127.0.0.1:0".parse().unwrap(),
			binlog_buffer_size: 4096,
			reload_interval_ms: 50,
			check_alive_interval_ms: 1000,
			namespace_hashtable_capacity: 1024,
			dentry_max_data_size: 256,
			connect_timeout_ms: 1000,
			network_timeout_ms: 1000,
		}
	}

	#[tokio::test]
	async fn responds_to_get_server_status() {
		let cluster_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
		let roster = vec![RosterEntry {
			server_id: 1,
			cluster_addr,
			service_addr: "127.0.0.1:0".parse().unwrap(),
		}];
		let config = config_for(cluster_addr);
		let view = Arc::new(ClusterView::new(&config, roster).unwrap());
		let store = Arc::new(NullStore { applied: AtomicU64::new(0) });
		let dir = mktemp::Temp::new_dir().unwrap();
		let binlog = BinlogFile::open(&dir, 1 << 20).await.unwrap();

		let system = System::start(config, view, store, binlog).await.unwrap();
		let (resp_cmd, body) = system.dispatch(cmd::GET_SERVER_STATUS_REQ, Bytes::new(), cluster_addr).await.unwrap();
		assert_eq!(resp_cmd, cmd::GET_SERVER_STATUS_RESP);
		let status = election::unpack_get_server_status_resp(body).unwrap();
		assert_eq!(status.server_id, 1);
		system.continue_flag.store(false, Ordering::SeqCst);
		let _ = StdDuration::from_millis(0);
	}
}
