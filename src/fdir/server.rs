//! Wires a dentry tree and the cluster engine into one running node, and
//! serves client (service) traffic alongside the inter-peer cluster
//! listener spawned by `fdir_rpc::System`.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::{TcpListener, TcpStream};

use fdir_client::list::{
	pack_list_resp, unpack_create_dentry_req, unpack_list_first_req, unpack_list_next_req, unpack_remove_dentry_req, DentryEntry,
};
use fdir_client::router::{pack_get_slaves_resp, pack_server_ref_resp};
use fdir_db::binlog_file::{self, BinlogFile};
use fdir_db::record::OpType;
use fdir_db::DentryStore;
use fdir_model::{DentryInfo, ListingManager, Tree};
use fdir_rpc::cluster::ClusterView;
use fdir_rpc::proto::{self, cmd, STATUS_OK};
use fdir_rpc::system::System;
use fdir_util::config::{read_config, read_roster};
use fdir_util::error::Error;

/// Listing pages hold at most this many entries before a resume token is
/// handed out (spec.md §4.11's "Paged list" acceptance scenario uses a
/// similarly small page against a 300-entry directory).
const LIST_PAGE_SIZE: usize = 100;
const BINLOG_ROTATE_SIZE: u64 = 64 * 1024 * 1024;

/// Loads configuration, replays the local binlog into a fresh [`Tree`],
/// starts the cluster engine and spawns both the cluster and service accept
/// loops as background tasks, returning the running node. Used directly by
/// integration tests that need several nodes alive in one process; `run_server`
/// below is the blocking entry point used by `main`.
pub async fn start_node(config_path: impl AsRef<std::path::Path>) -> Result<Arc<System<Tree>>, Error> {
	let config = read_config(&config_path)?;
	let roster = read_roster(&config.cluster_config_filename)?;
	let view = Arc::new(ClusterView::new(&config, roster)?);

	let store = Arc::new(Tree::new());
	let binlog_dir = config.data_path.join("binlog");
	let (records, replayed_version) = binlog_file::replay(&binlog_dir).await?;
	for record in &records {
		let _ = store.apply(record);
	}
	if records.is_empty() {
		store.set_applied_data_version(replayed_version);
	}
	info!("replayed {} binlog record(s), applied_data_version={}", records.len(), store.applied_data_version());

	let binlog = BinlogFile::open(&binlog_dir, BINLOG_ROTATE_SIZE).await?;
	let listing = Arc::new(ListingManager::new(LIST_PAGE_SIZE));

	let system = System::start(config.clone(), view, store, binlog).await?;

	let cluster_system = system.clone();
	tokio::spawn(async move { cluster_system.run_cluster_accept_loop().await });

	let service_system = system.clone();
	let bind_addr = config.service_bind_addr;
	tokio::spawn(async move { run_service_accept_loop(service_system, listing, bind_addr).await });

	Ok(system)
}

/// Starts a node and blocks until the process receives a shutdown signal.
pub async fn run_server(config_path: impl AsRef<std::path::Path>) -> Result<(), Error> {
	let system = start_node(config_path).await?;
	tokio::signal::ctrl_c().await.map_err(|e| Error::Message(format!("failed to listen for ctrl-c: {}", e)))?;
	info!("shutdown signal received, stopping");
	system.continue_flag.store(false, Ordering::SeqCst);
	Ok(())
}

async fn run_service_accept_loop(
	system: Arc<System<Tree>>,
	listing: Arc<ListingManager>,
	bind_addr: SocketAddr,
) -> Result<(), Error> {
	let listener = TcpListener::bind(bind_addr)
		.await
		.map_err(|e| Error::Message(format!("cannot bind service_bind_addr {}: {}", bind_addr, e)))?;
	info!("service listener bound to {}", bind_addr);

	while system.continue_flag.load(Ordering::SeqCst) {
		let (stream, peer_addr) = match tokio::time::timeout(Duration::from_millis(200), listener.accept()).await {
			Ok(Ok(v)) => v,
			Ok(Err(e)) => {
				warn!("accept failed on service listener: {}", e);
				continue;
			}
			Err(_) => continue,
		};
		let system = system.clone();
		let listing = listing.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_service_connection(system, listing, stream, peer_addr).await {
				debug!("service connection from {} ended: {}", peer_addr, e);
			}
		});
	}
	Ok(())
}

async fn handle_service_connection(
	system: Arc<System<Tree>>,
	listing: Arc<ListingManager>,
	mut stream: TcpStream,
	_peer_addr: SocketAddr,
) -> Result<(), Error> {
	let network_timeout = Duration::from_millis(system.config.network_timeout_ms);
	let max_body_len = system.config.dentry_max_data_size as u32 + 4096;

	loop {
		if !system.continue_flag.load(Ordering::SeqCst) {
			return Ok(());
		}
		let header = match proto::read_header(&mut stream, network_timeout).await {
			Ok(h) => h,
			Err(_) => return Ok(()),
		};
		let body = proto::read_body(&mut stream, header.body_len, max_body_len, network_timeout).await?;

		let (resp_cmd, status, resp_body) = match dispatch_service(&system, &listing, header.cmd, body).await {
			Ok((resp_cmd, body)) => (resp_cmd, STATUS_OK, body),
			Err(e) => (header.cmd, e.code() as u8, Bytes::from(e.to_string())),
		};
		proto::write_frame(&mut stream, resp_cmd, status, &resp_body, network_timeout).await?;
	}
}

async fn dispatch_service(
	system: &Arc<System<Tree>>,
	listing: &Arc<ListingManager>,
	req_cmd: u8,
	body: Bytes,
) -> Result<(u8, Bytes), Error> {
	match req_cmd {
		cmd::CREATE_DENTRY => {
			let req = unpack_create_dentry_req(body)?;
			system.mutate(OpType::Create, req.ns, req.path, req.mode, req.flags).await?;
			Ok((cmd::ACK, Bytes::new()))
		}
		cmd::REMOVE_DENTRY => {
			let req = unpack_remove_dentry_req(body)?;
			system.mutate(OpType::Remove, req.ns, req.path, 0, 0).await?;
			Ok((cmd::ACK, Bytes::new()))
		}
		cmd::LIST_DENTRY_FIRST_REQ => {
			let (ns, path) = unpack_list_first_req(body)?;
			let entries = system.store.list(&ns, &path)?;
			let page = listing.first(entries).await;
			let entries = to_client_entries(page.entries);
			Ok((cmd::LIST_DENTRY_FIRST_RESP, pack_list_resp(&entries, page.is_last, page.token)))
		}
		cmd::LIST_DENTRY_NEXT_REQ => {
			let (token, offset) = unpack_list_next_req(body)?;
			let page = listing.next(token, offset).await?;
			let entries = to_client_entries(page.entries);
			Ok((cmd::LIST_DENTRY_NEXT_RESP, pack_list_resp(&entries, page.is_last, page.token)))
		}
		cmd::GET_MASTER_REQ => {
			let master = system.view.master().ok_or_else(|| Error::Network("cluster".into(), "no known master".into()))?;
			Ok((cmd::GET_MASTER_RESP, pack_server_ref_resp(master.server_id, master.service_addr)))
		}
		cmd::GET_SLAVES_REQ => {
			let slaves: Vec<(u32, SocketAddr)> = system
				.view
				.active_slaves()
				.into_iter()
				.map(|i| {
					let peer = system.view.get_peer_by_index(i);
					(peer.server_id, peer.service_addr)
				})
				.collect();
			Ok((cmd::GET_SLAVES_RESP, pack_get_slaves_resp(&slaves)))
		}
		cmd::GET_READABLE_SERVER_REQ => {
			let myself = system.view.myself();
			Ok((cmd::GET_READABLE_SERVER_RESP, pack_server_ref_resp(myself.server_id, myself.service_addr)))
		}
		cmd::SERVICE_STAT_REQ => Ok((cmd::SERVICE_STAT_RESP, pack_service_stat(system))),
		cmd::CLUSTER_STAT_REQ => Ok((cmd::CLUSTER_STAT_RESP, pack_cluster_stat(system))),
		other => Err(Error::Protocol(format!("unhandled service command {}", other))),
	}
}

fn to_client_entries(entries: Vec<DentryInfo>) -> Vec<DentryEntry> {
	entries
		.into_iter()
		.map(|e| DentryEntry {
			name: e.name,
			inode: e.attrs.inode,
			mode: e.attrs.mode,
			flags: e.attrs.flags,
			timestamp: e.attrs.timestamp,
		})
		.collect()
}

/// `{u8 is_master, u64 applied_data_version, u64 up_time}`.
fn pack_service_stat(system: &Arc<System<Tree>>) -> Bytes {
	let mut out = BytesMut::with_capacity(17);
	out.put_u8(system.view.myself().is_master() as u8);
	out.put_u64(system.store.applied_data_version());
	out.put_u64(fdir_util::time::now_sec().saturating_sub(system.started_at));
	out.freeze()
}

/// `{u16_be total, u16_be active_slaves}`.
fn pack_cluster_stat(system: &Arc<System<Tree>>) -> Bytes {
	let mut out = BytesMut::with_capacity(4);
	out.put_u16(system.view.len() as u16);
	out.put_u16(system.view.active_slave_count() as u16);
	out.freeze()
}
