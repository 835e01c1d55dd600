//! Multi-node integration tests: spin up a few in-process nodes on loopback
//! ports, wire them into a roster, and drive them through the client API.

use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fdir::server;
use fdir_client::client::{Client, ClientConfig};
use fdir_db::DentryStore;
use fdir_model::Tree;
use fdir_rpc::system::System;

struct NodeAddrs {
	server_id: u32,
    cluster_addr: SocketAddr,
    service_addr: SocketAddr,
}

fn write_roster(dir: &Path, nodes: &[NodeAddrs]) -> std::path::PathBuf {
	let path = dir.join("cluster.conf");
	let mut f = std::fs::File::create(&path).unwrap();
	for n in nodes {
		writeln!(f, "[server {}]", n.server_id).unwrap();
		writeln!(f, "cluster_addr = {}", n.cluster_addr).unwrap();
		writeln!(f, "service_addr = {}", n.service_addr).unwrap();
	}
	path
}

fn write_config(dir: &Path, server_id: u32, node: &NodeAddrs, roster_path: &Path) -> std::path::PathBuf {
	let data_path = dir.join(format!("node{}", server_id));
	std::fs::create_dir_all(&data_path).unwrap();
	let path = dir.join(format!("fdir{}.conf", server_id));
	let mut f = std::fs::File::create(&path).unwrap();
	writeln!(f, "cluster_id = 1").unwrap();
	writeln!(f, "cluster_config_filename = {}", roster_path.display()).unwrap();
	writeln!(f, "data_path = {}", data_path.display()).unwrap();
	writeln!(f, "cluster_bind_addr = {}", node.cluster_addr).unwrap();
	writeln!(f, "service_bind_addr = {}", node.service_addr).unwrap();
	writeln!(f, "binlog_buffer_size = 4096").unwrap();
	writeln!(f, "reload_interval_ms = 100").unwrap();
	writeln!(f, "connect_timeout_ms = 1000").unwrap();
	writeln!(f, "network_timeout_ms = 2000").unwrap();
	path
}

async fn wait_for_master(systems: &[Arc<System<Tree>>], timeout: Duration) {
	let deadline = tokio::time::Instant::now() + timeout;
	loop {
		if systems.iter().all(|s| s.view.master().is_some()) {
			return;
		}
		if tokio::time::Instant::now() >= deadline {
			panic!("cluster did not elect a master within {:?}", timeout);
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
}

/// There is no binlog catch-up protocol for a slave that joins after
/// records were already flushed (spec.md §8: a data_version gap is fatal),
/// so tests wait for every slave to have joined before mutating.
async fn wait_for_all_joined(systems: &[Arc<System<Tree>>], timeout: Duration) {
	let deadline = tokio::time::Instant::now() + timeout;
	loop {
		if let Some(master) = systems.iter().find(|s| s.view.myself().is_master()) {
			if master.view.active_slave_count() == systems.len() - 1 {
				return;
			}
		}
		if tokio::time::Instant::now() >= deadline {
			panic!("not every slave joined the master within {:?}", timeout);
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
}

/// Starts a `count`-node cluster on loopback with fixed, test-specific port
/// bases and returns the running nodes plus the roster's service addresses.
async fn start_cluster(base_port: u16, count: u32) -> (mktemp::Temp, Vec<Arc<System<Tree>>>, Vec<SocketAddr>) {
	let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env()).try_init();
	let dir = mktemp::Temp::new_dir().unwrap();
	let nodes: Vec<NodeAddrs> = (1..=count)
		.map(|i| NodeAddrs {
			server_id: i,
			cluster_addr: format!("127.0.0.1:{}", base_port + i as u16 * 2).parse().unwrap(),
			service_addr: format!("127.0.0.1:{}", base_port + i as u16 * 2 + 1).parse().unwrap(),
		})
		.collect();
	let roster_path = write_roster(&dir, &nodes);

	let mut systems = Vec::new();
	for node in &nodes {
		let config_path = write_config(&dir, node.server_id, node, &roster_path);
		let system = server::start_node(&config_path).await.unwrap();
		systems.push(system);
	}
	wait_for_master(&systems, Duration::from_secs(10)).await;
	wait_for_all_joined(&systems, Duration::from_secs(10)).await;

	let service_addrs = nodes.iter().map(|n| n.service_addr).collect();
	(dir, systems, service_addrs)
}

fn client_for(service_addrs: &[SocketAddr]) -> Client {
	Client::new(ClientConfig {
		servers: service_addrs.to_vec(),
		connect_timeout: Duration::from_millis(500),
		network_timeout: Duration::from_secs(2),
		max_body_len: 4096,
	})
}

#[tokio::test]
async fn two_node_cluster_replicates_a_create() {
	let (_dir, systems, service_addrs) = start_cluster(23100, 2).await;
	let client = client_for(&service_addrs);

	client.create("ns1", "/a", 0o755, 0).await.unwrap();

	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	loop {
		if systems.iter().all(|s| s.store.applied_data_version() >= 1) {
			break;
		}
		if tokio::time::Instant::now() >= deadline {
			panic!("create did not replicate to every node in time");
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}

	let entries = client.list_all("ns1", "/").await.unwrap();
	assert_eq!(entries.len(), 1);
	assert_eq!(entries[0].name, "a");

	for system in &systems {
		system.continue_flag.store(false, std::sync::atomic::Ordering::SeqCst);
	}
}

#[tokio::test]
async fn killing_the_master_elects_the_most_caught_up_survivor() {
	let (_dir, systems, service_addrs) = start_cluster(23300, 3).await;
	let client = client_for(&service_addrs);

	client.create("ns1", "/a", 0o755, 0).await.unwrap();
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	loop {
		if systems.iter().all(|s| s.store.applied_data_version() >= 1) {
			break;
		}
		if tokio::time::Instant::now() >= deadline {
			panic!("create did not replicate to every node in time");
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}

	let master_id = systems.iter().find(|s| s.view.myself().is_master()).unwrap().view.myself().server_id;
	let expected_next_master = systems
		.iter()
		.filter(|s| s.view.myself().server_id != master_id)
		.max_by_key(|s| s.store.applied_data_version())
		.unwrap()
		.view
		.myself()
		.server_id;

	for system in &systems {
		if system.view.myself().server_id == master_id {
			system.continue_flag.store(false, std::sync::atomic::Ordering::SeqCst);
		}
	}

	let survivors: Vec<Arc<System<Tree>>> = systems.iter().filter(|s| s.view.myself().server_id != master_id).cloned().collect();

	// Getting here costs the full PING_MASTER failure threshold (up to ~4
	// backoff rounds doubling from 1s) plus election's own up-to-5-round
	// backoff (2+4+8+16s) before two survivors with no reported master yet
	// settle on a winner, so the deadline is generous by design.
	let deadline = tokio::time::Instant::now() + Duration::from_secs(90);
	loop {
		if let Some(new_master) = survivors.iter().find(|s| s.view.myself().is_master()) {
			assert_eq!(new_master.view.myself().server_id, expected_next_master, "elected master should be the survivor with the highest data_version");
			break;
		}
		if tokio::time::Instant::now() >= deadline {
			panic!("survivors did not elect a new master within {:?}", deadline);
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}

	let surviving_service_addrs: Vec<SocketAddr> = service_addrs
		.iter()
		.zip(systems.iter())
		.filter(|(_, s)| s.view.myself().server_id != master_id)
		.map(|(addr, _)| *addr)
		.collect();
	let client = client_for(&surviving_service_addrs);
	let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
	loop {
		match client.create("ns1", "/b", 0o755, 0).await {
			Ok(()) => break,
			Err(_) if tokio::time::Instant::now() < deadline => tokio::time::sleep(Duration::from_millis(100)).await,
			Err(e) => panic!("client retry against new master failed: {}", e),
		}
	}

	for system in &survivors {
		system.continue_flag.store(false, std::sync::atomic::Ordering::SeqCst);
	}
}

#[tokio::test]
async fn three_node_cluster_lists_after_several_creates() {
	let (_dir, systems, service_addrs) = start_cluster(23200, 3).await;
	let client = client_for(&service_addrs);

	for name in ["a", "b", "c"] {
		client.create("ns1", &format!("/{}", name), 0o755, 0).await.unwrap();
	}

	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	loop {
		if systems.iter().all(|s| s.store.applied_data_version() >= 3) {
			break;
		}
		if tokio::time::Instant::now() >= deadline {
			panic!("creates did not replicate to every node in time");
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}

	let entries = client.list_all("ns1", "/").await.unwrap();
	let mut names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
	names.sort();
	assert_eq!(names, vec!["a", "b", "c"]);

	client.remove("ns1", "/b").await.unwrap();
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
	loop {
		if systems.iter().all(|s| s.store.applied_data_version() >= 4) {
			break;
		}
		if tokio::time::Instant::now() >= deadline {
			panic!("remove did not replicate to every node in time");
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
	let entries = client.list_all("ns1", "/").await.unwrap();
	let mut names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
	names.sort();
	assert_eq!(names, vec!["a", "c"]);

	for system in &systems {
		system.continue_flag.store(false, std::sync::atomic::Ordering::SeqCst);
	}
}
