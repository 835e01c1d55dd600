//! CLI subcommand implementations: each opens whatever connections it needs
//! directly (no running admin endpoint to dial into, unlike a full RPC mesh)
//! and prints the result.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, Bytes};

use fdir_client::client::{Client, ClientConfig};
use fdir_rpc::conn::PeerConn;
use fdir_rpc::proto::cmd;
use fdir_util::config::RosterEntry;
use fdir_util::error::Error;

/// One server's answer to `SERVICE_STAT_REQ`.
struct ServiceStat {
	is_master: bool,
	applied_data_version: u64,
	up_time: u64,
}

fn unpack_service_stat(mut body: Bytes) -> Result<ServiceStat, Error> {
	if body.len() < 17 {
		return Err(Error::Protocol("truncated SERVICE_STAT_RESP".into()));
	}
	Ok(ServiceStat {
		is_master: body.get_u8() != 0,
		applied_data_version: body.get_u64(),
		up_time: body.get_u64(),
	})
}

/// Queries every roster member's `SERVICE_STAT_REQ` and prints a status
/// table, unreachable servers included as such (mirrors the "HEALTHY /
/// FAILED" split of a cluster status command, simplified since this
/// rewrite has no node-advertisement gossip to draw on).
pub async fn cmd_status(roster: &[RosterEntry], connect_timeout: Duration, network_timeout: Duration) -> Result<(), Error> {
	let formatter = timeago::Formatter::new();
	println!("SERVER\tADDRESS\tROLE\tDATA_VERSION\tUP_TIME");
	for entry in roster {
		let mut conn = PeerConn::new(entry.service_addr, connect_timeout, network_timeout);
		match conn.request(cmd::SERVICE_STAT_REQ, b"", cmd::SERVICE_STAT_RESP, 64).await {
			Ok(body) => match unpack_service_stat(body) {
				Ok(stat) => {
					println!(
						"{}\t{}\t{}\t{}\t{}",
						entry.server_id,
						entry.service_addr,
						if stat.is_master { "master" } else { "slave" },
						stat.applied_data_version,
						formatter.convert(Duration::from_secs(stat.up_time)),
					);
				}
				Err(e) => println!("{}\t{}\tmalformed response: {}", entry.server_id, entry.service_addr, e),
			},
			Err(e) => println!("{}\t{}\tunreachable: {}", entry.server_id, entry.service_addr, e),
		}
	}
	Ok(())
}

pub async fn cmd_create(client: &Client, ns: &str, path: &str, mode: u32) -> Result<(), Error> {
	client.create(ns, path, mode, 0).await?;
	println!("created {}:{}", ns, path);
	Ok(())
}

pub async fn cmd_remove(client: &Client, ns: &str, path: &str) -> Result<(), Error> {
	client.remove(ns, path).await?;
	println!("removed {}:{}", ns, path);
	Ok(())
}

pub async fn cmd_list(client: &Client, ns: &str, path: &str) -> Result<(), Error> {
	let entries = client.list_all(ns, path).await?;
	println!("NAME\tINODE\tMODE\tFLAGS\tTIMESTAMP");
	for e in entries {
		println!("{}\t{}\t{:o}\t{}\t{}", e.name, e.inode, e.mode, e.flags, e.timestamp);
	}
	Ok(())
}

pub fn client_config(roster: &[RosterEntry], connect_timeout: Duration, network_timeout: Duration, max_body_len: u32) -> ClientConfig {
	ClientConfig {
		servers: roster.iter().map(|e| e.service_addr).collect::<Vec<SocketAddr>>(),
		connect_timeout,
		network_timeout,
		max_body_len,
	}
}
