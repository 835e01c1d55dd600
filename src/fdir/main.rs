//! FastDIR CLI: runs the server, or talks to a running cluster to show
//! status, list a directory, or create/remove a dentry.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use fdir::{cli, server};
use fdir_client::client::Client;
use fdir_util::config::{read_config, read_roster};
use fdir_util::error::Error;

#[derive(Parser, Debug)]
#[command(name = "fdir", about = "FastDIR, a replicated in-memory directory metadata service")]
struct Opt {
	/// Path to the main configuration file.
	#[arg(short = 'c', long = "config", env = "FDIR_CONFIG_FILE", default_value = "/etc/fdir.conf")]
	config_file: PathBuf,

	#[command(subcommand)]
	cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run the server until it receives a shutdown signal.
	Server,
	/// Show every roster member's master/slave role and data version.
	Status,
	/// List the direct children of a path.
	List { ns: String, path: String },
	/// Create a dentry.
	Create {
		ns: String,
		path: String,
		#[arg(long, default_value_t = 0o755)]
		mode: u32,
	},
	/// Remove a dentry.
	Remove { ns: String, path: String },
}

#[tokio::main]
async fn main() {
	let opt = Opt::parse();

	if std::env::var("RUST_LOG").is_err() {
		let default_log = match &opt.cmd {
			Command::Server => "fdir=info,fdir_rpc=info,fdir_model=info",
			_ => "fdir=warn",
		};
		std::env::set_var("RUST_LOG", default_log);
	}
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
		.init();

	if let Err(e) = run(opt).await {
		eprintln!("Error: {}", e);
		std::process::exit(1);
	}
}

async fn run(opt: Opt) -> Result<(), Error> {
	if matches!(opt.cmd, Command::Server) {
		return server::run_server(&opt.config_file).await;
	}

	let config = read_config(&opt.config_file)?;
	let roster = read_roster(&config.cluster_config_filename)?;
	let connect_timeout = Duration::from_millis(config.connect_timeout_ms);
	let network_timeout = Duration::from_millis(config.network_timeout_ms);
	let max_body_len = config.dentry_max_data_size as u32 + 4096;

	match opt.cmd {
		Command::Server => unreachable!(),
		Command::Status => cli::cmd::cmd_status(&roster, connect_timeout, network_timeout).await,
		Command::List { ns, path } => {
			let client = Client::new(cli::cmd::client_config(&roster, connect_timeout, network_timeout, max_body_len));
			cli::cmd::cmd_list(&client, &ns, &path).await
		}
		Command::Create { ns, path, mode } => {
			let client = Client::new(cli::cmd::client_config(&roster, connect_timeout, network_timeout, max_body_len));
			cli::cmd::cmd_create(&client, &ns, &path, mode).await
		}
		Command::Remove { ns, path } => {
			let client = Client::new(cli::cmd::client_config(&roster, connect_timeout, network_timeout, max_body_len));
			cli::cmd::cmd_remove(&client, &ns, &path).await
		}
	}
}
