//! Cluster membership, election, heartbeat and binlog replication for
//! FastDIR: the direct analogue of `garage_rpc::system`, generalised to a
//! leader-plus-followers design instead of garage's gossip-based layout
//! table.

#[macro_use]
extern crate tracing;

pub mod cluster;
pub mod conn;
pub mod election;
pub mod heartbeat;
pub mod producer;
pub mod proto;
pub mod replica;
pub mod system;
pub mod writer;
