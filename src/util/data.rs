//! Small opaque data types shared across the crate: replica keys and list
//! resume tokens, both 16-byte opaque values per spec.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use rand::RngCore;

use crate::time::now_sec;

/// 16-byte opaque token. Used both as a slave's `replica_key` (authenticates
/// replication push sessions) and as a `list` resume cursor key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub [u8; 16]);

impl Token {
	pub fn zero() -> Self {
		Token([0u8; 16])
	}

	pub fn is_zero(&self) -> bool {
		self.0 == [0u8; 16]
	}

	pub fn random() -> Self {
		let mut buf = [0u8; 16];
		rand::thread_rng().fill_bytes(&mut buf);
		Token(buf)
	}
}

impl fmt::Debug for Token {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", hex::encode(self.0))
	}
}

static REPLICA_KEY_SEQ: AtomicI64 = AtomicI64::new(0);

/// Generates a replica key the way `cluster_relationship.c`'s
/// `generate_replica_key` does: mix server id, pid, a monotonic sequence
/// number and the current time with a random value, so two slaves started
/// at the same instant on the same host still get distinct keys.
pub fn generate_replica_key(server_id: u32) -> Token {
	let seq = REPLICA_KEY_SEQ.fetch_add(1, Ordering::Relaxed) + 1;
	let n1 = ((server_id as i64) << 48) | ((std::process::id() as i64) << 32) | seq;
	let n2 = ((now_sec() as i64) << 32) | (rand::thread_rng().next_u32() as i64);
	let v = n1 ^ n2;

	let mut buf = [0u8; 16];
	buf[..8].copy_from_slice(&v.to_be_bytes());
	rand::thread_rng().fill_bytes(&mut buf[8..]);
	Token(buf)
}
