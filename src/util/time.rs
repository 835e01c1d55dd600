//! Time helpers, mirroring `garage_util::time`.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch.
pub fn now_msec() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("clock is set before the Unix epoch")
		.as_millis() as u64
}

/// Current time in seconds since the Unix epoch.
pub fn now_sec() -> u64 {
	now_msec() / 1000
}
