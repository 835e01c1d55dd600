//! Server-side list-dentry paging (spec.md §4.11): a cursor keyed by an
//! opaque 16-byte token with a TTL. `tokio::sync::Mutex<HashMap<..>>` is
//! sufficient at this scale, matching the teacher's preference for explicit
//! locking over reaching for a concurrent-map crate when one isn't needed.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use fdir_util::data::Token;
use fdir_util::error::{errno, Error};

use crate::tree::DentryInfo;

const CURSOR_TTL: Duration = Duration::from_secs(60);

struct Cursor {
	entries: Vec<DentryInfo>,
	offset: usize,
	expires_at: Instant,
}

/// One page of a listing: the server->client half of `LIST_DENTRY_FIRST_RESP`
/// / `LIST_DENTRY_NEXT_RESP`.
#[derive(Debug)]
pub struct Page {
	pub entries: Vec<DentryInfo>,
	pub is_last: bool,
	pub token: Token,
}

/// Holds every in-flight listing's cursor. One instance per node, shared by
/// all client connections.
pub struct ListingManager {
	cursors: Mutex<HashMap<Token, Cursor>>,
	page_size: usize,
}

impl ListingManager {
	pub fn new(page_size: usize) -> Self {
		Self {
			cursors: Mutex::new(HashMap::new()),
			page_size: page_size.max(1),
		}
	}

	/// Starts a new listing over `entries` (already the full, sorted set of
	/// direct children), returning its first page. A listing that fits in
	/// one page never gets a cursor (spec.md §4.11: "names in the final
	/// page may reference the response buffer directly").
	pub async fn first(&self, entries: Vec<DentryInfo>) -> Page {
		let mut cursors = self.cursors.lock().await;
		evict_expired(&mut cursors);

		if entries.len() <= self.page_size {
			return Page {
				entries,
				is_last: true,
				token: Token::zero(),
			};
		}

		let token = Token::random();
		let first_page = entries[..self.page_size].to_vec();
		cursors.insert(
			token,
			Cursor {
				entries,
				offset: self.page_size,
				expires_at: Instant::now() + CURSOR_TTL,
			},
		);
		Page {
			entries: first_page,
			is_last: false,
			token,
		}
	}

	/// Continues a listing by `token`. An unknown or expired token is a
	/// distinct error (spec.md §4.11), not silently treated as an empty
	/// result. `offset` is the client's accumulated entry count and must
	/// agree with the server's own cursor position, catching a client that
	/// retried against a stale or mismatched session.
	pub async fn next(&self, token: Token, offset: u32) -> Result<Page, Error> {
		let mut cursors = self.cursors.lock().await;
		let expired = cursors.get(&token).map(|c| Instant::now() > c.expires_at).unwrap_or(true);
		if expired {
			cursors.remove(&token);
			return Err(Error::application(errno::ENOENT, "unknown or expired list token"));
		}
		let cursor = cursors.get_mut(&token).unwrap();
		if cursor.offset != offset as usize {
			return Err(Error::application(errno::EINVAL, "list offset does not match server cursor"));
		}

		let remaining = cursor.entries.len() - cursor.offset;
		let take = remaining.min(self.page_size);
		let page_entries = cursor.entries[cursor.offset..cursor.offset + take].to_vec();
		cursor.offset += take;
		let is_last = cursor.offset >= cursor.entries.len();

		if is_last {
			cursors.remove(&token);
			Ok(Page {
				entries: page_entries,
				is_last: true,
				token: Token::zero(),
			})
		} else {
			Ok(Page {
				entries: page_entries,
				is_last: false,
				token,
			})
		}
	}
}

fn evict_expired(cursors: &mut HashMap<Token, Cursor>) {
	let now = Instant::now();
	cursors.retain(|_, c| c.expires_at > now);
}
