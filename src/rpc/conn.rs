//! A peer connection is either open or closed (spec.md §4.2): a thin
//! wrapper over one `TcpStream`. Any I/O error classified as network-fatal
//! drops the socket; the next call reconnects from scratch.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use fdir_util::error::Error;

use crate::proto::{self, STATUS_OK};

pub struct PeerConn {
	addr: SocketAddr,
	stream: Option<TcpStream>,
	connect_timeout: Duration,
	network_timeout: Duration,
}

impl PeerConn {
	pub fn new(addr: SocketAddr, connect_timeout: Duration, network_timeout: Duration) -> Self {
		Self {
			addr,
			stream: None,
			connect_timeout,
			network_timeout,
		}
	}

	pub fn addr(&self) -> SocketAddr {
		self.addr
	}

	pub fn is_open(&self) -> bool {
		self.stream.is_some()
	}

	/// Drops the socket; the next `request` reconnects.
	pub fn close(&mut self) {
		self.stream = None;
	}

	async fn ensure_connected(&mut self) -> Result<&mut TcpStream, Error> {
		if self.stream.is_none() {
			let stream = timeout(self.connect_timeout, TcpStream::connect(self.addr))
				.await
				.map_err(|_| Error::Network(self.addr.to_string(), "connect timed out".into()))?
				.map_err(|e| Error::Network(self.addr.to_string(), format!("connect failed: {}", e)))?;
			stream
				.set_nodelay(true)
				.map_err(|e| Error::Network(self.addr.to_string(), format!("set_nodelay failed: {}", e)))?;
			debug!("connected to {}", self.addr);
			self.stream = Some(stream);
		}
		Ok(self.stream.as_mut().unwrap())
	}

	/// Sends `req_cmd`/`req_body` and waits for one response frame of
	/// `expected_resp_cmd`. Any network error closes the connection so the
	/// caller's next attempt reconnects (spec.md §4.2).
	pub async fn request(
		&mut self,
		req_cmd: u8,
		req_body: &[u8],
		expected_resp_cmd: u8,
		max_body_len: u32,
	) -> Result<bytes::Bytes, Error> {
		let network_timeout = self.network_timeout;
		let stream = self.ensure_connected().await?;
		let result =
			proto::send_request_recv_response(stream, req_cmd, req_body, expected_resp_cmd, max_body_len, network_timeout)
				.await;
		if let Err(ref e) = result {
			if matches!(e, Error::Network(_, _)) {
				warn!("closing connection to {} after network error: {}", self.addr, e);
				self.close();
			}
		}
		result
	}

	/// Fire-and-forget a frame expecting an `ACK`/empty response with
	/// `STATUS_OK`, discarding the body. Used by phases that only need to
	/// know the call didn't fail.
	pub async fn request_ack(&mut self, req_cmd: u8, req_body: &[u8]) -> Result<(), Error> {
		let network_timeout = self.network_timeout;
		let stream = self.ensure_connected().await?;
		proto::write_frame(stream, req_cmd, STATUS_OK, req_body, network_timeout).await?;
		let header = proto::read_header(stream, network_timeout).await?;
		let _ = proto::read_body(stream, header.body_len, 65536, network_timeout).await?;
		if header.status != STATUS_OK {
			return Err(Error::application(header.status as i32, "rejected"));
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::proto::cmd;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpListener;

	#[tokio::test]
	async fn reconnects_after_close() {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		tokio::spawn(async move {
			loop {
				let (mut sock, _) = match listener.accept().await {
					Ok(v) => v,
					Err(_) => return,
				};
				tokio::spawn(async move {
					let mut header = [0u8; proto::HEADER_LEN];
					if sock.read_exact(&mut header).await.is_err() {
						return;
					}
					let h = proto::Header::unpack(&header);
					let mut body = vec![0u8; h.body_len as usize];
					sock.read_exact(&mut body).await.unwrap();
					let resp = proto::Header::new(cmd::ACK, STATUS_OK, 0).pack();
					sock.write_all(&resp).await.unwrap();
				});
			}
		});

		let mut conn = PeerConn::new(addr, Duration::from_secs(1), Duration::from_secs(1));
		assert!(!conn.is_open());
		conn.request(cmd::PING_MASTER_REQ, b"", cmd::ACK, 4096).await.unwrap();
		assert!(conn.is_open());
		conn.close();
		assert!(!conn.is_open());
		conn.request(cmd::PING_MASTER_REQ, b"", cmd::ACK, 4096).await.unwrap();
		assert!(conn.is_open());
	}
}
