//! Error taxonomy used throughout FastDIR.
//!
//! Spec taxonomy (orthogonal to retryability): protocol, network, resource,
//! application, invariant/fatal. Each variant below carries the numeric
//! errno-like code that is put on the wire in the response status byte.

use err_derive::Error;

/// Errno-like numeric codes carried on the wire and in client return values.
pub mod errno {
	pub const EINVAL: i32 = 22;
	pub const ENOENT: i32 = 2;
	pub const EEXIST: i32 = 17;
	pub const EBUSY: i32 = 16;
	pub const EAGAIN: i32 = 11;
	pub const ENOMEM: i32 = 12;
	pub const EIO: i32 = 5;
	pub const EPROTO: i32 = 71;
	pub const ENOTCONN: i32 = 107;
	pub const ETIMEDOUT: i32 = 110;
	pub const EFAULT: i32 = 14;
	pub const ENOTEMPTY: i32 = 39;
	pub const EROFS: i32 = 30;
}

#[derive(Debug, Error)]
pub enum Error {
	/// Malformed header, unexpected command, body-length mismatch.
	#[error(display = "protocol error: {}", _0)]
	Protocol(String),

	/// Connect refused, timeout, EOF mid-frame. Retryable: caller fails over.
	#[error(display = "network error talking to {}: {}", _0, _1)]
	Network(String, String),

	/// Out of memory, queue full, buffer pool exhausted.
	#[error(display = "resource exhausted: {}", _0)]
	Resource(String),

	/// Dentry already exists, not found, bad name: surfaced verbatim to
	/// clients via the response status byte.
	#[error(display = "{}", _0)]
	Application(i32, String),

	/// Binlog gap, failed write-thread enqueue, next_master mismatch in
	/// commit: fatal to the process, not to be silently worked around.
	#[error(display = "invariant violation: {}", _0)]
	Invariant(String),

	#[error(display = "I/O error: {}", _0)]
	Io(#[error(source)] std::io::Error),

	#[error(display = "{}", _0)]
	Message(String),
}

impl Error {
	pub fn application(code: i32, msg: impl Into<String>) -> Self {
		Error::Application(code, msg.into())
	}

	pub fn invalid(msg: impl Into<String>) -> Self {
		Error::Application(errno::EINVAL, msg.into())
	}

	pub fn not_found(msg: impl Into<String>) -> Self {
		Error::Application(errno::ENOENT, msg.into())
	}

	/// The errno-like code this error should be reported as, to a client or
	/// on the wire status byte. Protocol/network/resource/invariant errors
	/// that don't carry an application code get a generic mapping.
	pub fn code(&self) -> i32 {
		match self {
			Error::Protocol(_) => errno::EPROTO,
			Error::Network(_, _) => errno::ENOTCONN,
			Error::Resource(_) => errno::EAGAIN,
			Error::Application(code, _) => *code,
			Error::Invariant(_) => errno::EFAULT,
			Error::Io(_) => errno::EIO,
			Error::Message(_) => errno::EFAULT,
		}
	}

	/// Whether a caller retrying the same request might reasonably succeed.
	pub fn is_retryable(&self) -> bool {
		matches!(self, Error::Network(_, _) | Error::Resource(_))
	}

	pub fn unexpected_rpc_message(msg: impl std::fmt::Debug) -> Self {
		Error::Protocol(format!("unexpected RPC message: {:?}", msg))
	}
}

impl From<&str> for Error {
	fn from(v: &str) -> Error {
		Error::Message(v.into())
	}
}

impl From<String> for Error {
	fn from(v: String) -> Error {
		Error::Message(v)
	}
}

/// Mirrors `garage_util::error::OkOrMessage`: attach a message to an `Option`
/// or a foreign `Result`, turning it into our `Error`.
pub trait OkOrMessage<T> {
	fn ok_or_message<S: Into<String>>(self, msg: S) -> Result<T, Error>;
}

impl<T> OkOrMessage<T> for Option<T> {
	fn ok_or_message<S: Into<String>>(self, msg: S) -> Result<T, Error> {
		self.ok_or_else(|| Error::Message(msg.into()))
	}
}

impl<T, E: std::fmt::Display> OkOrMessage<T> for Result<T, E> {
	fn ok_or_message<S: Into<String>>(self, msg: S) -> Result<T, Error> {
		self.map_err(|e| Error::Message(format!("{}: {}", msg.into(), e)))
	}
}

/// Mirrors `garage_util::error::ErrorContext`: wrap a foreign error with
/// added context while keeping it as a `Message`.
pub trait ErrorContext<T> {
	fn err_context<S: Into<String>>(self, context: S) -> Result<T, Error>;
}

impl<T, E: std::fmt::Display> ErrorContext<T> for Result<T, E> {
	fn err_context<S: Into<String>>(self, context: S) -> Result<T, Error> {
		self.map_err(|e| Error::Message(format!("{}: {}", context.into(), e)))
	}
}
