//! JSON-RPC client transport for language servers.
//!
//! This crate owns the connection to a single language server: spawning the process (or
//! connecting to its socket), framing messages on the wire, and correlating responses with
//! the requests that caused them.
//! * [`Client`]: request/notification/response correlation and handler registration
//! * [`ProcessCommand`]: how to launch a server process
//! * [`message`]: the JSON-RPC 2.0 message model
//! * [`codec`]: `Content-Length` framing over async byte streams
//!
//! The client runs two tasks per connection. The writer drains a single FIFO queue, so
//! messages reach the server in exactly the order they were enqueued. The reader dispatches
//! inbound traffic and never blocks on a caller waiting in [`Client::execute_request`].

#![warn(missing_docs)]

mod client;
pub mod codec;
pub mod message;
mod transport;

pub use client::{Client, ClientOptions, ErrorCallback, NotificationHandler, RequestHandler, ResponseCallback, StderrSink};
pub use message::{AnyNotification, AnyRequest, AnyResponse, ErrorCode, Message, RequestId, ResponseError};
pub use serde_json::Value as JsonValue;
pub use transport::{ProcessCommand, expand_user, expand_vars};

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible errors.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The connection to the server is gone.
	#[error("service stopped")]
	ServiceStopped,
	/// The peer sent undecodable data.
	#[error("deserialization failed: {0}")]
	Deserialize(String),
	/// The peer replied with an error.
	#[error("{0}")]
	Response(#[from] ResponseError),
	/// The request timed out.
	#[error("request timed out: {0}")]
	RequestTimeout(String),
	/// The peer sent a message of the wrong shape.
	#[error("protocol error: {0}")]
	Protocol(String),
	/// The stream's message boundaries can no longer be trusted.
	#[error("framing error: {0}")]
	Framing(String),
	/// Input/output errors from the underlying channels.
	#[error("{0}")]
	Io(String),
	/// Failed to spawn the language server process.
	#[error("failed to spawn '{command}': {reason}")]
	Spawn {
		/// The command that failed.
		command: String,
		/// The failure reason.
		reason: String,
	},
	/// Failed to connect to the language server socket.
	#[error("failed to connect to {addr}: {reason}")]
	Connect {
		/// The address that was dialed.
		addr: String,
		/// The failure reason.
		reason: String,
	},
}

impl Error {
	/// Returns true if this error only affects one message and the stream is still usable.
	///
	/// Framing errors are never recoverable: the rest of the stream cannot be located.
	pub fn is_recoverable(&self) -> bool {
		matches!(self, Self::Deserialize(_) | Self::Protocol(_))
	}
}

impl From<serde_json::Error> for Error {
	fn from(e: serde_json::Error) -> Self {
		Self::Deserialize(e.to_string())
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Self {
		Self::Io(e.to_string())
	}
}
