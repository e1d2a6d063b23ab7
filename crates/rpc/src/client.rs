//! Request correlation and handler dispatch for one server connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace, warn};

use crate::codec;
use crate::message::{AnyNotification, AnyRequest, AnyResponse, ErrorCode, Message, RequestId, ResponseError};
use crate::{Error, Result};

/// Called with the `result` of a successful response.
pub type ResponseCallback = Box<dyn FnOnce(JsonValue) + Send>;
/// Called when a request fails, either with the server's error or a transport error.
pub type ErrorCallback = Box<dyn FnOnce(Error) + Send>;
/// Handles a server-initiated request. The handler answers through [`Client::send_response`].
pub type RequestHandler = Arc<dyn Fn(JsonValue, RequestId) + Send + Sync>;
/// Handles a server notification.
pub type NotificationHandler = Arc<dyn Fn(JsonValue) + Send + Sync>;
/// Receives lines the server writes to stderr.
pub type StderrSink = Arc<dyn Fn(&str) + Send + Sync>;

type CrashHandler = Box<dyn FnOnce() + Send>;

/// Per-connection options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
	/// Trace every message under the `ulf::payload` target.
	pub log_payloads: bool,
	/// How long [`Client::close`] waits for the server to go away before killing it.
	pub shutdown_grace: Duration,
}

impl Default for ClientOptions {
	fn default() -> Self {
		Self {
			log_payloads: false,
			shutdown_grace: Duration::from_secs(2),
		}
	}
}

enum Responder {
	Callbacks { on_success: ResponseCallback, on_error: ErrorCallback },
	Waiter(oneshot::Sender<Result<JsonValue>>),
}

impl Responder {
	fn resolve(self, outcome: std::result::Result<JsonValue, ResponseError>) {
		match (self, outcome) {
			(Self::Callbacks { on_success, .. }, Ok(result)) => on_success(result),
			(Self::Callbacks { on_error, .. }, Err(err)) => on_error(Error::Response(err)),
			(Self::Waiter(tx), outcome) => {
				let _ = tx.send(outcome.map_err(Error::Response));
			}
		}
	}

	fn fail(self, error: Error) {
		match self {
			Self::Callbacks { on_error, .. } => on_error(error),
			Self::Waiter(tx) => {
				let _ = tx.send(Err(error));
			}
		}
	}
}

struct PendingRequest {
	method: String,
	responder: Responder,
}

enum Outbound {
	Message(Message),
	Close,
}

#[derive(Default)]
struct Handlers {
	requests: HashMap<String, RequestHandler>,
	notifications: HashMap<String, NotificationHandler>,
}

struct Shared {
	name: String,
	options: ClientOptions,
	next_id: AtomicI64,
	outbound: mpsc::UnboundedSender<Outbound>,
	pending: Mutex<HashMap<RequestId, PendingRequest>>,
	handlers: Mutex<Handlers>,
	crash_handler: Mutex<Option<CrashHandler>>,
	/// Cleared once the connection can no longer carry messages.
	alive: AtomicBool,
	/// Set when the owner asked for the connection to end.
	closing: AtomicBool,
	finished: AtomicBool,
	closed_tx: watch::Sender<bool>,
	child: Mutex<Option<Child>>,
	reader_task: Mutex<Option<AbortHandle>>,
}

/// A connection to one language server.
///
/// Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct Client {
	shared: Arc<Shared>,
}

impl std::fmt::Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client")
			.field("name", &self.shared.name)
			.field("alive", &self.is_alive())
			.finish_non_exhaustive()
	}
}

impl Client {
	/// Starts a client over an arbitrary byte stream pair.
	///
	/// Must be called from within a tokio runtime.
	pub fn new<R, W>(name: impl Into<String>, reader: R, writer: W, options: ClientOptions) -> Self
	where
		R: AsyncRead + Unpin + Send + 'static,
		W: AsyncWrite + Unpin + Send + 'static,
	{
		Self::with_child(name.into(), reader, writer, None, options)
	}

	pub(crate) fn with_child<R, W>(name: String, reader: R, writer: W, child: Option<Child>, options: ClientOptions) -> Self
	where
		R: AsyncRead + Unpin + Send + 'static,
		W: AsyncWrite + Unpin + Send + 'static,
	{
		let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
		let (closed_tx, _) = watch::channel(false);
		let shared = Arc::new(Shared {
			name,
			options,
			next_id: AtomicI64::new(1),
			outbound: outbound_tx,
			pending: Mutex::new(HashMap::new()),
			handlers: Mutex::new(Handlers::default()),
			crash_handler: Mutex::new(None),
			alive: AtomicBool::new(true),
			closing: AtomicBool::new(false),
			finished: AtomicBool::new(false),
			closed_tx,
			child: Mutex::new(child),
			reader_task: Mutex::new(None),
		});

		tokio::spawn(run_writer(shared.clone(), writer, outbound_rx));
		let reader_task = tokio::spawn(run_reader(shared.clone(), reader));
		*shared.reader_task.lock() = Some(reader_task.abort_handle());

		Self { shared }
	}

	/// Server name used in logs.
	pub fn name(&self) -> &str {
		&self.shared.name
	}

	/// Returns true while the connection can carry messages.
	pub fn is_alive(&self) -> bool {
		self.shared.alive.load(Ordering::Acquire)
	}

	/// Sends a request; exactly one of the callbacks runs when the response arrives.
	///
	/// If the connection is already gone, `on_error` runs before this returns. If the
	/// connection ends while the request is in flight, neither callback runs.
	pub fn send_request(
		&self,
		method: &str,
		params: JsonValue,
		on_success: impl FnOnce(JsonValue) + Send + 'static,
		on_error: impl FnOnce(Error) + Send + 'static,
	) {
		self.dispatch_request(
			method,
			params,
			Responder::Callbacks {
				on_success: Box::new(on_success),
				on_error: Box::new(on_error),
			},
		);
	}

	/// Sends a request and waits for its response.
	///
	/// The wait happens on the calling task; the connection's reader is unaffected.
	pub async fn execute_request(&self, method: &str, params: JsonValue, timeout: Option<Duration>) -> Result<JsonValue> {
		let (tx, rx) = oneshot::channel();
		let Some(id) = self.dispatch_request(method, params, Responder::Waiter(tx)) else {
			return Err(Error::ServiceStopped);
		};

		let outcome = match timeout {
			Some(limit) => match tokio::time::timeout(limit, rx).await {
				Ok(outcome) => outcome,
				Err(_) => {
					self.shared.pending.lock().remove(&id);
					warn!(server = %self.shared.name, method, %id, "request timed out");
					return Err(Error::RequestTimeout(method.to_string()));
				}
			},
			None => rx.await,
		};
		outcome.unwrap_or(Err(Error::ServiceStopped))
	}

	/// Returns the assigned id, or `None` if the request failed immediately.
	fn dispatch_request(&self, method: &str, params: JsonValue, responder: Responder) -> Option<RequestId> {
		if !self.is_alive() {
			debug!(server = %self.shared.name, method, "request on dead connection");
			responder.fail(Error::ServiceStopped);
			return None;
		}

		let id = RequestId::Number(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
		self.shared.pending.lock().insert(
			id.clone(),
			PendingRequest {
				method: method.to_string(),
				responder,
			},
		);

		let msg = Message::Request(AnyRequest {
			id: id.clone(),
			method: method.to_string(),
			params,
		});
		let sent = self.is_alive() && self.shared.outbound.send(Outbound::Message(msg)).is_ok();
		if !sent {
			let pending = self.shared.pending.lock().remove(&id);
			if let Some(pending) = pending {
				pending.responder.fail(Error::ServiceStopped);
			}
			return None;
		}
		Some(id)
	}

	/// Sends a notification.
	pub fn send_notification(&self, method: &str, params: JsonValue) -> Result<()> {
		self.enqueue(Message::Notification(AnyNotification {
			method: method.to_string(),
			params,
		}))
	}

	/// Answers a server-initiated request.
	pub fn send_response(&self, id: RequestId, result: JsonValue) -> Result<()> {
		self.enqueue(Message::Response(AnyResponse {
			id,
			result: Some(result),
			error: None,
		}))
	}

	/// Answers a server-initiated request with an error.
	pub fn send_error_response(&self, id: RequestId, error: ResponseError) -> Result<()> {
		self.enqueue(Message::Response(AnyResponse {
			id,
			result: None,
			error: Some(error),
		}))
	}

	fn enqueue(&self, msg: Message) -> Result<()> {
		if !self.is_alive() {
			return Err(Error::ServiceStopped);
		}
		self.shared.outbound.send(Outbound::Message(msg)).map_err(|_| Error::ServiceStopped)
	}

	/// Registers the handler for a server-initiated request, replacing any earlier one.
	pub fn on_request(&self, method: impl Into<String>, handler: impl Fn(JsonValue, RequestId) + Send + Sync + 'static) {
		self.shared.handlers.lock().requests.insert(method.into(), Arc::new(handler));
	}

	/// Registers the handler for a server notification, replacing any earlier one.
	pub fn on_notification(&self, method: impl Into<String>, handler: impl Fn(JsonValue) + Send + Sync + 'static) {
		self.shared.handlers.lock().notifications.insert(method.into(), Arc::new(handler));
	}

	/// Sets the handler run once if the connection ends without [`Client::close`].
	pub fn set_crash_handler(&self, handler: impl FnOnce() + Send + 'static) {
		*self.shared.crash_handler.lock() = Some(Box::new(handler));
	}

	/// Resolves once the connection has ended, for whatever reason.
	pub async fn closed(&self) {
		let mut rx = self.shared.closed_tx.subscribe();
		let _ = rx.wait_for(|closed| *closed).await;
	}

	/// Ends the connection.
	///
	/// Queued messages are written first. A server process gets the configured grace window to
	/// exit on its own before it is killed.
	pub async fn close(&self) {
		if self.shared.closing.swap(true, Ordering::AcqRel) {
			self.closed().await;
			return;
		}
		let _ = self.shared.outbound.send(Outbound::Close);

		let grace = self.shared.options.shutdown_grace;
		let child = self.shared.child.lock().take();
		if let Some(mut child) = child {
			match tokio::time::timeout(grace, child.wait()).await {
				Ok(Ok(status)) => debug!(server = %self.shared.name, %status, "server process exited"),
				Ok(Err(e)) => warn!(server = %self.shared.name, error = %e, "failed waiting for server process"),
				Err(_) => {
					warn!(server = %self.shared.name, "server did not exit within grace window, killing");
					if let Err(e) = child.kill().await {
						warn!(server = %self.shared.name, error = %e, "failed to kill server process");
					}
				}
			}
		}

		if tokio::time::timeout(grace, self.closed()).await.is_err() {
			debug!(server = %self.shared.name, "peer kept the stream open, dropping reader");
			if let Some(task) = self.shared.reader_task.lock().take() {
				task.abort();
			}
			self.shared.finish();
		}
	}
}

impl Shared {
	fn log_payload(&self, direction: &str, value: &JsonValue) {
		if self.options.log_payloads {
			trace!(target: "ulf::payload", server = %self.name, direction, "{value}");
		}
	}

	fn dispatch(&self, value: JsonValue) {
		self.log_payload("<-", &value);
		let msg = match Message::from_value(value) {
			Ok(msg) => msg,
			Err(e) => {
				warn!(server = %self.name, error = %e, "dropping malformed message");
				return;
			}
		};

		match msg {
			Message::Response(resp) => {
				let pending = self.pending.lock().remove(&resp.id);
				let Some(pending) = pending else {
					warn!(server = %self.name, id = %resp.id, "response for unknown request");
					return;
				};
				trace!(server = %self.name, method = %pending.method, id = %resp.id, "response");
				pending.responder.resolve(resp.into_result());
			}
			Message::Notification(notif) => {
				let handler = self.handlers.lock().notifications.get(&notif.method).cloned();
				match handler {
					Some(handler) => handler(notif.params),
					None => debug!(server = %self.name, method = %notif.method, "unhandled notification"),
				}
			}
			Message::Request(req) => {
				let handler = self.handlers.lock().requests.get(&req.method).cloned();
				match handler {
					Some(handler) => handler(req.params, req.id),
					None => {
						debug!(server = %self.name, method = %req.method, "unhandled request");
						let reply = Message::Response(AnyResponse {
							id: req.id,
							result: None,
							error: Some(ResponseError::new(ErrorCode::METHOD_NOT_FOUND, format!("unhandled method {}", req.method))),
						});
						let _ = self.outbound.send(Outbound::Message(reply));
					}
				}
			}
		}
	}

	/// Tears down connection state once. Pending requests are abandoned.
	fn finish(&self) {
		if self.finished.swap(true, Ordering::AcqRel) {
			return;
		}
		self.alive.store(false, Ordering::Release);
		let abandoned = std::mem::take(&mut *self.pending.lock());
		if !abandoned.is_empty() {
			debug!(server = %self.name, count = abandoned.len(), "abandoning pending requests");
		}
		drop(abandoned);
		let _ = self.outbound.send(Outbound::Close);

		if !self.closing.load(Ordering::Acquire) {
			let handler = self.crash_handler.lock().take();
			if let Some(handler) = handler {
				handler();
			}
		}
		self.closed_tx.send_replace(true);
	}
}

async fn run_writer<W>(shared: Arc<Shared>, mut writer: W, mut outbound_rx: mpsc::UnboundedReceiver<Outbound>)
where
	W: AsyncWrite + Unpin,
{
	while let Some(out) = outbound_rx.recv().await {
		match out {
			Outbound::Message(msg) => {
				if shared.options.log_payloads {
					shared.log_payload("->", &msg.to_value());
				}
				if let Err(e) = codec::write_message(&mut writer, &msg).await {
					error!(server = %shared.name, error = %e, "outbound write failed");
					shared.alive.store(false, Ordering::Release);
					break;
				}
			}
			Outbound::Close => break,
		}
	}
	let _ = writer.shutdown().await;
}

async fn run_reader<R>(shared: Arc<Shared>, reader: R)
where
	R: AsyncRead + Unpin,
{
	let _finish = FinishOnDrop(shared.clone());
	let mut reader = BufReader::new(reader);
	loop {
		match codec::read_message(&mut reader).await {
			Ok(Some(value)) => shared.dispatch(value),
			Ok(None) => {
				info!(server = %shared.name, "server closed connection");
				break;
			}
			Err(e) if e.is_recoverable() => {
				warn!(server = %shared.name, error = %e, "dropping malformed message");
			}
			Err(e) => {
				error!(server = %shared.name, error = %e, "error reading from server");
				break;
			}
		}
	}
}

/// Tears the connection down when the reader stops, even if a handler panicked.
struct FinishOnDrop(Arc<Shared>);

impl Drop for FinishOnDrop {
	fn drop(&mut self) {
		self.0.finish();
	}
}
