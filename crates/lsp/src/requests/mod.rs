//! Capability-gated requests issued on behalf of the host.
//!
//! A [`RequestDispatcher`] resolves the first ready session that serves the view and advertises
//! the capability of the requested [`RequestKind`], flushes pending edits so the server sees the
//! current text, then sends the params built by the [`RequestTable`]. Responses are handed to
//! the host through a [`ResponseSink`] according to the [`RequestOptions`].

mod table;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, error};

pub use self::table::{Cursor, ParamsBuilder, RequestInput, RequestKind, RequestRow, RequestTable, ResponseProcessor};
use crate::context::ContextManager;
use crate::editor::{SharedView, ViewId};
use crate::session::Session;

/// Why a request was not sent.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum RequestError {
	/// The view has no file on disk.
	#[error("view {view_id} has no file name")]
	MissingFileName {
		/// The offending view.
		view_id: ViewId,
	},
	/// No ready session serves the view with the needed capability.
	#[error("Not available!")]
	NotAvailable,
	/// The host left out an option the request needs.
	#[error("missing option `{0}`")]
	MissingOption(&'static str),
	/// The session refused the request or the connection failed.
	#[error(transparent)]
	Rpc(crate::Error),
}

impl From<crate::Error> for RequestError {
	fn from(error: crate::Error) -> Self {
		match error {
			crate::Error::MissingFileName { view_id } => Self::MissingFileName { view_id },
			other => Self::Rpc(other),
		}
	}
}

/// Host options of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
	/// Host variable that receives the response.
	pub target: Option<String>,
	/// Host function called with the response.
	pub callback: Option<String>,
	/// Whether `callback` receives the response or is called without arguments.
	pub include_results: bool,
	/// Run the kind's response processor before delivery.
	pub process_response: bool,
	/// Completion prefix used by the processor.
	pub base: Option<String>,
	/// New name for `rename`.
	pub new_name: Option<String>,
	/// Query for `workspace/symbol`.
	pub query: Option<String>,
	/// Command for `workspace/executeCommand`.
	pub command: Option<String>,
	/// Arguments of `command`.
	pub arguments: Option<Vec<JsonValue>>,
	/// Completion item to resolve.
	pub item: Option<JsonValue>,
	/// Milliseconds to wait for identical calls before sending the last one.
	pub wait: Option<u64>,
}

impl Default for RequestOptions {
	fn default() -> Self {
		Self {
			target: None,
			callback: None,
			include_results: true,
			process_response: false,
			base: None,
			new_name: None,
			query: None,
			command: None,
			arguments: None,
			item: None,
			wait: None,
		}
	}
}

/// Receives responses on the host side.
pub trait ResponseSink: Send + Sync {
	/// Stores `value` in the host variable `name`.
	fn set_var(&self, name: &str, value: JsonValue);

	/// Calls the host function `name`, with the response when `argument` is given.
	fn call(&self, name: &str, argument: Option<JsonValue>);

	/// Shows a response no `target` or `callback` asked for.
	fn present(&self, kind: RequestKind, view: &SharedView, response: &JsonValue);
}

/// Issues table requests for the views of one window.
#[derive(Clone)]
pub struct RequestDispatcher {
	manager: Arc<ContextManager>,
	table: Arc<RequestTable>,
	sink: Arc<dyn ResponseSink>,
	/// Latest generation per debounced call.
	debounced: Arc<Mutex<HashMap<String, u64>>>,
}

impl RequestDispatcher {
	/// A dispatcher sending through `manager`'s sessions.
	pub fn new(manager: Arc<ContextManager>, table: Arc<RequestTable>, sink: Arc<dyn ResponseSink>) -> Self {
		Self {
			manager,
			table,
			sink,
			debounced: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	/// The requests this dispatcher can issue.
	pub fn table(&self) -> &RequestTable {
		&self.table
	}

	/// Sends `kind` for `view`. The response is delivered later on the host's timer queue.
	///
	/// With `options.wait`, the request is held back for that long and dropped if an identical
	/// call arrives in the meantime.
	pub fn run(&self, kind: RequestKind, view: &SharedView, cursor: Cursor, options: RequestOptions) -> Result<(), RequestError> {
		match options.wait.filter(|ms| *ms > 0) {
			Some(ms) => {
				self.debounce(kind, view.clone(), cursor, options, Duration::from_millis(ms));
				Ok(())
			}
			None => self.send(kind, view, cursor, options),
		}
	}

	/// Sends `kind` for `view`, waits for the response and delivers it.
	///
	/// Returns the delivered value, or `None` for an empty response.
	pub async fn run_sync(
		&self,
		kind: RequestKind,
		view: &SharedView,
		cursor: Cursor,
		options: RequestOptions,
	) -> Result<Option<JsonValue>, RequestError> {
		let (session, params) = self.prepare(kind, view, cursor, &options)?;
		let response = session.execute_request(kind.method(), params).await?;
		Ok(self.deliver(kind, view, response, &options))
	}

	fn send(&self, kind: RequestKind, view: &SharedView, cursor: Cursor, options: RequestOptions) -> Result<(), RequestError> {
		let (session, params) = self.prepare(kind, view, cursor, &options)?;
		let dispatcher = self.clone();
		let view = view.clone();
		session.send_request(
			kind.method(),
			params,
			move |response| {
				let editor = dispatcher.manager.editor().clone();
				editor.set_timeout_async(
					Box::new(move || {
						dispatcher.deliver(kind, &view, response, &options);
					}),
					Duration::ZERO,
				);
			},
			move |e| debug!(method = kind.method(), error = %e, "request failed"),
		)?;
		Ok(())
	}

	fn prepare(
		&self,
		kind: RequestKind,
		view: &SharedView,
		cursor: Cursor,
		options: &RequestOptions,
	) -> Result<(Arc<Session>, JsonValue), RequestError> {
		let Some(path) = view.file_name() else {
			return Err(RequestError::MissingFileName { view_id: view.id() });
		};
		let row = self.table.get(kind);
		let session = row.and_then(|row| self.manager.session_for_view(&**view, row.capability));
		let (Some(row), Some(session)) = (row, session) else {
			debug!(method = kind.method(), view = view.id(), "no session for request");
			self.manager.editor().error_message("Not available!");
			return Err(RequestError::NotAvailable);
		};

		self.manager.documents().purge_changes(view);
		let diagnostics = self
			.manager
			.diagnostics()
			.at_position(&path, cursor.position)
			.shift_remove(&session.config().name)
			.unwrap_or_default();
		let input = RequestInput {
			view: &**view,
			cursor,
			options,
			diagnostics,
		};
		let params = (row.params)(&input).inspect_err(|e| {
			if let RequestError::MissingOption(name) = e {
				error!(method = kind.method(), option = name, "request needs an option");
			}
		})?;
		Ok((session, params))
	}

	fn debounce(&self, kind: RequestKind, view: SharedView, cursor: Cursor, options: RequestOptions, delay: Duration) {
		let key = format!("{}:{}", kind.method(), serde_json::to_string(&options).unwrap_or_default());
		let generation = {
			let mut calls = self.debounced.lock();
			let generation = calls.entry(key.clone()).or_default();
			*generation += 1;
			*generation
		};

		let dispatcher = self.clone();
		self.manager.editor().set_timeout_async(
			Box::new(move || {
				{
					let mut calls = dispatcher.debounced.lock();
					if calls.get(&key) != Some(&generation) {
						return;
					}
					calls.remove(&key);
				}
				if let Err(e) = dispatcher.send(kind, &view, cursor, options) {
					debug!(method = kind.method(), error = %e, "debounced request not sent");
				}
			}),
			delay,
		);
	}

	fn deliver(&self, kind: RequestKind, view: &SharedView, response: JsonValue, options: &RequestOptions) -> Option<JsonValue> {
		if is_empty(&response) {
			return None;
		}
		let response = match self.table.get(kind).and_then(|row| row.process) {
			Some(process) if options.process_response => process(response, options),
			_ => response,
		};

		if let Some(target) = &options.target {
			self.sink.set_var(target, response.clone());
		}
		if let Some(callback) = &options.callback {
			self.sink.call(callback, options.include_results.then(|| response.clone()));
		}
		if options.target.is_none() && options.callback.is_none() {
			self.sink.present(kind, view, &response);
		}
		Some(response)
	}
}

fn is_empty(response: &JsonValue) -> bool {
	match response {
		JsonValue::Null | JsonValue::Bool(false) => true,
		JsonValue::String(s) => s.is_empty(),
		JsonValue::Array(items) => items.is_empty(),
		JsonValue::Object(map) => map.is_empty(),
		JsonValue::Number(_) | JsonValue::Bool(true) => false,
	}
}
