//! One initialized connection to a language server.
//!
//! A [`Session`] binds a [`Client`] to a [`ClientConfig`] and a set of workspace folders and
//! walks it through the protocol lifecycle:
//!
//! ```text
//! Starting ──initialize ok──▶ Ready ──end()──▶ Stopping ──▶ Ended
//!     │                                                      ▲
//!     └──────────────initialize failed / connection lost─────┘
//! ```
//!
//! The owner observes the lifecycle through [`SessionHooks`]. `on_post_exit` runs exactly once
//! per session, whichever of `end()`, a failed handshake or a crash gets there first.

mod capabilities;

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use lsp_types::notification::Notification;
use lsp_types::{ClientInfo, InitializeParams, TextDocumentSyncKind};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info, warn};
use ulf_rpc::{Client, RequestId};

pub use self::capabilities::client_capabilities;
use crate::config::{ClientConfig, JsonMap};
use crate::settings::Settings;
use crate::workspace::WorkspaceFolder;
use crate::{Error, Result};

/// Process-unique session identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
	fn next() -> Self {
		static NEXT: AtomicU64 = AtomicU64::new(1);
		Self(NEXT.fetch_add(1, Ordering::Relaxed))
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{}", self.0)
	}
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
	/// `initialize` is in flight.
	Starting,
	/// Initialized; requests may be sent.
	Ready,
	/// `shutdown`/`exit` in progress.
	Stopping,
	/// The connection is gone.
	Ended,
}

/// Lifecycle callbacks of a session.
pub trait SessionHooks: Send + Sync {
	/// Runs before `initialize` is sent. Handlers registered here see all server traffic.
	fn on_pre_initialize(&self, session: &Arc<Session>);

	/// Runs once the session is [`ClientState::Ready`].
	fn on_post_initialize(&self, session: &Arc<Session>);

	/// Runs when the server rejected or did not answer `initialize`.
	fn on_initialize_failed(&self, session: &Arc<Session>, error: &Error) {
		let _ = (session, error);
	}

	/// Runs exactly once, after the session reached [`ClientState::Ended`].
	fn on_post_exit(&self, session: &Arc<Session>);
}

/// A language server connection for one config and one set of workspace folders.
pub struct Session {
	id: SessionId,
	config: Arc<ClientConfig>,
	client: Client,
	workspace_folders: RwLock<Vec<WorkspaceFolder>>,
	state: Mutex<ClientState>,
	capabilities: OnceLock<JsonMap>,
	hooks: Arc<dyn SessionHooks>,
	request_timeout: Option<Duration>,
	enable_snippets: bool,
	exited: AtomicBool,
}

impl fmt::Debug for Session {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Session")
			.field("id", &self.id)
			.field("config", &self.config.name)
			.field("state", &self.state())
			.finish_non_exhaustive()
	}
}

impl Session {
	/// Wraps a connected client and starts the `initialize` handshake in the background.
	///
	/// Must be called from within a tokio runtime.
	pub fn start(
		client: Client,
		config: Arc<ClientConfig>,
		workspace_folders: Vec<WorkspaceFolder>,
		hooks: Arc<dyn SessionHooks>,
		settings: &Settings,
	) -> Arc<Self> {
		let session = Arc::new(Self {
			id: SessionId::next(),
			config,
			client,
			workspace_folders: RwLock::new(workspace_folders),
			state: Mutex::new(ClientState::Starting),
			capabilities: OnceLock::new(),
			hooks,
			request_timeout: settings.request_timeout,
			enable_snippets: settings.complete_snippets,
			exited: AtomicBool::new(false),
		});
		debug!(config = %session.config.name, session = %session.id, "starting session");

		session.register_workspace_handlers();
		session.hooks.on_pre_initialize(&session);

		let monitor = session.clone();
		tokio::spawn(async move {
			monitor.client.closed().await;
			// The initialize task reports a connection lost while starting.
			if monitor.state() != ClientState::Starting {
				monitor.finish();
			}
		});
		tokio::spawn(session.clone().initialize());
		session
	}

	/// Unique id of this session.
	pub fn id(&self) -> SessionId {
		self.id
	}

	/// The config this session was started from.
	pub fn config(&self) -> &Arc<ClientConfig> {
		&self.config
	}

	/// The underlying connection.
	pub fn client(&self) -> &Client {
		&self.client
	}

	/// Current lifecycle state.
	pub fn state(&self) -> ClientState {
		*self.state.lock()
	}

	/// Returns true once initialized and not yet ending.
	pub fn is_ready(&self) -> bool {
		self.state() == ClientState::Ready
	}

	/// The session's folders, most specific first.
	pub fn workspace_folders(&self) -> Vec<WorkspaceFolder> {
		self.workspace_folders.read().clone()
	}

	/// Server capabilities from the `initialize` response.
	pub fn capabilities(&self) -> Option<&JsonMap> {
		self.capabilities.get()
	}

	/// Looks up a capability by simple or dotted name, e.g. `renameProvider.prepareProvider`.
	///
	/// `false` and `null` count as absent.
	pub fn get_capability(&self, name: &str) -> Option<&JsonValue> {
		let mut parts = name.split('.');
		let mut value = self.capabilities()?.get(parts.next()?)?;
		for part in parts {
			value = value.as_object()?.get(part)?;
		}
		match value {
			JsonValue::Null | JsonValue::Bool(false) => None,
			value => Some(value),
		}
	}

	/// Returns true if the server advertises `name`.
	pub fn has_capability(&self, name: &str) -> bool {
		self.get_capability(name).is_some()
	}

	/// Returns true if `path` lies in one of the session's folders, or the session has none.
	pub fn handles_path(&self, path: &Path) -> bool {
		let folders = self.workspace_folders.read();
		folders.is_empty() || folders.iter().any(|folder| folder.includes_path(path))
	}

	/// How the server wants document changes.
	pub fn text_sync_kind(&self) -> TextDocumentSyncKind {
		let kind = match self.get_capability("textDocumentSync") {
			Some(JsonValue::Object(options)) => options.get("change").and_then(JsonValue::as_i64),
			Some(value) => value.as_i64(),
			None => None,
		};
		match kind {
			Some(1) => TextDocumentSyncKind::FULL,
			Some(2) => TextDocumentSyncKind::INCREMENTAL,
			_ => TextDocumentSyncKind::NONE,
		}
	}

	/// Whether the server wants `didOpen`.
	pub fn should_notify_did_open(&self) -> bool {
		self.open_close_interest()
	}

	/// Whether the server wants `didClose`.
	pub fn should_notify_did_close(&self) -> bool {
		self.open_close_interest()
	}

	/// Whether the server wants `didChange`.
	pub fn should_notify_did_change(&self) -> bool {
		self.text_sync_kind() != TextDocumentSyncKind::NONE
	}

	/// Whether the server wants `willSave`.
	pub fn should_notify_will_save(&self) -> bool {
		self.get_capability("textDocumentSync.willSave").is_some()
	}

	/// Whether the server wants `didSave`, and whether it wants the text with it.
	pub fn should_notify_did_save(&self) -> (bool, bool) {
		match self.get_capability("textDocumentSync.save") {
			Some(JsonValue::Object(options)) => (true, options.get("includeText").and_then(JsonValue::as_bool).unwrap_or(false)),
			Some(JsonValue::Bool(send)) => (*send, false),
			_ => (false, false),
		}
	}

	fn open_close_interest(&self) -> bool {
		match self.get_capability("textDocumentSync") {
			Some(JsonValue::Object(options)) => options.get("openClose").and_then(JsonValue::as_bool).unwrap_or(false),
			Some(value) => value.as_i64().is_some_and(|kind| kind > 0),
			None => false,
		}
	}

	/// Sends a capability request. Fails with [`Error::NotReady`] unless the session is ready.
	pub fn send_request(
		&self,
		method: &str,
		params: JsonValue,
		on_success: impl FnOnce(JsonValue) + Send + 'static,
		on_error: impl FnOnce(ulf_rpc::Error) + Send + 'static,
	) -> Result<()> {
		self.ensure_ready()?;
		self.client.send_request(method, params, on_success, on_error);
		Ok(())
	}

	/// Sends a capability request and waits for the answer, up to the configured timeout.
	pub async fn execute_request(&self, method: &str, params: JsonValue) -> Result<JsonValue> {
		self.ensure_ready()?;
		Ok(self.client.execute_request(method, params, self.request_timeout).await?)
	}

	/// Sends a notification.
	pub fn send_notification(&self, method: &str, params: JsonValue) -> Result<()> {
		Ok(self.client.send_notification(method, params)?)
	}

	/// Sends a typed notification.
	pub fn notify<N: Notification>(&self, params: N::Params) -> Result<()> {
		let params = serde_json::to_value(params).map_err(ulf_rpc::Error::from)?;
		self.send_notification(N::METHOD, params)
	}

	/// Answers a server-initiated request.
	pub fn send_response(&self, id: RequestId, result: JsonValue) -> Result<()> {
		Ok(self.client.send_response(id, result)?)
	}

	/// Registers a handler for a server-initiated request.
	pub fn on_request(&self, method: &str, handler: impl Fn(JsonValue, RequestId) + Send + Sync + 'static) {
		self.client.on_request(method, handler);
	}

	/// Registers a handler for a server notification.
	pub fn on_notification(&self, method: &str, handler: impl Fn(JsonValue) + Send + Sync + 'static) {
		self.client.on_notification(method, handler);
	}

	/// Registers a handler for a typed server notification. Malformed params are logged and dropped.
	pub fn on_typed_notification<N: Notification>(&self, handler: impl Fn(N::Params) + Send + Sync + 'static) {
		let config = self.config.name.clone();
		self.client.on_notification(N::METHOD, move |params| match serde_json::from_value(params) {
			Ok(params) => handler(params),
			Err(e) => warn!(config = %config, method = N::METHOD, error = %e, "malformed notification"),
		});
	}

	fn ensure_ready(&self) -> Result<()> {
		if self.is_ready() {
			Ok(())
		} else {
			Err(Error::NotReady(self.config.name.clone()))
		}
	}

	/// Sends `initialized`, then pushes the config's settings if there are any.
	pub fn notify_initialized(&self) {
		if let Err(e) = self.client.send_notification("initialized", json!({})) {
			warn!(config = %self.config.name, error = %e, "failed to send initialized");
			return;
		}
		if !self.config.settings.is_empty() {
			let params = json!({"settings": self.config.settings});
			if let Err(e) = self.client.send_notification("workspace/didChangeConfiguration", params) {
				warn!(config = %self.config.name, error = %e, "failed to push settings");
			}
		}
	}

	/// Replaces the session's folders, telling the server if it listens for folder changes.
	pub fn update_folders(&self, folders: Vec<WorkspaceFolder>) {
		let (added, removed) = {
			let mut current = self.workspace_folders.write();
			let added: Vec<_> = folders.iter().filter(|f| !current.contains(f)).filter_map(WorkspaceFolder::to_lsp).collect();
			let removed: Vec<_> = current.iter().filter(|f| !folders.contains(f)).filter_map(WorkspaceFolder::to_lsp).collect();
			*current = folders;
			(added, removed)
		};
		if added.is_empty() && removed.is_empty() {
			return;
		}
		if self.has_capability("workspace.workspaceFolders.changeNotifications") {
			let params = json!({"event": {"added": added, "removed": removed}});
			if let Err(e) = self.client.send_notification("workspace/didChangeWorkspaceFolders", params) {
				debug!(config = %self.config.name, error = %e, "failed to send folder change");
			}
		}
	}

	/// Begins `shutdown`/`exit`. Returns false if the session is already ending.
	pub fn end(self: &Arc<Self>) -> bool {
		{
			let mut state = self.state.lock();
			match *state {
				ClientState::Stopping | ClientState::Ended => return false,
				_ => *state = ClientState::Stopping,
			}
		}
		info!(config = %self.config.name, session = %self.id, "ending session");
		tokio::spawn(self.clone().shutdown());
		true
	}

	async fn shutdown(self: Arc<Self>) {
		if self.client.is_alive() {
			match self.client.execute_request("shutdown", JsonValue::Null, self.request_timeout).await {
				Ok(_) => {
					let _ = self.client.send_notification("exit", JsonValue::Null);
				}
				Err(e) => debug!(config = %self.config.name, error = %e, "shutdown request failed"),
			}
		}
		self.client.close().await;
		self.finish();
	}

	#[allow(deprecated, reason = "root_uri is deprecated but still read by some servers")]
	fn initialize_params(&self) -> InitializeParams {
		let folders = self.workspace_folders.read();
		InitializeParams {
			process_id: Some(std::process::id()),
			root_uri: folders.first().and_then(|folder| folder.to_lsp()).map(|folder| folder.uri),
			initialization_options: (!self.config.init_options.is_null()).then(|| self.config.init_options.clone()),
			capabilities: client_capabilities(self.enable_snippets, self.config.experimental_capabilities.clone()),
			workspace_folders: Some(folders.iter().filter_map(WorkspaceFolder::to_lsp).collect()),
			client_info: Some(ClientInfo {
				name: String::from("ulf"),
				version: Some(String::from(env!("CARGO_PKG_VERSION"))),
			}),
			..Default::default()
		}
	}

	async fn initialize(self: Arc<Self>) {
		let params = match serde_json::to_value(self.initialize_params()) {
			Ok(params) => params,
			Err(e) => {
				self.fail_initialize(Error::Rpc(e.into())).await;
				return;
			}
		};

		match self.client.execute_request("initialize", params, None).await {
			Ok(result) => {
				let capabilities = match result.get("capabilities") {
					Some(JsonValue::Object(caps)) => caps.clone(),
					_ => JsonMap::new(),
				};
				let _ = self.capabilities.set(capabilities);
				{
					let mut state = self.state.lock();
					let current = *state;
					if current != ClientState::Starting {
						debug!(config = %self.config.name, state = ?current, "session ended during initialize");
						return;
					}
					*state = ClientState::Ready;
				}
				if !self.client.is_alive() {
					debug!(config = %self.config.name, "connection lost right after initialize");
					self.finish();
					return;
				}
				info!(config = %self.config.name, session = %self.id, "session initialized");
				self.hooks.on_post_initialize(&self);
			}
			Err(e) => self.fail_initialize(e.into()).await,
		}
	}

	async fn fail_initialize(self: &Arc<Self>, error: Error) {
		if self.state() != ClientState::Starting {
			return;
		}
		warn!(config = %self.config.name, error = %error, "initialize failed");
		self.hooks.on_initialize_failed(self, &error);
		self.client.close().await;
		self.finish();
	}

	fn finish(self: &Arc<Self>) {
		if self.exited.swap(true, Ordering::AcqRel) {
			return;
		}
		*self.state.lock() = ClientState::Ended;
		debug!(config = %self.config.name, session = %self.id, "session ended");
		self.hooks.on_post_exit(self);
	}

	fn register_workspace_handlers(self: &Arc<Self>) {
		let weak = Arc::downgrade(self);
		self.client.on_request("workspace/configuration", move |params, id| {
			with_session(&weak, |session| {
				let items = params.get("items").and_then(JsonValue::as_array).map(Vec::as_slice).unwrap_or_default();
				let result: Vec<_> = items
					.iter()
					.map(|item| configuration_section(&session.config.settings, item.get("section").and_then(JsonValue::as_str)))
					.collect();
				let _ = session.client.send_response(id, JsonValue::Array(result));
			});
		});

		let weak = Arc::downgrade(self);
		self.client.on_request("workspace/workspaceFolders", move |_, id| {
			with_session(&weak, |session| {
				let folders: Vec<_> = session.workspace_folders().iter().filter_map(WorkspaceFolder::to_lsp).collect();
				let _ = session.client.send_response(id, json!(folders));
			});
		});
	}
}

fn with_session(weak: &Weak<Session>, f: impl FnOnce(&Arc<Session>)) {
	if let Some(session) = weak.upgrade() {
		f(&session);
	}
}

/// The part of `settings` a `workspace/configuration` item asks for.
fn configuration_section(settings: &JsonMap, section: Option<&str>) -> JsonValue {
	let Some(section) = section.filter(|s| !s.is_empty()) else {
		return JsonValue::Object(settings.clone());
	};
	let mut parts = section.split('.');
	let Some(mut value) = parts.next().and_then(|first| settings.get(first)) else {
		return JsonValue::Null;
	};
	for part in parts {
		match value.get(part) {
			Some(next) => value = next,
			None => return JsonValue::Null,
		}
	}
	value.clone()
}
