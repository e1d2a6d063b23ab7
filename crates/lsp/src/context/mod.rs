//! Per-window orchestration of language server sessions.
//!
//! The [`ContextManager`] is the only place sessions are started or ended. For every view
//! that becomes active it works out which configs must be running for the file, starts the
//! missing ones under an initialization lock, and wires each new session to the document
//! tracker, the diagnostics store and the editor.
//!
//! Failures follow two paths. A server that cannot be started or initialized is reported
//! once and disabled for the rest of the window's lifetime. A server that crashes after
//! starting prompts for a restart, which ends every session of the window and reopens the
//! active views once all of them are gone.

mod edit;
mod message_request;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use indexmap::IndexMap;
use lsp_types::notification::{LogMessage, ShowMessage};
use lsp_types::{MessageType, WorkspaceEdit};
use parking_lot::Mutex;
use serde_json::{Value as JsonValue, json};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use ulf_rpc::{RequestId, StderrSink};

use crate::Error;
use crate::config::{ClientConfig, WindowConfigs};
use crate::diagnostics::{DiagnosticsPresenter, DiagnosticsStore};
use crate::documents::DocumentTracker;
use crate::editor::{Editor, SharedView, View, Window};
use crate::session::{ClientState, Session, SessionHooks, SessionId};
use crate::settings::Settings;
use crate::starter::{SessionStarter, StartRequest};
use crate::workspace::{FolderChange, ProjectFolders, WorkspaceFolder, sorted_workspace_folders};

/// Delay between enabling a config and reopening the window's views.
const ENABLE_START_DELAY: Duration = Duration::from_millis(500);
/// Delay before re-checking whether the window closed after its last view did.
const WINDOW_CLOSED_RECHECK: Duration = Duration::from_millis(100);
/// Host command that applies a flattened workspace edit.
const APPLY_EDIT_COMMAND: &str = "lsp_apply_workspace_edit";

/// Host-side reactions to session lifecycle, keyed by config name.
pub trait LanguageHandlerListener: Send + Sync {
	/// Consulted before a session for `config` starts. Returning false skips the start.
	fn on_start(&self, _config: &str, _window: &dyn Window) -> bool {
		true
	}

	/// A session for `config` finished initializing.
	fn on_initialized(&self, _config: &str, _window: &dyn Window, _session: &Arc<Session>) {}

	/// A session for `config` ended.
	fn on_exited(&self, _config: &str, _window: &dyn Window) {}
}

struct NoListener;

impl LanguageHandlerListener for NoListener {}

type ClosedCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct ContextState {
	sessions: IndexMap<String, Vec<Arc<Session>>>,
	/// Sessions asked to end whose `on_post_exit` has not run yet.
	exiting: HashSet<SessionId>,
	open_after_initialize: Vec<SharedView>,
	restarting: bool,
	is_closing: bool,
}

impl ContextState {
	fn find_session(&self, config: &str, path: &Path) -> Option<&Arc<Session>> {
		self.sessions.get(config)?.iter().find(|session| session.handles_path(path))
	}

	fn all_ended(&self) -> bool {
		self.sessions.is_empty() && self.exiting.is_empty()
	}
}

/// Assembles a [`ContextManager`].
pub struct ContextBuilder {
	window: Arc<dyn Window>,
	editor: Arc<dyn Editor>,
	starter: Arc<dyn SessionStarter>,
	configs: Arc<WindowConfigs>,
	settings: Settings,
	listener: Arc<dyn LanguageHandlerListener>,
	presenter: Option<Arc<dyn DiagnosticsPresenter>>,
	on_closed: Option<ClosedCallback>,
}

impl ContextBuilder {
	/// Overrides the default [`Settings`].
	pub fn settings(mut self, settings: Settings) -> Self {
		self.settings = settings;
		self
	}

	/// Sets the listener consulted on session start and notified on initialize and exit.
	pub fn listener(mut self, listener: Arc<dyn LanguageHandlerListener>) -> Self {
		self.listener = listener;
		self
	}

	/// Sets where diagnostics are shown.
	pub fn presenter(mut self, presenter: Arc<dyn DiagnosticsPresenter>) -> Self {
		self.presenter = Some(presenter);
		self
	}

	/// Runs `callback` once the window has closed and all of its sessions have ended.
	pub fn on_closed(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
		self.on_closed = Some(Box::new(callback));
		self
	}

	/// Builds the manager. Must be called from within a tokio runtime.
	pub fn build(self) -> Arc<ContextManager> {
		let documents = DocumentTracker::new(self.editor.clone(), self.window.clone(), self.configs.clone(), &self.settings);
		let diagnostics = Arc::new(match self.presenter {
			Some(presenter) => DiagnosticsStore::new(presenter),
			None => DiagnosticsStore::headless(),
		});
		let workspace = ProjectFolders::new(self.window.clone());
		Arc::new_cyclic(|weak_self| ContextManager {
			window: self.window,
			editor: self.editor,
			starter: self.starter,
			configs: self.configs,
			settings: self.settings,
			listener: self.listener,
			documents,
			diagnostics,
			workspace,
			state: Mutex::new(ContextState::default()),
			init_lock: tokio::sync::Mutex::new(()),
			on_closed: Mutex::new(self.on_closed),
			runtime: Handle::current(),
			weak_self: weak_self.clone(),
		})
	}
}

/// Starts, tracks and ends the sessions of one editor window.
pub struct ContextManager {
	window: Arc<dyn Window>,
	editor: Arc<dyn Editor>,
	starter: Arc<dyn SessionStarter>,
	configs: Arc<WindowConfigs>,
	settings: Settings,
	listener: Arc<dyn LanguageHandlerListener>,
	documents: Arc<DocumentTracker>,
	diagnostics: Arc<DiagnosticsStore>,
	workspace: ProjectFolders,
	state: Mutex<ContextState>,
	/// Serializes deciding which configs to start with starting them.
	init_lock: tokio::sync::Mutex<()>,
	on_closed: Mutex<Option<ClosedCallback>>,
	runtime: Handle,
	weak_self: Weak<Self>,
}

impl ContextManager {
	/// Starts building a manager for `window`.
	pub fn builder(
		window: Arc<dyn Window>,
		editor: Arc<dyn Editor>,
		starter: Arc<dyn SessionStarter>,
		configs: Arc<WindowConfigs>,
	) -> ContextBuilder {
		ContextBuilder {
			window,
			editor,
			starter,
			configs,
			settings: Settings::default(),
			listener: Arc::new(NoListener),
			presenter: None,
			on_closed: None,
		}
	}

	/// The window this manager serves.
	pub fn window(&self) -> &Arc<dyn Window> {
		&self.window
	}

	/// Editor-wide services.
	pub fn editor(&self) -> &Arc<dyn Editor> {
		&self.editor
	}

	/// The window's configs.
	pub fn configs(&self) -> &Arc<WindowConfigs> {
		&self.configs
	}

	/// The window's document tracker.
	pub fn documents(&self) -> &Arc<DocumentTracker> {
		&self.documents
	}

	/// The window's diagnostics.
	pub fn diagnostics(&self) -> &Arc<DiagnosticsStore> {
		&self.diagnostics
	}

	/// The window's project folders.
	pub fn workspace(&self) -> &ProjectFolders {
		&self.workspace
	}

	/// Every live session, grouped by config in start order.
	pub fn sessions(&self) -> Vec<Arc<Session>> {
		self.state.lock().sessions.values().flatten().cloned().collect()
	}

	/// The session of `config` whose folders cover `path`.
	pub fn get_session(&self, config: &str, path: &Path) -> Option<Arc<Session>> {
		self.state.lock().find_session(config, path).cloned()
	}

	/// The first ready session for the view's language and file that has `capability`.
	pub fn session_for_view(&self, view: &dyn View, capability: Option<&str>) -> Option<Arc<Session>> {
		let path = view.file_name()?;
		let language_id = view.language_id()?;
		self.sessions().into_iter().find(|session| {
			session.is_ready()
				&& session.config().supports_language(&language_id)
				&& session.handles_path(&path)
				&& capability.is_none_or(|name| session.has_capability(name))
		})
	}

	/// The deepest project folder containing `path`.
	pub fn get_project_path(&self, path: &Path) -> Option<PathBuf> {
		self.workspace.project_path(path)
	}

	/// Re-resolves configs against the current project overrides.
	pub fn update_configs(&self) {
		self.configs.update();
	}

	/// Ensures the sessions a newly focused view needs are running.
	pub async fn activate_view(&self, view: &SharedView) {
		let Some(path) = view.file_name() else {
			return;
		};
		debug!(path = %path.display(), "activating view");
		if self.documents.has_document_state(&path) {
			return;
		}
		self.update_workspace();
		self.initialize_on_open(view).await;
	}

	/// Starts every enabled config the view's file needs and no session covers yet.
	///
	/// A view whose session is still initializing is queued and processed again once it is ready.
	pub async fn initialize_on_open(&self, view: &SharedView) {
		let Some(path) = view.file_name() else {
			return;
		};
		if !self.workspace.includes_path(&path) {
			debug!(path = %path.display(), "file outside the project");
			return;
		}

		let _guard = self.init_lock.lock().await;
		if self.state.lock().is_closing {
			return;
		}
		let needed = self.needed_configs(view, &path, self.configs.syntax_configs(&**view, true));
		if needed.is_empty() {
			return;
		}
		// Project overrides may have changed since the configs were last resolved.
		self.update_configs();
		let startable = self.needed_configs(view, &path, self.configs.syntax_configs(&**view, false));
		for config in startable {
			debug!(window = self.window.id(), config = %config.name, path = %path.display(), "starting config");
			self.start_client(config, &path).await;
		}
	}

	fn needed_configs(&self, view: &SharedView, path: &Path, configs: Vec<Arc<ClientConfig>>) -> Vec<Arc<ClientConfig>> {
		let mut state = self.state.lock();
		let mut needed = Vec::new();
		for config in configs {
			match state.find_session(&config.name, path) {
				None => needed.push(config),
				Some(session) if !session.is_ready() => {
					debug!(config = %config.name, path = %path.display(), "session not ready, opening later");
					if !state.open_after_initialize.iter().any(|queued| queued.id() == view.id()) {
						state.open_after_initialize.push(view.clone());
					}
				}
				Some(_) => {}
			}
		}
		needed
	}

	async fn start_client(&self, config: Arc<ClientConfig>, path: &Path) {
		let name = config.name.clone();
		if !self.listener.on_start(&name, &*self.window) {
			debug!(config = %name, "start vetoed by listener");
			return;
		}
		self.window.status_message(&format!("Starting {name}..."));

		let request = StartRequest {
			config,
			workspace_folders: sorted_workspace_folders(&self.workspace.folders(), path),
			hooks: Arc::new(ContextHooks {
				manager: self.weak_self.clone(),
			}),
			on_stderr: self.stderr_sink(&name),
		};
		match self.starter.start_session(request).await {
			Ok(session) => {
				let mut state = self.state.lock();
				// A session that died during startup has already run its exit hook.
				if session.state() != ClientState::Ended {
					debug!(window = self.window.id(), config = %name, session = %session.id(), "session added");
					state.sessions.entry(name).or_default().push(session);
				}
			}
			Err(e) => self.report_start_failure(&name, &e),
		}
	}

	fn report_start_failure(&self, name: &str, error: &Error) {
		error!(config = name, error = %error, "could not start server");
		self.configs.disable_temporarily(name);
		self.editor
			.message_dialog(&format!("Could not start {name}\n\n{error}\n\nServer will be disabled for this window"));
	}

	fn stderr_sink(&self, name: &str) -> Option<StderrSink> {
		if !self.settings.log_stderr {
			return None;
		}
		let name = name.to_string();
		Some(Arc::new(move |line: &str| debug!(target: "lsp", config = %name, "{line}")))
	}

	/// Re-reads the project folders and propagates the change to the sessions.
	fn update_workspace(&self) {
		match self.workspace.update() {
			FolderChange::Unchanged => {}
			FolderChange::Changed { .. } => {
				let folders: Vec<_> = self.workspace.folders().into_iter().map(WorkspaceFolder::from_path).collect();
				for session in self.sessions() {
					session.update_folders(folders.clone());
				}
			}
			FolderChange::Switched => {
				info!(window = self.window.id(), "project switched, ending all sessions");
				self.end_sessions();
			}
		}
	}

	/// Reopens every view of the window that shows a file.
	pub async fn start_active_views(&self) {
		let views: Vec<SharedView> = self.window.views().into_iter().filter(|view| view.file_name().is_some()).collect();
		debug!(window = self.window.id(), views = views.len(), "starting active views");
		for view in views {
			self.update_workspace();
			self.initialize_on_open(&view).await;
			self.documents.handle_did_open(&view);
		}
	}

	fn spawn_start_active_views(&self) {
		let Some(manager) = self.weak_self.upgrade() else {
			return;
		};
		self.runtime.spawn(async move { manager.start_active_views().await });
	}

	fn open_pending_views(&self) {
		let views = std::mem::take(&mut self.state.lock().open_after_initialize);
		let Some(manager) = self.weak_self.upgrade() else {
			return;
		};
		if views.is_empty() {
			return;
		}
		self.runtime.spawn(async move {
			for view in views {
				debug!(view = view.id(), "opening after initialize");
				manager.initialize_on_open(&view).await;
			}
		});
	}

	/// Enables `name` for the project and reopens the window's views shortly after.
	pub fn enable_config(&self, name: &str) {
		self.configs.enable_config(name);
		let manager = self.weak_self.clone();
		self.editor.set_timeout_async(
			Box::new(move || {
				if let Some(manager) = manager.upgrade() {
					manager.spawn_start_active_views();
				}
			}),
			ENABLE_START_DELAY,
		);
		self.window.status_message(&format!("{name} enabled, starting server..."));
	}

	/// Disables `name` for the project and ends its sessions.
	pub fn disable_config(&self, name: &str) {
		self.configs.disable_config(name);
		self.end_config_sessions(name);
	}

	/// Ends every session, then reopens the active views once all have ended.
	pub fn restart_sessions(&self) {
		info!(window = self.window.id(), "restarting sessions");
		self.state.lock().restarting = true;
		self.end_sessions();
		self.check_all_ended();
	}

	/// Ends every session of the window and forgets open documents.
	pub fn end_sessions(&self) {
		self.documents.reset();
		let names: Vec<String> = self.state.lock().sessions.keys().cloned().collect();
		for name in names {
			self.end_config_sessions(&name);
		}
	}

	/// Ends the sessions of one config.
	pub fn end_config_sessions(&self, name: &str) {
		let mut state = self.state.lock();
		let Some(sessions) = state.sessions.shift_remove(name) else {
			return;
		};
		for session in sessions {
			debug!(config = name, session = %session.id(), "unloading session");
			state.exiting.insert(session.id());
			if !session.end() {
				state.exiting.remove(&session.id());
			}
		}
	}

	/// Ends all sessions once the window is gone.
	///
	/// The window may only report itself invalid shortly after its last view closed, so a
	/// still-valid window is checked again after a short delay.
	pub fn handle_view_closed(&self, view: &SharedView) {
		if view.file_name().is_none() || self.state.lock().is_closing {
			return;
		}
		if !self.window.is_valid() {
			self.handle_window_closed();
			return;
		}
		let manager = self.weak_self.clone();
		self.editor.set_timeout_async(
			Box::new(move || {
				if let Some(manager) = manager.upgrade()
					&& !manager.window.is_valid()
				{
					manager.handle_window_closed();
				}
			}),
			WINDOW_CLOSED_RECHECK,
		);
	}

	fn handle_window_closed(&self) {
		{
			let mut state = self.state.lock();
			if state.is_closing {
				return;
			}
			state.is_closing = true;
		}
		info!(window = self.window.id(), "window closed, ending sessions");
		self.end_sessions();
		self.check_all_ended();
	}

	fn check_all_ended(&self) {
		let restarting = {
			let mut state = self.state.lock();
			if !state.all_ended() {
				return;
			}
			std::mem::take(&mut state.restarting)
		};
		debug!(window = self.window.id(), "all sessions ended");
		if restarting {
			self.spawn_start_active_views();
		} else if !self.window.is_valid() {
			let on_closed = self.on_closed.lock().take();
			if let Some(on_closed) = on_closed {
				on_closed();
			}
		}
	}

	fn handle_pre_initialize(&self, session: &Arc<Session>) {
		let name = session.config().name.clone();

		let (manager, crashed) = (self.weak_self.clone(), Arc::downgrade(session));
		session.client().set_crash_handler(move || {
			if let (Some(manager), Some(session)) = (manager.upgrade(), crashed.upgrade()) {
				manager.handle_server_crash(&session);
			}
		});

		let (manager, weak_session) = (self.weak_self.clone(), Arc::downgrade(session));
		session.on_request("window/showMessageRequest", move |params, id| {
			let Some(session) = weak_session.upgrade() else {
				return;
			};
			match manager.upgrade() {
				Some(manager) => message_request::show(&*manager.editor, &session, params, id),
				None => reply_null(&session, id),
			}
		});

		let manager = self.weak_self.clone();
		let source = name.clone();
		session.on_typed_notification::<ShowMessage>(move |params| {
			log_server_message(&source, params.typ, &params.message);
			if let Some(manager) = manager.upgrade() {
				manager.editor.status_message(&format!("{source}: {}", params.message));
			}
		});

		let source = name;
		session.on_typed_notification::<LogMessage>(move |params| log_server_message(&source, params.typ, &params.message));
	}

	fn handle_post_initialize(&self, session: &Arc<Session>) {
		let name = session.config().name.clone();

		let (manager, weak_session) = (self.weak_self.clone(), Arc::downgrade(session));
		session.on_request("workspace/applyEdit", move |params, id| {
			let Some(session) = weak_session.upgrade() else {
				return;
			};
			if let Some(manager) = manager.upgrade() {
				manager.apply_workspace_edit(&params);
			}
			// Whether the host managed to apply the edit is not reported back.
			if let Err(e) = session.send_response(id, json!({"applied": true})) {
				debug!(config = %session.config().name, error = %e, "applyEdit reply not sent");
			}
		});

		let (diagnostics, source) = (Arc::downgrade(&self.diagnostics), name.clone());
		session.on_notification("textDocument/publishDiagnostics", move |params| {
			if let Some(diagnostics) = diagnostics.upgrade() {
				diagnostics.receive(&source, params);
			}
		});

		self.listener.on_initialized(&name, &*self.window, session);
		session.notify_initialized();
		if session.has_capability("textDocumentSync") {
			self.documents.add_session(session.clone());
		}
		self.window.status_message(&format!("{name} initialized"));
		self.open_pending_views();
	}

	fn apply_workspace_edit(&self, params: &JsonValue) {
		let edit: WorkspaceEdit = match params.get("edit").cloned().map(serde_json::from_value).transpose() {
			Ok(edit) => edit.unwrap_or_default(),
			Err(e) => {
				warn!(error = %e, "malformed workspace edit");
				WorkspaceEdit::default()
			}
		};
		let changes = edit::workspace_edit_changes(&edit);
		self.window.run_command(APPLY_EDIT_COMMAND, json!({"changes": changes}));
	}

	fn handle_initialize_failed(&self, session: &Arc<Session>, error: &Error) {
		self.report_start_failure(&session.config().name, error);
	}

	fn handle_post_exit(&self, session: &Arc<Session>) {
		let name = &session.config().name;
		self.documents.remove_session(session);
		for view in self.window.views() {
			if let Some(path) = view.file_name() {
				self.diagnostics.remove(&path, name);
			}
		}
		self.listener.on_exited(name, &*self.window);

		{
			let mut state = self.state.lock();
			if let Some(sessions) = state.sessions.get_mut(name) {
				sessions.retain(|s| s.id() != session.id());
				if sessions.is_empty() {
					state.sessions.shift_remove(name);
				}
			}
			state.exiting.remove(&session.id());
		}
		debug!(config = %name, session = %session.id(), "session ended");
		self.check_all_ended();
	}

	fn handle_server_crash(&self, session: &Arc<Session>) {
		let name = session.config().name.clone();
		if session.state() == ClientState::Starting {
			debug!(config = %name, session = %session.id(), "connection lost during initialize");
			return;
		}
		warn!(config = %name, session = %session.id(), "server crashed");
		let manager = self.weak_self.clone();
		self.editor.ok_cancel_dialog(
			&format!("Language server {name} has crashed, do you want to restart it?"),
			"Restart",
			Box::new(move |restart| {
				let Some(manager) = manager.upgrade() else {
					return;
				};
				if restart {
					manager.restart_sessions();
				} else {
					manager.configs.disable_temporarily(&name);
				}
			}),
		);
	}
}

/// Routes a manager's hooks to it without keeping it alive.
struct ContextHooks {
	manager: Weak<ContextManager>,
}

impl SessionHooks for ContextHooks {
	fn on_pre_initialize(&self, session: &Arc<Session>) {
		if let Some(manager) = self.manager.upgrade() {
			manager.handle_pre_initialize(session);
		}
	}

	fn on_post_initialize(&self, session: &Arc<Session>) {
		if let Some(manager) = self.manager.upgrade() {
			manager.handle_post_initialize(session);
		}
	}

	fn on_initialize_failed(&self, session: &Arc<Session>, error: &Error) {
		if let Some(manager) = self.manager.upgrade() {
			manager.handle_initialize_failed(session, error);
		}
	}

	fn on_post_exit(&self, session: &Arc<Session>) {
		if let Some(manager) = self.manager.upgrade() {
			manager.handle_post_exit(session);
		}
	}
}

fn reply_null(session: &Session, id: RequestId) {
	if let Err(e) = session.send_response(id, JsonValue::Null) {
		debug!(config = %session.config().name, error = %e, "reply not sent");
	}
}

fn log_server_message(config: &str, typ: MessageType, message: &str) {
	match typ {
		MessageType::ERROR => error!(target: "lsp", config, message, "server message"),
		MessageType::WARNING => warn!(target: "lsp", config, message, "server message"),
		MessageType::INFO => info!(target: "lsp", config, message, "server message"),
		_ => debug!(target: "lsp", config, message, "server message"),
	}
}

#[cfg(test)]
mod tests;
