//! Mirrors open buffers to every session that handles them.
//!
//! The tracker owns the set of documents the servers have been told about. A document enters
//! the set on `didOpen` and leaves it on `didClose`; sessions attached later receive a catch-up
//! `didOpen` for every document they handle. Edits are coalesced per buffer and flushed after
//! the debounce window, diffed against the last content sent for that path.

mod params;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lsp_types::notification::{
	DidChangeTextDocument, DidCloseTextDocument, DidOpenTextDocument, DidSaveTextDocument, Notification, WillSaveTextDocument,
};
use lsp_types::{TextDocumentSaveReason, TextDocumentSyncKind};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::Result;
use crate::config::WindowConfigs;
use crate::diff::{content_changes, full_change};
use crate::editor::{BufferId, Editor, SharedView, Window};
use crate::session::Session;
use crate::settings::Settings;

/// Receives document lifecycle events, e.g. to refresh diagnostics.
pub trait DocumentObserver: Send + Sync {
	/// A view's document was opened with at least one server.
	fn on_attach(&self, _view: &SharedView) {}

	/// A view's document was closed.
	fn on_detach(&self, _view: &SharedView) {}

	/// Pending edits of a view were flushed.
	fn on_changed(&self, _view: &SharedView) {}

	/// A view was saved.
	fn on_saved(&self, _view: &SharedView) {}
}

struct PendingChange {
	view: SharedView,
	version: i32,
}

#[derive(Default)]
struct TrackerState {
	open: HashSet<PathBuf>,
	snapshots: HashMap<PathBuf, String>,
	pending: HashMap<BufferId, PendingChange>,
	sessions: Vec<Arc<Session>>,
}

impl TrackerState {
	fn applicable_sessions(&self, language_id: Option<&str>, path: &Path) -> Vec<Arc<Session>> {
		let Some(language_id) = language_id else {
			return Vec::new();
		};
		self.sessions
			.iter()
			.filter(|session| session.config().supports_language(language_id) && session.handles_path(path))
			.cloned()
			.collect()
	}
}

/// Synchronizes document contents for one window.
pub struct DocumentTracker {
	editor: Arc<dyn Editor>,
	window: Arc<dyn Window>,
	configs: Arc<WindowConfigs>,
	debounce: Duration,
	state: Mutex<TrackerState>,
	observers: RwLock<Vec<Arc<dyn DocumentObserver>>>,
	weak_self: Weak<Self>,
}

impl DocumentTracker {
	/// Creates a tracker for `window`, with the debounce window from `settings`.
	pub fn new(editor: Arc<dyn Editor>, window: Arc<dyn Window>, configs: Arc<WindowConfigs>, settings: &Settings) -> Arc<Self> {
		Arc::new_cyclic(|weak_self| Self {
			editor,
			window,
			configs,
			debounce: settings.change_debounce,
			state: Mutex::new(TrackerState::default()),
			observers: RwLock::new(Vec::new()),
			weak_self: weak_self.clone(),
		})
	}

	/// Registers an observer for document events.
	pub fn add_observer(&self, observer: Arc<dyn DocumentObserver>) {
		self.observers.write().push(observer);
	}

	fn notify_observers(&self, f: impl Fn(&dyn DocumentObserver)) {
		let observers = self.observers.read().clone();
		for observer in observers {
			f(&*observer);
		}
	}

	/// Attaches a ready session and opens every tracked document it handles.
	///
	/// Pending edits are flushed first so the catch-up `didOpen` carries current content.
	pub fn add_session(&self, session: Arc<Session>) {
		self.purge_all();
		let documents: Vec<(PathBuf, String)> = {
			let mut state = self.state.lock();
			if state.sessions.iter().any(|s| s.id() == session.id()) {
				return;
			}
			state.sessions.push(session.clone());
			state
				.open
				.iter()
				.filter(|path| session.handles_path(path))
				.map(|path| (path.clone(), state.snapshots.get(path).cloned().unwrap_or_default()))
				.collect()
		};
		debug!(config = %session.config().name, session = %session.id(), documents = documents.len(), "session attached");

		for (path, text) in documents {
			let Some(view) = self.window.find_open_file(&path) else {
				continue;
			};
			let Some(language_id) = view.language_id().filter(|id| session.config().supports_language(id)) else {
				continue;
			};
			self.notify_observers(|o| o.on_attach(&view));
			if session.should_notify_did_open() {
				deliver::<DidOpenTextDocument>(&session, params::did_open(&*view, &language_id, text));
			}
		}
	}

	/// Detaches `session`. Other sessions of the same config are unaffected.
	pub fn remove_session(&self, session: &Session) {
		self.state.lock().sessions.retain(|s| s.id() != session.id());
	}

	/// Forgets all open documents, snapshots and pending edits.
	pub fn reset(&self) {
		let mut state = self.state.lock();
		state.open.clear();
		state.snapshots.clear();
		state.pending.clear();
	}

	/// Returns true if `path` has been opened with the servers.
	pub fn has_document_state(&self, path: &Path) -> bool {
		self.state.lock().open.contains(path)
	}

	/// Opens the view's document if an enabled config handles its language.
	///
	/// The document is tracked even when no session is attached yet; sessions attached later
	/// catch up.
	pub fn handle_did_open(&self, view: &SharedView) {
		let Some(path) = view.file_name() else {
			return;
		};
		let Some(language_id) = view.language_id() else {
			return;
		};
		if self.configs.syntax_config_languages(&**view).is_empty() {
			return;
		}
		let text = view.entire_content();
		let sessions = {
			let mut state = self.state.lock();
			if !state.open.insert(path.clone()) {
				return;
			}
			state.snapshots.insert(path.clone(), text.clone());
			state.applicable_sessions(Some(&language_id), &path)
		};
		debug!(path = %path.display(), sessions = sessions.len(), "document opened");

		self.notify_observers(|o| o.on_attach(view));
		for session in sessions.iter().filter(|s| s.should_notify_did_open()) {
			deliver::<DidOpenTextDocument>(session, params::did_open(&**view, &language_id, text.clone()));
		}
	}

	/// Records an edit. The change is sent once the buffer has been quiet for the debounce window.
	pub fn handle_did_change(&self, view: &SharedView) {
		let buffer = view.buffer_id();
		let version = view.change_count();
		self.state.lock().pending.insert(
			buffer,
			PendingChange {
				view: view.clone(),
				version,
			},
		);

		let tracker = self.weak_self.clone();
		self.editor.set_timeout_async(
			Box::new(move || {
				if let Some(tracker) = tracker.upgrade() {
					tracker.purge_did_change(buffer, Some(version));
				}
			}),
			self.debounce,
		);
	}

	/// Sends the view's pending edits now.
	pub fn purge_changes(&self, view: &SharedView) {
		self.purge_did_change(view.buffer_id(), None);
	}

	fn purge_all(&self) {
		let buffers: Vec<BufferId> = self.state.lock().pending.keys().copied().collect();
		for buffer in buffers {
			self.purge_did_change(buffer, None);
		}
	}

	/// Flushes the pending change of `buffer`. With `version` set, only if no newer edit arrived.
	fn purge_did_change(&self, buffer: BufferId, version: Option<i32>) {
		let pending = {
			let mut state = self.state.lock();
			match state.pending.get(&buffer) {
				Some(pending) if version.is_none_or(|v| v == pending.version) => state.pending.remove(&buffer),
				Some(_) => {
					trace!(buffer, ?version, "discarding stale change timer");
					return;
				}
				None => return,
			}
		};
		if let Some(pending) = pending {
			self.notify_did_change(&pending.view);
		}
	}

	fn notify_did_change(&self, view: &SharedView) {
		if !view.is_valid() {
			return;
		}
		if self.configs.syntax_config_languages(&**view).is_empty() {
			return;
		}
		let Some(path) = view.file_name() else {
			return;
		};
		if !self.has_document_state(&path) {
			self.handle_did_open(view);
		}

		let content = view.entire_content();
		let language_id = view.language_id();
		let (previous, sessions) = {
			let mut state = self.state.lock();
			if !state.open.contains(&path) {
				return;
			}
			let previous = state.snapshots.insert(path.clone(), content.clone()).unwrap_or_default();
			(previous, state.applicable_sessions(language_id.as_deref(), &path))
		};

		let mut incremental = None;
		for session in sessions.iter().filter(|s| s.should_notify_did_change()) {
			let changes = if session.text_sync_kind() == TextDocumentSyncKind::INCREMENTAL {
				incremental.get_or_insert_with(|| content_changes(&previous, &content)).clone()
			} else {
				vec![full_change(&content)]
			};
			if changes.is_empty() {
				continue;
			}
			deliver::<DidChangeTextDocument>(session, params::did_change(&**view, changes));
		}
		self.notify_observers(|o| o.on_changed(view));
	}

	/// Sends `willSave` to the sessions that want it.
	pub fn handle_will_save(&self, view: &SharedView, reason: TextDocumentSaveReason) {
		for session in self.tracked_sessions(view).iter().filter(|s| s.should_notify_will_save()) {
			deliver::<WillSaveTextDocument>(session, params::will_save(&**view, reason));
		}
	}

	/// Flushes pending edits, then sends `didSave`.
	pub fn handle_did_save(&self, view: &SharedView) {
		let Some(path) = view.file_name() else {
			return;
		};
		if !self.has_document_state(&path) {
			debug!(path = %path.display(), "saved document is not tracked");
			return;
		}
		self.purge_changes(view);
		for session in self.tracked_sessions(view) {
			let (send, include_text) = session.should_notify_did_save();
			if send {
				deliver::<DidSaveTextDocument>(&session, params::did_save(&**view, include_text));
			}
		}
		self.notify_observers(|o| o.on_saved(view));
	}

	/// Closes the view's document. Closing an untracked document does nothing.
	pub fn handle_did_close(&self, view: &SharedView) {
		let Some(path) = view.file_name() else {
			return;
		};
		let sessions = {
			let mut state = self.state.lock();
			if !state.open.remove(&path) {
				return;
			}
			state.snapshots.remove(&path);
			state.pending.remove(&view.buffer_id());
			state.applicable_sessions(view.language_id().as_deref(), &path)
		};
		debug!(path = %path.display(), "document closed");

		self.notify_observers(|o| o.on_detach(view));
		for session in sessions.iter().filter(|s| s.should_notify_did_close()) {
			deliver::<DidCloseTextDocument>(session, params::did_close(&**view));
		}
	}

	fn tracked_sessions(&self, view: &SharedView) -> Vec<Arc<Session>> {
		let Some(path) = view.file_name() else {
			return Vec::new();
		};
		let language_id = view.language_id();
		let state = self.state.lock();
		if !state.open.contains(&path) {
			return Vec::new();
		}
		state.applicable_sessions(language_id.as_deref(), &path)
	}
}

fn deliver<N: Notification>(session: &Session, params: Result<N::Params>) {
	match params.and_then(|params| session.notify::<N>(params)) {
		Ok(()) => trace!(config = %session.config().name, method = N::METHOD, "document notification sent"),
		Err(e) => debug!(config = %session.config().name, method = N::METHOD, error = %e, "document notification not sent"),
	}
}
