//! In-memory editor and language server doubles.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value as JsonValue, json};
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use ulf_rpc::{Client, ClientOptions, Message, codec};

use crate::editor::{BufferId, Deferred, Editor, SharedView, View, ViewId, Window, WindowId, spawn_timeout};
use crate::session::{Session, SessionHooks};
use crate::settings::Settings;
use crate::starter::{SessionStarter, StartRequest};
use crate::{Error, Result};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Polls `condition` until it holds, failing the test after a while.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
	for _ in 0..500 {
		if condition() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("condition never held");
}

pub struct FakeView {
	id: ViewId,
	buffer: BufferId,
	file: Option<PathBuf>,
	language: Option<String>,
	text: Mutex<(String, i32)>,
	valid: AtomicBool,
}

impl FakeView {
	pub fn new(id: ViewId, file: Option<&str>, language: Option<&str>, content: &str) -> Arc<Self> {
		Arc::new(Self {
			id,
			buffer: id,
			file: file.map(PathBuf::from),
			language: language.map(str::to_string),
			text: Mutex::new((content.to_string(), 1)),
			valid: AtomicBool::new(true),
		})
	}

	/// Replaces the buffer text and bumps the change count.
	pub fn edit(&self, content: &str) {
		let mut text = self.text.lock();
		text.0 = content.to_string();
		text.1 += 1;
	}

	pub fn close(&self) {
		self.valid.store(false, Ordering::SeqCst);
	}
}

impl View for FakeView {
	fn id(&self) -> ViewId {
		self.id
	}

	fn file_name(&self) -> Option<PathBuf> {
		self.file.clone()
	}

	fn buffer_id(&self) -> BufferId {
		self.buffer
	}

	fn language_id(&self) -> Option<String> {
		self.language.clone()
	}

	fn change_count(&self) -> i32 {
		self.text.lock().1
	}

	fn entire_content(&self) -> String {
		self.text.lock().0.clone()
	}

	fn tab_size(&self) -> u32 {
		4
	}

	fn translate_tabs_to_spaces(&self) -> bool {
		true
	}

	fn is_valid(&self) -> bool {
		self.valid.load(Ordering::SeqCst)
	}
}

pub struct FakeWindow {
	id: WindowId,
	valid: AtomicBool,
	folders: Mutex<Vec<PathBuf>>,
	views: Mutex<Vec<Arc<FakeView>>>,
	statuses: Mutex<Vec<String>>,
	commands: Mutex<Vec<(String, JsonValue)>>,
}

impl FakeWindow {
	pub fn new(id: WindowId, folders: &[&str]) -> Arc<Self> {
		Arc::new(Self {
			id,
			valid: AtomicBool::new(true),
			folders: Mutex::new(folders.iter().map(PathBuf::from).collect()),
			views: Mutex::new(Vec::new()),
			statuses: Mutex::new(Vec::new()),
			commands: Mutex::new(Vec::new()),
		})
	}

	pub fn set_folders(&self, folders: &[&str]) {
		*self.folders.lock() = folders.iter().map(PathBuf::from).collect();
	}

	pub fn add_view(&self, view: &Arc<FakeView>) {
		self.views.lock().push(view.clone());
	}

	pub fn remove_view(&self, id: ViewId) {
		self.views.lock().retain(|view| view.id != id);
	}

	pub fn invalidate(&self) {
		self.valid.store(false, Ordering::SeqCst);
	}

	pub fn statuses(&self) -> Vec<String> {
		self.statuses.lock().clone()
	}

	pub fn commands(&self) -> Vec<(String, JsonValue)> {
		self.commands.lock().clone()
	}
}

impl Window for FakeWindow {
	fn id(&self) -> WindowId {
		self.id
	}

	fn is_valid(&self) -> bool {
		self.valid.load(Ordering::SeqCst)
	}

	fn folders(&self) -> Vec<PathBuf> {
		self.folders.lock().clone()
	}

	fn views(&self) -> Vec<SharedView> {
		self.views.lock().iter().map(|view| view.clone() as SharedView).collect()
	}

	fn find_open_file(&self, path: &Path) -> Option<SharedView> {
		self.views
			.lock()
			.iter()
			.find(|view| view.file.as_deref() == Some(path))
			.map(|view| view.clone() as SharedView)
	}

	fn active_view(&self) -> Option<SharedView> {
		self.views.lock().last().map(|view| view.clone() as SharedView)
	}

	fn status_message(&self, message: &str) {
		self.statuses.lock().push(message.to_string());
	}

	fn run_command(&self, command: &str, args: JsonValue) {
		self.commands.lock().push((command.to_string(), args));
	}
}

/// Records every UI call. Dialog answers are scripted up front.
#[derive(Default)]
pub struct FakeEditor {
	pub statuses: Mutex<Vec<String>>,
	pub errors: Mutex<Vec<String>>,
	pub dialogs: Mutex<Vec<String>>,
	pub prompts: Mutex<Vec<String>>,
	pub restart_answer: AtomicBool,
	pub message_choice: Mutex<Option<usize>>,
	pub message_requests: Mutex<Vec<(String, String, Vec<String>)>>,
}

impl FakeEditor {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}
}

impl Editor for FakeEditor {
	fn set_timeout_async(&self, callback: Deferred, delay: Duration) {
		spawn_timeout(callback, delay);
	}

	fn status_message(&self, message: &str) {
		self.statuses.lock().push(message.to_string());
	}

	fn error_message(&self, message: &str) {
		self.errors.lock().push(message.to_string());
	}

	fn message_dialog(&self, message: &str) {
		self.dialogs.lock().push(message.to_string());
	}

	fn ok_cancel_dialog(&self, message: &str, _ok_title: &str, on_done: Box<dyn FnOnce(bool) + Send>) {
		self.prompts.lock().push(message.to_string());
		on_done(self.restart_answer.load(Ordering::SeqCst));
	}

	fn show_message_request(&self, source: &str, message: &str, titles: Vec<String>, on_done: Box<dyn FnOnce(Option<usize>) + Send>) {
		self.message_requests.lock().push((source.to_string(), message.to_string(), titles));
		on_done(*self.message_choice.lock());
	}
}

/// Session lifecycle events, in order.
pub struct RecordingHooks {
	events: Mutex<Vec<String>>,
	changed: Mutex<Option<watch::Sender<usize>>>,
}

impl RecordingHooks {
	pub fn new() -> Arc<Self> {
		let (tx, _) = watch::channel(0);
		Arc::new(Self {
			events: Mutex::new(Vec::new()),
			changed: Mutex::new(Some(tx)),
		})
	}

	fn record(&self, event: &str) {
		let count = {
			let mut events = self.events.lock();
			events.push(event.to_string());
			events.len()
		};
		if let Some(tx) = &*self.changed.lock() {
			tx.send_replace(count);
		}
	}

	pub fn events(&self) -> Vec<String> {
		self.events.lock().clone()
	}

	pub async fn wait_for(&self, event: &str) {
		let mut rx = match &*self.changed.lock() {
			Some(tx) => tx.subscribe(),
			None => return,
		};
		let found = tokio::time::timeout(WAIT_LIMIT, rx.wait_for(|_| self.events.lock().iter().any(|e| e == event))).await;
		assert!(found.is_ok(), "timed out waiting for {event}; saw {:?}", self.events());
	}
}

impl SessionHooks for RecordingHooks {
	fn on_pre_initialize(&self, _session: &Arc<Session>) {
		self.record("pre_initialize");
	}

	fn on_post_initialize(&self, _session: &Arc<Session>) {
		self.record("post_initialize");
	}

	fn on_initialize_failed(&self, _session: &Arc<Session>, _error: &Error) {
		self.record("initialize_failed");
	}

	fn on_post_exit(&self, _session: &Arc<Session>) {
		self.record("post_exit");
	}
}

/// Capabilities most tests want: incremental sync with every notification enabled.
pub fn default_capabilities() -> JsonValue {
	json!({
		"textDocumentSync": {"openClose": true, "change": 2, "willSave": true, "save": {"includeText": false}},
		"hoverProvider": true,
		"completionProvider": {"resolveProvider": true},
		"definitionProvider": true,
		"referencesProvider": true,
		"renameProvider": {"prepareProvider": true},
		"workspace": {"workspaceFolders": {"supported": true, "changeNotifications": true}},
	})
}

/// How a fake server behaves.
#[derive(Clone)]
pub struct ServerScript {
	pub capabilities: JsonValue,
	pub fail_initialize: bool,
	/// Never answer `initialize`.
	pub hang_initialize: bool,
	pub responses: HashMap<String, JsonValue>,
}

impl Default for ServerScript {
	fn default() -> Self {
		Self {
			capabilities: default_capabilities(),
			fail_initialize: false,
			hang_initialize: false,
			responses: HashMap::new(),
		}
	}
}

enum ServerOut {
	Message(JsonValue),
	Stop,
}

/// The server end of an in-memory connection.
#[derive(Clone)]
pub struct FakeServer {
	received: Arc<Mutex<Vec<JsonValue>>>,
	received_tx: Arc<watch::Sender<usize>>,
	outbound: mpsc::UnboundedSender<ServerOut>,
	tasks: Arc<Mutex<Vec<AbortHandle>>>,
}

impl FakeServer {
	/// Connects a client named `name` to a new fake server.
	pub fn connect(name: &str, script: ServerScript) -> (Client, Self) {
		let (client_io, server_io) = tokio::io::duplex(256 * 1024);
		let (read, write) = tokio::io::split(client_io);
		let client = Client::new(name, read, write, ClientOptions::default());
		let (server_read, mut server_write) = tokio::io::split(server_io);

		let (outbound, mut outbound_rx) = mpsc::unbounded_channel();
		let (received_tx, _) = watch::channel(0);
		let server = Self {
			received: Arc::new(Mutex::new(Vec::new())),
			received_tx: Arc::new(received_tx),
			outbound,
			tasks: Arc::new(Mutex::new(Vec::new())),
		};

		let writer = tokio::spawn(async move {
			while let Some(ServerOut::Message(value)) = outbound_rx.recv().await {
				let Ok(msg) = Message::from_value(value) else {
					continue;
				};
				if codec::write_message(&mut server_write, &msg).await.is_err() {
					break;
				}
			}
		});

		let reader_server = server.clone();
		let reader = tokio::spawn(async move {
			let mut reader = BufReader::new(server_read);
			while let Ok(Some(value)) = codec::read_message(&mut reader).await {
				if !reader_server.handle(value, &script) {
					break;
				}
			}
			let _ = reader_server.outbound.send(ServerOut::Stop);
		});

		server.tasks.lock().extend([writer.abort_handle(), reader.abort_handle()]);
		(client, server)
	}

	/// Records and answers one message. Returns false after `exit`.
	fn handle(&self, value: JsonValue, script: &ServerScript) -> bool {
		let method = value.get("method").and_then(JsonValue::as_str).map(str::to_string);
		let id = value.get("id").cloned();
		let count = {
			let mut received = self.received.lock();
			received.push(value);
			received.len()
		};
		self.received_tx.send_replace(count);

		match (method.as_deref(), id) {
			(Some("exit"), None) => return false,
			(Some("initialize"), Some(_)) if script.hang_initialize => {}
			(Some("initialize"), Some(id)) if script.fail_initialize => {
				self.send(json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32603, "message": "cannot initialize"}}));
			}
			(Some("initialize"), Some(id)) => {
				self.send(json!({"jsonrpc": "2.0", "id": id, "result": {"capabilities": script.capabilities}}));
			}
			(Some(method), Some(id)) => {
				let result = script.responses.get(method).cloned().unwrap_or(JsonValue::Null);
				self.send(json!({"jsonrpc": "2.0", "id": id, "result": result}));
			}
			_ => {}
		}
		true
	}

	/// Pushes a message to the client.
	pub fn send(&self, value: JsonValue) {
		let _ = self.outbound.send(ServerOut::Message(value));
	}

	/// Drops the connection as if the process died.
	pub fn crash(&self) {
		for task in self.tasks.lock().drain(..) {
			task.abort();
		}
	}

	pub fn received(&self) -> Vec<JsonValue> {
		self.received.lock().clone()
	}

	/// Every message with `method`.
	pub fn messages(&self, method: &str) -> Vec<JsonValue> {
		self.received
			.lock()
			.iter()
			.filter(|msg| msg.get("method").and_then(JsonValue::as_str) == Some(method))
			.cloned()
			.collect()
	}

	/// Methods in arrival order, `initialize` included.
	pub fn methods(&self) -> Vec<String> {
		self.received
			.lock()
			.iter()
			.filter_map(|msg| msg.get("method").and_then(JsonValue::as_str).map(str::to_string))
			.collect()
	}

	/// Waits until at least `count` messages with `method` arrived.
	pub async fn wait_for(&self, method: &str, count: usize) {
		let mut rx = self.received_tx.subscribe();
		let found = tokio::time::timeout(WAIT_LIMIT, rx.wait_for(|_| self.messages(method).len() >= count)).await;
		assert!(found.is_ok(), "timed out waiting for {count} x {method}; saw {:?}", self.methods());
	}
}

/// Starts sessions against fake servers.
pub struct FakeStarter {
	settings: Settings,
	scripts: Mutex<HashMap<String, ServerScript>>,
	failing: Mutex<HashSet<String>>,
	start_delay: Mutex<Option<Duration>>,
	servers: Mutex<Vec<(String, FakeServer)>>,
	starts: AtomicUsize,
	started_tx: watch::Sender<usize>,
}

impl FakeStarter {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			settings: Settings::default(),
			scripts: Mutex::new(HashMap::new()),
			failing: Mutex::new(HashSet::new()),
			start_delay: Mutex::new(None),
			servers: Mutex::new(Vec::new()),
			starts: AtomicUsize::new(0),
			started_tx: watch::channel(0).0,
		})
	}

	pub fn script(&self, config: &str, script: ServerScript) {
		self.scripts.lock().insert(config.to_string(), script);
	}

	pub fn fail(&self, config: &str) {
		self.failing.lock().insert(config.to_string());
	}

	pub fn delay_starts(&self, delay: Duration) {
		*self.start_delay.lock() = Some(delay);
	}

	pub fn starts(&self) -> usize {
		self.starts.load(Ordering::SeqCst)
	}

	/// Servers started for `config`, oldest first.
	pub fn servers(&self, config: &str) -> Vec<FakeServer> {
		self.servers.lock().iter().filter(|(name, _)| name == config).map(|(_, server)| server.clone()).collect()
	}

	/// The first server for `config`, waiting for it to be started if needed.
	pub async fn server(&self, config: &str) -> FakeServer {
		self.nth_server(config, 0).await
	}

	/// Waits for the `index`-th server of `config`.
	pub async fn nth_server(&self, config: &str, index: usize) -> FakeServer {
		let mut rx = self.started_tx.subscribe();
		let found = tokio::time::timeout(WAIT_LIMIT, rx.wait_for(|_| self.servers(config).len() > index)).await;
		assert!(found.is_ok(), "server {index} for {config} never started");
		self.servers(config).swap_remove(index)
	}
}

#[async_trait]
impl SessionStarter for FakeStarter {
	async fn start_session(&self, request: StartRequest) -> Result<Arc<Session>> {
		let count = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
		let name = request.config.name.clone();
		let delay = *self.start_delay.lock();
		if let Some(delay) = delay {
			tokio::time::sleep(delay).await;
		}
		if self.failing.lock().contains(&name) {
			self.started_tx.send_replace(count);
			return Err(Error::Start {
				config: name,
				reason: "binary not found".into(),
			});
		}

		let script = self.scripts.lock().get(&name).cloned().unwrap_or_default();
		let (client, server) = FakeServer::connect(&name, script);
		let session = Session::start(client, request.config, request.workspace_folders, request.hooks, &self.settings);
		self.servers.lock().push((name, server));
		self.started_tx.send_replace(count);
		Ok(session)
	}
}
