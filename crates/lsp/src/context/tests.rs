use std::sync::atomic::{AtomicUsize, Ordering};

use pretty_assertions::assert_eq;

use super::*;
use crate::config::{ClientConfigs, LanguageConfig};
use crate::test_support::{FakeEditor, FakeServer, FakeStarter, FakeView, FakeWindow, ServerScript, wait_until};

const MAIN_RS: &str = "/work/app/src/main.rs";
const RUST: &str = "rust-analyzer";

struct Fixture {
	manager: Arc<ContextManager>,
	window: Arc<FakeWindow>,
	editor: Arc<FakeEditor>,
	starter: Arc<FakeStarter>,
	closed: Arc<AtomicUsize>,
}

fn configs() -> Arc<WindowConfigs> {
	Arc::new(WindowConfigs::new(ClientConfigs::new(vec![
		ClientConfig::new(RUST, ["rust-analyzer"], [LanguageConfig::new("rust")]),
		ClientConfig::new("pyright", ["pyright-langserver", "--stdio"], [LanguageConfig::new("python")]),
	])))
}

fn fixture() -> Fixture {
	fixture_with(|builder| builder)
}

fn fixture_with(customize: impl FnOnce(ContextBuilder) -> ContextBuilder) -> Fixture {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
	let window = FakeWindow::new(1, &["/work/app"]);
	let editor = FakeEditor::new();
	let starter = FakeStarter::new();
	let closed = Arc::new(AtomicUsize::new(0));
	let counter = closed.clone();
	let builder = ContextManager::builder(window.clone(), editor.clone(), starter.clone(), configs()).on_closed(move || {
		counter.fetch_add(1, Ordering::SeqCst);
	});
	Fixture {
		manager: customize(builder).build(),
		window,
		editor,
		starter,
		closed,
	}
}

impl Fixture {
	fn view(&self, id: u64, path: &str, language: &str) -> SharedView {
		let view = FakeView::new(id, Some(path), Some(language), "fn main() {}\n");
		self.window.add_view(&view);
		view
	}

	/// Activates a rust view and waits until its session finished post-initialize wiring.
	async fn ready(&self, id: u64, path: &str) -> (SharedView, FakeServer) {
		let view = self.view(id, path, "rust");
		self.manager.activate_view(&view).await;
		let server = self.starter.server(RUST).await;
		let window = self.window.clone();
		wait_until(move || window.statuses().iter().any(|s| s == "rust-analyzer initialized")).await;
		(view, server)
	}
}

/// Lets timers fire and in-flight messages land.
async fn settle() {
	tokio::time::sleep(Duration::from_millis(800)).await;
}

async fn wait_for_response(server: &FakeServer, id: i64) -> JsonValue {
	let probe = server.clone();
	wait_until(move || probe.received().iter().any(|msg| is_response(msg, id))).await;
	server.received().into_iter().find(|msg| is_response(msg, id)).unwrap()
}

fn is_response(msg: &JsonValue, id: i64) -> bool {
	msg.get("method").is_none() && msg.get("id") == Some(&json!(id))
}

#[tokio::test(start_paused = true)]
async fn test_activation_starts_ready_session() {
	let fx = fixture();
	let (view, _server) = fx.ready(1, MAIN_RS).await;

	assert_eq!(fx.starter.starts(), 1);
	assert!(fx.window.statuses().contains(&"Starting rust-analyzer...".to_string()));
	assert!(fx.window.statuses().contains(&"rust-analyzer initialized".to_string()));
	assert!(fx.manager.get_session(RUST, Path::new(MAIN_RS)).is_some());
	assert_eq!(fx.manager.get_project_path(Path::new(MAIN_RS)), Some(PathBuf::from("/work/app")));
	assert!(fx.manager.session_for_view(&*view, Some("hoverProvider")).is_some());
	assert!(fx.manager.session_for_view(&*view, Some("documentFormattingProvider")).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_activations_start_one_session() {
	let fx = fixture();
	fx.starter.delay_starts(Duration::from_millis(100));
	let main = fx.view(1, MAIN_RS, "rust");
	let lib = fx.view(2, "/work/app/src/lib.rs", "rust");

	tokio::join!(fx.manager.activate_view(&main), fx.manager.activate_view(&lib));
	settle().await;

	assert_eq!(fx.starter.starts(), 1);
	assert_eq!(fx.manager.sessions().len(), 1);
	assert!(fx.manager.sessions()[0].is_ready());
}

#[tokio::test(start_paused = true)]
async fn test_views_outside_project_or_language_start_nothing() {
	let fx = fixture();
	let outside = fx.view(1, "/elsewhere/main.rs", "rust");
	let text = fx.view(2, "/work/app/notes.txt", "text");
	let unsaved: SharedView = FakeView::new(3, None, Some("rust"), "");

	fx.manager.activate_view(&outside).await;
	fx.manager.activate_view(&text).await;
	fx.manager.activate_view(&unsaved).await;

	assert_eq!(fx.starter.starts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_failure_disables_config() {
	let fx = fixture();
	fx.starter.fail(RUST);
	let view = fx.view(1, MAIN_RS, "rust");

	fx.manager.activate_view(&view).await;
	fx.manager.initialize_on_open(&view).await;

	assert_eq!(fx.starter.starts(), 1);
	assert!(fx.manager.configs().is_temporarily_disabled(RUST));
	assert_eq!(
		*fx.editor.dialogs.lock(),
		vec!["Could not start rust-analyzer\n\ncould not start rust-analyzer: binary not found\n\nServer will be disabled for this window".to_string()]
	);
}

#[tokio::test(start_paused = true)]
async fn test_initialize_failure_disables_config() {
	let fx = fixture();
	fx.starter.script(
		RUST,
		ServerScript {
			fail_initialize: true,
			..ServerScript::default()
		},
	);
	let view = fx.view(1, MAIN_RS, "rust");

	fx.manager.activate_view(&view).await;
	settle().await;

	assert!(fx.manager.configs().is_temporarily_disabled(RUST));
	let dialogs = fx.editor.dialogs.lock().clone();
	assert_eq!(dialogs.len(), 1);
	assert!(dialogs[0].starts_with("Could not start rust-analyzer\n\n"), "{dialogs:?}");
	assert!(fx.manager.sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_server_dying_during_initialize_is_not_restarted() {
	let fx = fixture();
	fx.editor.restart_answer.store(true, Ordering::SeqCst);
	fx.starter.script(
		RUST,
		ServerScript {
			hang_initialize: true,
			..ServerScript::default()
		},
	);
	let view = fx.view(1, MAIN_RS, "rust");

	fx.manager.activate_view(&view).await;
	let server = fx.starter.server(RUST).await;
	server.wait_for("initialize", 1).await;
	server.crash();
	wait_until(|| fx.manager.sessions().is_empty() && !fx.editor.dialogs.lock().is_empty()).await;
	settle().await;

	assert!(fx.editor.prompts.lock().is_empty(), "{:?}", fx.editor.prompts.lock());
	let dialogs = fx.editor.dialogs.lock().clone();
	assert_eq!(dialogs.len(), 1);
	assert!(dialogs[0].starts_with("Could not start rust-analyzer\n\n"), "{dialogs:?}");
	assert!(fx.manager.configs().is_temporarily_disabled(RUST));
	assert_eq!(fx.starter.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_crash_restart_reopens_documents_once() {
	let fx = fixture();
	fx.editor.restart_answer.store(true, Ordering::SeqCst);
	let (view, first) = fx.ready(1, MAIN_RS).await;
	fx.manager.documents().handle_did_open(&view);
	first.wait_for("textDocument/didOpen", 1).await;

	first.crash();
	let second = fx.starter.nth_server(RUST, 1).await;
	second.wait_for("textDocument/didOpen", 1).await;
	settle().await;

	assert_eq!(
		*fx.editor.prompts.lock(),
		vec!["Language server rust-analyzer has crashed, do you want to restart it?".to_string()]
	);
	assert_eq!(fx.starter.starts(), 2);
	assert_eq!(second.messages("textDocument/didOpen").len(), 1);
	assert_eq!(fx.manager.sessions().len(), 1);
	assert_eq!(fx.closed.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_crash_declined_disables_config() {
	let fx = fixture();
	let (_view, server) = fx.ready(1, MAIN_RS).await;

	server.crash();
	settle().await;

	assert_eq!(fx.editor.prompts.lock().len(), 1);
	assert!(fx.manager.configs().is_temporarily_disabled(RUST));
	assert!(fx.manager.sessions().is_empty());

	let other = fx.view(2, "/work/app/src/lib.rs", "rust");
	fx.manager.activate_view(&other).await;
	assert_eq!(fx.starter.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_window_close_ends_sessions_once() {
	let fx = fixture();
	let (view, server) = fx.ready(1, MAIN_RS).await;

	fx.window.remove_view(view.id());
	fx.window.invalidate();
	fx.manager.handle_view_closed(&view);
	fx.manager.handle_view_closed(&view);
	settle().await;

	assert_eq!(server.methods(), vec!["initialize", "initialized", "shutdown", "exit"]);
	assert!(fx.manager.sessions().is_empty());
	assert_eq!(fx.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_window_close_is_rechecked() {
	let fx = fixture();
	let (view, server) = fx.ready(1, MAIN_RS).await;

	fx.manager.handle_view_closed(&view);
	fx.window.invalidate();
	server.wait_for("exit", 1).await;
	settle().await;

	assert_eq!(fx.closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_closing_a_view_keeps_open_window_sessions() {
	let fx = fixture();
	let (view, server) = fx.ready(1, MAIN_RS).await;

	fx.manager.handle_view_closed(&view);
	settle().await;

	assert!(server.messages("shutdown").is_empty());
	assert_eq!(fx.manager.sessions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_apply_edit_runs_host_command() {
	let fx = fixture();
	let (_view, server) = fx.ready(1, MAIN_RS).await;
	let edit = json!({"range": {"start": {"line": 0, "character": 3}, "end": {"line": 0, "character": 7}}, "newText": "start"});

	server.send(json!({
		"jsonrpc": "2.0",
		"id": 7,
		"method": "workspace/applyEdit",
		"params": {"edit": {"changes": {"file:///work/app/src/main.rs": [edit]}}},
	}));
	let response = wait_for_response(&server, 7).await;

	assert_eq!(response["result"], json!({"applied": true}));
	assert_eq!(
		fx.window.commands(),
		vec![(APPLY_EDIT_COMMAND.to_string(), json!({"changes": {MAIN_RS: [edit]}}))]
	);
}

#[tokio::test(start_paused = true)]
async fn test_message_request_answers_chosen_title() {
	let fx = fixture();
	*fx.editor.message_choice.lock() = Some(1);
	let (_view, server) = fx.ready(1, MAIN_RS).await;

	server.send(json!({
		"jsonrpc": "2.0",
		"id": 8,
		"method": "window/showMessageRequest",
		"params": {"type": 3, "message": "Reload workspace?", "actions": [{"title": "Yes"}, {"title": "No"}]},
	}));
	let response = wait_for_response(&server, 8).await;

	assert_eq!(response["result"], json!({"title": "No"}));
	assert_eq!(
		*fx.editor.message_requests.lock(),
		vec![(RUST.to_string(), "Reload workspace?".to_string(), vec!["Yes".to_string(), "No".to_string()])]
	);
}

#[tokio::test(start_paused = true)]
async fn test_dismissed_message_request_answers_null() {
	let fx = fixture();
	let (_view, server) = fx.ready(1, MAIN_RS).await;

	server.send(json!({
		"jsonrpc": "2.0",
		"id": 9,
		"method": "window/showMessageRequest",
		"params": {"type": 1, "message": "Something broke"},
	}));
	let response = wait_for_response(&server, 9).await;

	assert_eq!(response.get("result"), Some(&JsonValue::Null));
}

#[tokio::test(start_paused = true)]
async fn test_show_message_goes_to_status() {
	let fx = fixture();
	let (_view, server) = fx.ready(1, MAIN_RS).await;

	server.send(json!({"jsonrpc": "2.0", "method": "window/showMessage", "params": {"type": 3, "message": "indexing"}}));
	server.send(json!({"jsonrpc": "2.0", "method": "window/logMessage", "params": {"type": 4, "message": "verbose"}}));
	settle().await;

	assert_eq!(*fx.editor.statuses.lock(), vec!["rust-analyzer: indexing".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_diagnostics_cleared_when_session_ends() {
	let fx = fixture();
	let (_view, server) = fx.ready(1, MAIN_RS).await;

	server.send(json!({
		"jsonrpc": "2.0",
		"method": "textDocument/publishDiagnostics",
		"params": {
			"uri": "file:///work/app/src/main.rs",
			"diagnostics": [{"range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 2}}, "message": "unused"}],
		},
	}));
	let diagnostics = fx.manager.diagnostics().clone();
	wait_until(move || !diagnostics.get_by_file(Path::new(MAIN_RS)).is_empty()).await;
	assert_eq!(fx.manager.diagnostics().get_by_file(Path::new(MAIN_RS))[RUST][0].message, "unused");

	fx.manager.disable_config(RUST);
	server.wait_for("exit", 1).await;
	settle().await;

	assert!(fx.manager.diagnostics().get_by_file(Path::new(MAIN_RS)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disable_then_enable_restarts_server() {
	let fx = fixture();
	let (_view, first) = fx.ready(1, MAIN_RS).await;

	fx.manager.disable_config(RUST);
	first.wait_for("exit", 1).await;
	settle().await;
	assert!(fx.manager.sessions().is_empty());
	assert!(!fx.manager.configs().get(RUST).unwrap().enabled);

	fx.manager.enable_config(RUST);
	let second = fx.starter.nth_server(RUST, 1).await;
	second.wait_for("initialized", 1).await;

	assert_eq!(fx.starter.starts(), 2);
	assert!(fx.window.statuses().contains(&"rust-analyzer enabled, starting server...".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_added_folder_is_announced() {
	let fx = fixture();
	let (_view, server) = fx.ready(1, MAIN_RS).await;

	fx.window.set_folders(&["/work/app", "/work/lib"]);
	let other = fx.view(2, "/work/app/src/lib.rs", "rust");
	fx.manager.activate_view(&other).await;
	server.wait_for("workspace/didChangeWorkspaceFolders", 1).await;

	let message = &server.messages("workspace/didChangeWorkspaceFolders")[0];
	assert_eq!(message["params"]["event"]["added"][0]["name"], "lib");
	assert_eq!(message["params"]["event"]["removed"], json!([]));
	assert_eq!(fx.starter.starts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_switched_project_replaces_sessions() {
	let fx = fixture();
	let (_view, first) = fx.ready(1, MAIN_RS).await;

	fx.window.set_folders(&["/work/other"]);
	let other = fx.view(2, "/work/other/src/main.rs", "rust");
	fx.manager.activate_view(&other).await;
	first.wait_for("exit", 1).await;
	let second = fx.starter.nth_server(RUST, 1).await;
	second.wait_for("initialized", 1).await;

	let init = &second.messages("initialize")[0];
	assert_eq!(init["params"]["rootUri"], "file:///work/other");
	assert_eq!(fx.starter.starts(), 2);
}

#[derive(Default)]
struct RecordingListener {
	veto: bool,
	events: Mutex<Vec<String>>,
}

impl LanguageHandlerListener for RecordingListener {
	fn on_start(&self, config: &str, _window: &dyn Window) -> bool {
		self.events.lock().push(format!("start:{config}"));
		!self.veto
	}

	fn on_initialized(&self, config: &str, _window: &dyn Window, _session: &Arc<Session>) {
		self.events.lock().push(format!("initialized:{config}"));
	}

	fn on_exited(&self, config: &str, _window: &dyn Window) {
		self.events.lock().push(format!("exited:{config}"));
	}
}

#[tokio::test(start_paused = true)]
async fn test_listener_sees_lifecycle() {
	let listener = Arc::new(RecordingListener::default());
	let fx = fixture_with(|builder| builder.listener(listener.clone()));
	let (_view, server) = fx.ready(1, MAIN_RS).await;

	fx.manager.end_sessions();
	server.wait_for("exit", 1).await;
	settle().await;

	assert_eq!(*listener.events.lock(), vec!["start:rust-analyzer", "initialized:rust-analyzer", "exited:rust-analyzer"]);
}

#[tokio::test(start_paused = true)]
async fn test_listener_can_veto_start() {
	let listener = Arc::new(RecordingListener {
		veto: true,
		..RecordingListener::default()
	});
	let fx = fixture_with(|builder| builder.listener(listener.clone()));
	let view = fx.view(1, MAIN_RS, "rust");

	fx.manager.activate_view(&view).await;

	assert_eq!(fx.starter.starts(), 0);
	assert_eq!(*listener.events.lock(), vec!["start:rust-analyzer"]);
}
