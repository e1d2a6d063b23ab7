//! Interfaces the host editor implements.
//!
//! The core never touches a concrete editor API. Buffers, windows and UI affordances reach it
//! through these traits, and every callback into the host happens without internal locks held.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;

/// Identifies a view within the editor.
pub type ViewId = u64;
/// Identifies a buffer. Several views may share one buffer.
pub type BufferId = u64;
/// Identifies an editor window.
pub type WindowId = u64;

/// A view onto a buffer.
pub trait View: Send + Sync {
	/// Unique view id.
	fn id(&self) -> ViewId;

	/// Path of the file shown, if the buffer has one.
	fn file_name(&self) -> Option<PathBuf>;

	/// The buffer this view displays.
	fn buffer_id(&self) -> BufferId;

	/// Language identifier of the buffer, e.g. `rust`.
	fn language_id(&self) -> Option<String>;

	/// Monotonic edit counter of the buffer; used as the document version.
	fn change_count(&self) -> i32;

	/// The whole buffer text.
	fn entire_content(&self) -> String;

	/// Width of a tab stop.
	fn tab_size(&self) -> u32;

	/// Whether indentation inserts spaces.
	fn translate_tabs_to_spaces(&self) -> bool;

	/// False once the view has been closed.
	fn is_valid(&self) -> bool;
}

/// Shared view handle.
pub type SharedView = Arc<dyn View>;

/// An editor window grouping views and project folders.
pub trait Window: Send + Sync {
	/// Unique window id.
	fn id(&self) -> WindowId;

	/// False once the window has been closed.
	fn is_valid(&self) -> bool;

	/// Project folders, in the order the project lists them.
	fn folders(&self) -> Vec<PathBuf>;

	/// All views in this window.
	fn views(&self) -> Vec<SharedView>;

	/// The view showing `path`, if any.
	fn find_open_file(&self, path: &Path) -> Option<SharedView>;

	/// The focused view.
	fn active_view(&self) -> Option<SharedView>;

	/// Shows a transient message in this window's status area.
	fn status_message(&self, message: &str);

	/// Runs a host command, e.g. applying a workspace edit.
	fn run_command(&self, command: &str, args: JsonValue);
}

/// Work deferred through [`Editor::set_timeout_async`].
pub type Deferred = Box<dyn FnOnce() + Send>;

/// Editor-wide services.
pub trait Editor: Send + Sync {
	/// Runs `callback` off the caller's stack after `delay`.
	fn set_timeout_async(&self, callback: Deferred, delay: Duration);

	/// Shows a transient status message.
	fn status_message(&self, message: &str);

	/// Shows an error message.
	fn error_message(&self, message: &str);

	/// Shows a modal message.
	fn message_dialog(&self, message: &str);

	/// Asks the user to confirm; `on_done` receives true for the OK button.
	fn ok_cancel_dialog(&self, message: &str, ok_title: &str, on_done: Box<dyn FnOnce(bool) + Send>);

	/// Offers a list of choices; `on_done` receives the picked index, or `None` when dismissed.
	fn show_message_request(&self, source: &str, message: &str, titles: Vec<String>, on_done: Box<dyn FnOnce(Option<usize>) + Send>);
}

/// [`Editor::set_timeout_async`] on the current tokio runtime.
pub fn spawn_timeout(callback: Deferred, delay: Duration) {
	tokio::spawn(async move {
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}
		callback();
	});
}
