//! Workspace folders of a window and how sessions see them.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::editor::Window;
use crate::uri::uri_from_path;

/// A root directory handed to a language server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceFolder {
	/// Display name, the last path component.
	pub name: String,
	/// Absolute folder path.
	pub path: PathBuf,
}

impl WorkspaceFolder {
	/// A folder named after its last path component.
	pub fn from_path(path: impl Into<PathBuf>) -> Self {
		let path = path.into();
		let name = path
			.file_name()
			.map(|name| name.to_string_lossy().into_owned())
			.unwrap_or_else(|| path.display().to_string());
		Self { name, path }
	}

	/// Returns true if `path` is this folder or lies beneath it.
	pub fn includes_path(&self, path: &Path) -> bool {
		path.starts_with(&self.path)
	}

	/// The LSP representation, or `None` if the path cannot be a `file://` URI.
	pub fn to_lsp(&self) -> Option<lsp_types::WorkspaceFolder> {
		Some(lsp_types::WorkspaceFolder {
			uri: uri_from_path(&self.path)?,
			name: self.name.clone(),
		})
	}
}

/// Orders `folders` for a session started for `file_path`.
///
/// Folders containing the file come first, deepest first; the rest keep their order.
pub fn sorted_workspace_folders(folders: &[PathBuf], file_path: &Path) -> Vec<WorkspaceFolder> {
	let (mut matching, others): (Vec<_>, Vec<_>) = folders.iter().partition(|folder| file_path.starts_with(folder));
	matching.sort_by_key(|folder| std::cmp::Reverse(folder.as_os_str().len()));
	matching.into_iter().chain(others).map(|folder| WorkspaceFolder::from_path(folder.clone())).collect()
}

/// Outcome of re-reading the window's folders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderChange {
	/// Same folders as before.
	Unchanged,
	/// Folders were added or removed but the project is the same.
	Changed {
		/// Folders that appeared.
		added: Vec<PathBuf>,
		/// Folders that went away.
		removed: Vec<PathBuf>,
	},
	/// Nothing of the old project remains.
	Switched,
}

/// The authoritative folder set of one window.
pub struct ProjectFolders {
	window: Arc<dyn Window>,
	folders: Mutex<Vec<PathBuf>>,
}

impl ProjectFolders {
	/// Snapshots the window's current folders.
	pub fn new(window: Arc<dyn Window>) -> Self {
		let folders = window.folders();
		Self {
			window,
			folders: Mutex::new(folders),
		}
	}

	/// The folders as of the last [`Self::update`].
	pub fn folders(&self) -> Vec<PathBuf> {
		self.folders.lock().clone()
	}

	/// Re-reads the window's folders and classifies the difference.
	///
	/// Replacing a non-empty folder set with a disjoint non-empty one is a switch.
	pub fn update(&self) -> FolderChange {
		let new_folders = self.window.folders();
		let mut folders = self.folders.lock();
		if *folders == new_folders {
			return FolderChange::Unchanged;
		}

		let old: HashSet<&PathBuf> = folders.iter().collect();
		let new: HashSet<&PathBuf> = new_folders.iter().collect();
		let change = if !old.is_empty() && !new.is_empty() && old.is_disjoint(&new) {
			FolderChange::Switched
		} else {
			FolderChange::Changed {
				added: new_folders.iter().filter(|f| !old.contains(f)).cloned().collect(),
				removed: folders.iter().filter(|f| !new.contains(f)).cloned().collect(),
			}
		};
		debug!(window = self.window.id(), ?change, "project folders updated");
		*folders = new_folders;
		change
	}

	/// Returns true if the window has no folders or `path` lies in one of them.
	pub fn includes_path(&self, path: &Path) -> bool {
		let folders = self.folders.lock();
		folders.is_empty() || folders.iter().any(|folder| path.starts_with(folder))
	}

	/// The deepest folder containing `path`.
	pub fn project_path(&self, path: &Path) -> Option<PathBuf> {
		self.folders
			.lock()
			.iter()
			.filter(|folder| path.starts_with(folder))
			.max_by_key(|folder| folder.as_os_str().len())
			.cloned()
	}
}

#[cfg(test)]
mod tests;
