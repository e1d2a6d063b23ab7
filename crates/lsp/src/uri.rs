//! Conversions between filesystem paths and LSP URIs.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use lsp_types::Uri;

use crate::editor::View;
use crate::{Error, Result};

/// Converts a filesystem path to a `file://` URI.
///
/// Relative paths are resolved against the current directory.
pub fn uri_from_path(path: &Path) -> Option<Uri> {
	let abs_path = if path.is_absolute() {
		path.to_path_buf()
	} else {
		std::env::current_dir().ok()?.join(path)
	};
	let url = url::Url::from_file_path(abs_path).ok()?;
	Uri::from_str(url.as_str()).ok()
}

/// Converts an LSP URI to a filesystem path.
///
/// Returns `None` for non-`file` URIs.
pub fn path_from_uri(uri: &Uri) -> Option<PathBuf> {
	let url = url::Url::from_str(uri.as_str()).ok()?;
	url.to_file_path().ok()
}

/// The URI of the file a view shows.
pub fn uri_from_view(view: &dyn View) -> Result<Uri> {
	view.file_name()
		.as_deref()
		.and_then(uri_from_path)
		.ok_or(Error::MissingFileName { view_id: view.id() })
}
