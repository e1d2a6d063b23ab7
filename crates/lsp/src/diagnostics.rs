//! Per-file diagnostics published by servers.
//!
//! Each `(file, config)` pair holds the list from that server's latest `publishDiagnostics`;
//! a new publication replaces it wholesale.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use lsp_types::{Diagnostic, Position, PublishDiagnosticsParams};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::uri::path_from_uri;

/// Diagnostics of one file, keyed by config name.
pub type DiagnosticsByConfig = IndexMap<String, Vec<Diagnostic>>;

/// Shows diagnostics in the editor.
pub trait DiagnosticsPresenter: Send + Sync {
	/// The diagnostics of `path` changed. `diagnostics` holds every config's current list.
	fn update(&self, path: &Path, diagnostics: &DiagnosticsByConfig);
}

/// Latest diagnostics per file and config.
pub struct DiagnosticsStore {
	files: Mutex<IndexMap<PathBuf, DiagnosticsByConfig>>,
	presenter: Option<Arc<dyn DiagnosticsPresenter>>,
}

impl DiagnosticsStore {
	/// A store that reports every change to `presenter`.
	pub fn new(presenter: Arc<dyn DiagnosticsPresenter>) -> Self {
		Self {
			files: Mutex::new(IndexMap::new()),
			presenter: Some(presenter),
		}
	}

	/// A store nobody presents.
	pub fn headless() -> Self {
		Self {
			files: Mutex::new(IndexMap::new()),
			presenter: None,
		}
	}

	/// Handles `textDocument/publishDiagnostics` from `config`.
	pub fn receive(&self, config: &str, params: JsonValue) {
		let params: PublishDiagnosticsParams = match serde_json::from_value(params) {
			Ok(params) => params,
			Err(e) => {
				warn!(config, error = %e, "malformed publishDiagnostics");
				return;
			}
		};
		let Some(path) = path_from_uri(&params.uri) else {
			debug!(config, uri = params.uri.as_str(), "diagnostics for non-file uri");
			return;
		};
		self.update(&path, config, params.diagnostics);
	}

	/// Replaces the diagnostics `config` reported for `path`.
	pub fn update(&self, path: &Path, config: &str, diagnostics: Vec<Diagnostic>) {
		let current = {
			let mut files = self.files.lock();
			let by_config = files.entry(path.to_path_buf()).or_default();
			if diagnostics.is_empty() {
				by_config.shift_remove(config);
			} else {
				by_config.insert(config.to_string(), diagnostics);
			}
			let current = by_config.clone();
			if current.is_empty() {
				files.shift_remove(path);
			}
			current
		};
		self.present(path, &current);
	}

	/// Drops what `config` reported for `path`.
	pub fn remove(&self, path: &Path, config: &str) {
		let current = {
			let mut files = self.files.lock();
			let Some(by_config) = files.get_mut(path) else {
				return;
			};
			if by_config.shift_remove(config).is_none() {
				return;
			}
			let current = by_config.clone();
			if current.is_empty() {
				files.shift_remove(path);
			}
			current
		};
		self.present(path, &current);
	}

	/// Every config's diagnostics for `path`.
	pub fn get_by_file(&self, path: &Path) -> DiagnosticsByConfig {
		self.files.lock().get(path).cloned().unwrap_or_default()
	}

	/// Diagnostics of `path` whose range contains `position`, by config. Configs with none are left out.
	pub fn at_position(&self, path: &Path, position: Position) -> DiagnosticsByConfig {
		let files = self.files.lock();
		let Some(by_config) = files.get(path) else {
			return DiagnosticsByConfig::new();
		};
		by_config
			.iter()
			.filter_map(|(config, diagnostics)| {
				let hits: Vec<_> = diagnostics
					.iter()
					.filter(|d| d.range.start <= position && position <= d.range.end)
					.cloned()
					.collect();
				(!hits.is_empty()).then(|| (config.clone(), hits))
			})
			.collect()
	}

	fn present(&self, path: &Path, diagnostics: &DiagnosticsByConfig) {
		if let Some(presenter) = &self.presenter {
			presenter.update(path, diagnostics);
		}
	}
}
