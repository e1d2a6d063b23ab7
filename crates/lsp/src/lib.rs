//! Language server sessions and document synchronization for editor plugins.
//!
//! This crate is the layer between an editor and any number of language servers. Per window it
//! decides which servers must run for the files that are open, keeps exactly one session per
//! server and workspace, and mirrors buffer contents to every session that handles them.
//! * [`ContextManager`]: starts, restarts and stops sessions and routes server-initiated traffic
//! * [`Session`]: one initialized connection with its capabilities and lifecycle state
//! * [`DocumentTracker`]: debounced `didOpen`/`didChange`/`didSave`/`didClose` fan-out
//! * [`WindowConfigs`]: which server configurations apply to which documents
//! * [`RequestDispatcher`]: capability-gated requests issued on behalf of the host
//!
//! The host editor is reached only through the [`editor`] traits. Wire-level concerns live in
//! [`ulf_rpc`].

#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod diagnostics;
pub mod diff;
pub mod documents;
pub mod editor;
pub mod requests;
pub mod session;
pub mod settings;
pub mod starter;
pub mod uri;
pub mod workspace;

#[cfg(test)]
mod test_support;

/// Re-export of the [`lsp_types`] dependency of this crate.
pub use lsp_types;
pub use serde_json::Value as JsonValue;

pub use config::{ClientConfig, ClientConfigs, ConfigOverride, LanguageConfig, ProjectOverrides, WindowConfigs};
pub use context::{ContextBuilder, ContextManager, LanguageHandlerListener};
pub use diagnostics::{DiagnosticsByConfig, DiagnosticsPresenter, DiagnosticsStore};
pub use documents::{DocumentObserver, DocumentTracker};
pub use requests::{Cursor, RequestDispatcher, RequestError, RequestKind, RequestOptions, RequestTable, ResponseSink};
pub use session::{ClientState, Session, SessionHooks, SessionId};
pub use settings::Settings;
pub use starter::{ProcessSessionStarter, SessionStarter, StartRequest};
pub use workspace::{ProjectFolders, WorkspaceFolder};

/// A convenient type alias for `Result` with `E` = [`enum@crate::Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Possible errors.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// The connection failed or the server answered with an error.
	#[error(transparent)]
	Rpc(#[from] ulf_rpc::Error),
	/// A session could not be started.
	#[error("could not start {config}: {reason}")]
	Start {
		/// Name of the configuration.
		config: String,
		/// What went wrong.
		reason: String,
	},
	/// The view has no file on disk, so it has no URI.
	#[error("view {view_id} has no file name")]
	MissingFileName {
		/// The offending view.
		view_id: editor::ViewId,
	},
	/// The session has not finished initializing, or is shutting down.
	#[error("session for {0} is not ready")]
	NotReady(String),
	/// The configuration surface is malformed.
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),
}
