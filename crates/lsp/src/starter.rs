//! Launching sessions.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use ulf_rpc::{Client, StderrSink};

use crate::config::ClientConfig;
use crate::session::{Session, SessionHooks};
use crate::settings::Settings;
use crate::workspace::WorkspaceFolder;
use crate::{Error, Result};

/// Everything needed to start one session.
pub struct StartRequest {
	/// The resolved config to run.
	pub config: Arc<ClientConfig>,
	/// Folders for the session, most specific first.
	pub workspace_folders: Vec<WorkspaceFolder>,
	/// Lifecycle callbacks.
	pub hooks: Arc<dyn SessionHooks>,
	/// Receives the server's stderr lines.
	pub on_stderr: Option<StderrSink>,
}

/// Connects to a language server and starts its session.
///
/// Returns once the connection exists; the `initialize` handshake continues in the background.
#[async_trait]
pub trait SessionStarter: Send + Sync {
	/// Starts the session described by `request`.
	async fn start_session(&self, request: StartRequest) -> Result<Arc<Session>>;
}

/// Starts servers as child processes, or over TCP when the config names a port.
pub struct ProcessSessionStarter {
	settings: Settings,
}

impl ProcessSessionStarter {
	/// A starter whose sessions use `settings`.
	pub fn new(settings: Settings) -> Self {
		Self { settings }
	}
}

#[async_trait]
impl SessionStarter for ProcessSessionStarter {
	async fn start_session(&self, request: StartRequest) -> Result<Arc<Session>> {
		let config = &request.config;
		let mut command = config.process_command();
		command.cwd = request.workspace_folders.first().map(|folder| folder.path.clone());
		let options = self.settings.client_options();

		let client = match config.tcp_address() {
			Some(addr) => {
				let launch = (!command.argv.is_empty()).then_some(&command);
				Client::connect_tcp(config.name.clone(), &addr, launch, request.on_stderr, options).await
			}
			None => Client::spawn(config.name.clone(), &command, request.on_stderr, options),
		}
		.map_err(|e| Error::Start {
			config: config.name.clone(),
			reason: e.to_string(),
		})?;

		info!(config = %config.name, folders = request.workspace_folders.len(), "server connected");
		Ok(Session::start(client, request.config, request.workspace_folders, request.hooks, &self.settings))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::LanguageConfig;
	use crate::test_support::RecordingHooks;

	#[tokio::test]
	async fn test_missing_binary_is_a_start_error() {
		let starter = ProcessSessionStarter::new(Settings::default());
		let config = ClientConfig::new("ghost", ["ulf-no-such-language-server-binary"], [LanguageConfig::new("ghost")]);
		let result = starter
			.start_session(StartRequest {
				config: Arc::new(config),
				workspace_folders: Vec::new(),
				hooks: RecordingHooks::new(),
				on_stderr: None,
			})
			.await;
		match result {
			Err(Error::Start { config, reason }) => {
				assert_eq!(config, "ghost");
				assert!(reason.contains("ulf-no-such-language-server-binary"), "{reason}");
			}
			other => panic!("expected start error, got {other:?}"),
		}
	}
}
