//! Process and socket transports.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use crate::client::{Client, ClientOptions, StderrSink};
use crate::{Error, Result};

const CONNECT_ATTEMPTS: u32 = 10;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// How to launch a language server process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessCommand {
	/// Program followed by its arguments.
	pub argv: Vec<String>,
	/// Variables added to the inherited environment.
	pub env: BTreeMap<String, String>,
	/// Working directory of the process.
	pub cwd: Option<PathBuf>,
}

impl ProcessCommand {
	/// Expands `~` in every argument and `$VAR` references in every environment value.
	pub fn expanded(&self) -> Self {
		Self {
			argv: self.argv.iter().map(|arg| expand_user(arg)).collect(),
			env: self.env.iter().map(|(k, v)| (k.clone(), expand_vars(v))).collect(),
			cwd: self.cwd.clone(),
		}
	}

	fn command(&self) -> Result<Command> {
		let Some((program, args)) = self.argv.split_first() else {
			return Err(Error::Spawn {
				command: String::new(),
				reason: "empty command".into(),
			});
		};
		let mut cmd = Command::new(program);
		cmd.args(args).envs(&self.env).kill_on_drop(true);
		if let Some(cwd) = &self.cwd {
			cmd.current_dir(cwd);
		}
		Ok(cmd)
	}

	fn display(&self) -> String {
		self.argv.join(" ")
	}

	fn spawn_error(&self, e: std::io::Error) -> Error {
		Error::Spawn {
			command: self.display(),
			reason: e.to_string(),
		}
	}
}

/// Replaces a leading `~` or `~/` with the home directory.
pub fn expand_user(arg: &str) -> String {
	let rest = match arg.strip_prefix('~') {
		Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
		_ => return arg.to_string(),
	};
	match dirs::home_dir() {
		Some(home) => format!("{}{rest}", home.display()),
		None => arg.to_string(),
	}
}

/// Expands `$VAR` and `${VAR}` from the process environment. Unknown variables are kept as
/// written.
pub fn expand_vars(value: &str) -> String {
	let mut out = String::with_capacity(value.len());
	let mut rest = value;
	while let Some(pos) = rest.find('$') {
		out.push_str(&rest[..pos]);
		let after = &rest[pos + 1..];
		let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
			match braced.find('}') {
				Some(end) => (&braced[..end], end + 2),
				None => ("", 0),
			}
		} else {
			let end = after.find(|c: char| !(c.is_ascii_alphanumeric() || c == '_')).unwrap_or(after.len());
			(&after[..end], end)
		};

		match (!name.is_empty()).then(|| std::env::var(name).ok()).flatten() {
			Some(val) => out.push_str(&val),
			None => out.push_str(&rest[pos..pos + 1 + consumed]),
		}
		rest = &after[consumed..];
	}
	out.push_str(rest);
	out
}

fn forward_stderr(name: String, child: &mut Child, sink: Option<StderrSink>) {
	let Some(stderr) = child.stderr.take() else {
		return;
	};
	tokio::spawn(async move {
		let mut lines = BufReader::new(stderr).lines();
		// Always drain so a chatty server never blocks on a full pipe.
		while let Ok(Some(line)) = lines.next_line().await {
			match &sink {
				Some(sink) => sink(&line),
				None => debug!(target: "lsp", server = %name, "stderr: {line}"),
			}
		}
	});
}

impl Client {
	/// Spawns a server process and talks to it over stdin/stdout.
	pub fn spawn(name: impl Into<String>, command: &ProcessCommand, stderr: Option<StderrSink>, options: ClientOptions) -> Result<Self> {
		let name = name.into();
		let mut cmd = command.command()?;
		cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
		let mut child = cmd.spawn().map_err(|e| command.spawn_error(e))?;
		info!(server = %name, command = %command.display(), pid = ?child.id(), "spawned language server");

		let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
			return Err(Error::Spawn {
				command: command.display(),
				reason: "stdio pipes unavailable".into(),
			});
		};
		forward_stderr(name.clone(), &mut child, stderr);
		Ok(Self::with_child(name, stdout, stdin, Some(child), options))
	}

	/// Connects to a server listening on a TCP socket, optionally launching it first.
	///
	/// A launched process stays owned by the client and is reaped by [`Client::close`].
	pub async fn connect_tcp(
		name: impl Into<String>,
		addr: &str,
		launch: Option<&ProcessCommand>,
		stderr: Option<StderrSink>,
		options: ClientOptions,
	) -> Result<Self> {
		let name = name.into();
		let child = match launch {
			Some(command) => {
				let mut cmd = command.command()?;
				cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::piped());
				let mut child = cmd.spawn().map_err(|e| command.spawn_error(e))?;
				forward_stderr(name.clone(), &mut child, stderr);
				Some(child)
			}
			None => None,
		};

		// A freshly launched server needs a moment before it listens.
		let attempts = if child.is_some() { CONNECT_ATTEMPTS } else { 1 };
		let mut attempt = 1;
		let stream = loop {
			match TcpStream::connect(addr).await {
				Ok(stream) => break stream,
				Err(e) if attempt < attempts => {
					debug!(server = %name, addr, attempt, error = %e, "server not listening yet");
					attempt += 1;
					tokio::time::sleep(CONNECT_RETRY_DELAY).await;
				}
				Err(e) => {
					return Err(Error::Connect {
						addr: addr.to_string(),
						reason: e.to_string(),
					});
				}
			}
		};
		info!(server = %name, addr, "connected to language server");
		let (reader, writer) = stream.into_split();
		Ok(Self::with_child(name, reader, writer, child, options))
	}
}
