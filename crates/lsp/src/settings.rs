//! Plugin-wide settings handed to each window's context at construction.

use std::time::Duration;

use serde::Deserialize;
use ulf_rpc::ClientOptions;

/// Tunables shared by the sessions of one window.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
	/// Log lines servers write to stderr.
	pub log_stderr: bool,
	/// Trace every message exchanged with servers.
	pub log_payloads: bool,
	/// How long rapid edits to one buffer are coalesced before `didChange` is sent.
	#[serde(with = "millis")]
	pub change_debounce: Duration,
	/// Limit for requests awaited with `execute_request`. `None` waits indefinitely.
	#[serde(with = "opt_millis")]
	pub request_timeout: Option<Duration>,
	/// How long a server may take to exit after `exit` before it is killed.
	#[serde(with = "millis")]
	pub shutdown_grace: Duration,
	/// Show completion snippets.
	pub complete_snippets: bool,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			log_stderr: false,
			log_payloads: false,
			change_debounce: Duration::from_millis(50),
			request_timeout: Some(Duration::from_secs(5)),
			shutdown_grace: Duration::from_secs(2),
			complete_snippets: true,
		}
	}
}

impl Settings {
	/// Connection options derived from these settings.
	pub fn client_options(&self) -> ClientOptions {
		ClientOptions {
			log_payloads: self.log_payloads,
			shutdown_grace: self.shutdown_grace,
		}
	}
}

mod millis {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer};

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}

mod opt_millis {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer};

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
		Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
	}
}
