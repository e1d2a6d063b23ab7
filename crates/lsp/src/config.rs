//! Language server configurations and the per-window registry that resolves them.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::debug;
use ulf_rpc::ProcessCommand;

use crate::editor::View;
use crate::{Error, Result};

/// JSON object payload.
pub type JsonMap = Map<String, JsonValue>;

const DEFAULT_TCP_HOST: &str = "localhost";

/// A language a server handles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageConfig {
	/// LSP language identifier sent in `didOpen`.
	#[serde(alias = "languageId")]
	pub id: String,
	/// Syntax scopes associated with the language.
	#[serde(default)]
	pub scopes: Vec<String>,
}

impl LanguageConfig {
	/// A language without scopes.
	pub fn new(id: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			scopes: Vec::new(),
		}
	}
}

/// How to launch or reach one language server, after project overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
	/// Unique server name. Joins sessions, documents and overrides.
	pub name: String,
	/// Command and arguments.
	pub binary_args: Vec<String>,
	/// Host to connect to when `tcp_port` is set.
	pub tcp_host: Option<String>,
	/// Connect over TCP instead of stdio.
	pub tcp_port: Option<u16>,
	/// Languages in priority order.
	pub languages: Vec<LanguageConfig>,
	/// Disabled configs never start.
	pub enabled: bool,
	/// `initializationOptions` for `initialize`.
	pub init_options: JsonValue,
	/// Pushed with `workspace/didChangeConfiguration` and served to `workspace/configuration`.
	pub settings: JsonMap,
	/// Extra environment for the server process.
	pub env: BTreeMap<String, String>,
	/// `capabilities.experimental` for `initialize`.
	pub experimental_capabilities: Option<JsonValue>,
}

impl ClientConfig {
	/// An enabled stdio config.
	pub fn new(name: impl Into<String>, binary_args: impl IntoIterator<Item = impl Into<String>>, languages: impl IntoIterator<Item = LanguageConfig>) -> Self {
		Self {
			name: name.into(),
			binary_args: binary_args.into_iter().map(Into::into).collect(),
			tcp_host: None,
			tcp_port: None,
			languages: languages.into_iter().collect(),
			enabled: true,
			init_options: JsonValue::Null,
			settings: JsonMap::new(),
			env: BTreeMap::new(),
			experimental_capabilities: None,
		}
	}

	/// Returns true if any configured language has the given id.
	pub fn supports_language(&self, language_id: &str) -> bool {
		self.language(language_id).is_some()
	}

	/// The configured language with the given id.
	pub fn language(&self, language_id: &str) -> Option<&LanguageConfig> {
		self.languages.iter().find(|lang| lang.id == language_id)
	}

	/// The process to launch, with `~` and `$VAR` expanded.
	pub fn process_command(&self) -> ProcessCommand {
		ProcessCommand {
			argv: self.binary_args.clone(),
			env: self.env.clone(),
			cwd: None,
		}
		.expanded()
	}

	/// `host:port` when the server is reached over TCP.
	pub fn tcp_address(&self) -> Option<String> {
		self.tcp_port
			.map(|port| format!("{}:{port}", self.tcp_host.as_deref().unwrap_or(DEFAULT_TCP_HOST)))
	}
}

/// A command given as one string or as an argument list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
	/// Whitespace-separated command line.
	Line(String),
	/// Program and arguments.
	Args(Vec<String>),
}

impl CommandLine {
	/// Splits into program and arguments.
	pub fn to_args(&self) -> Vec<String> {
		match self {
			Self::Line(line) => line.split_whitespace().map(str::to_string).collect(),
			Self::Args(args) => args.clone(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawClientConfig {
	#[serde(alias = "binary_args")]
	command: Option<CommandLine>,
	tcp_host: Option<String>,
	tcp_port: Option<u16>,
	filetypes: Vec<String>,
	languages: Vec<LanguageConfig>,
	settings: JsonMap,
	env: BTreeMap<String, String>,
	#[serde(rename = "initializationOptions")]
	initialization_options: Option<JsonValue>,
	enabled: Option<bool>,
	experimental_capabilities: Option<JsonValue>,
}

impl RawClientConfig {
	fn into_config(self, name: String) -> Result<ClientConfig> {
		let binary_args = self.command.as_ref().map(CommandLine::to_args).unwrap_or_default();
		if binary_args.is_empty() && self.tcp_port.is_none() {
			return Err(Error::InvalidConfig(format!("{name}: needs a command or a tcp_port")));
		}

		let mut languages = self.languages;
		for filetype in self.filetypes {
			if !languages.iter().any(|lang| lang.id == filetype) {
				languages.push(LanguageConfig::new(filetype));
			}
		}

		Ok(ClientConfig {
			name,
			binary_args,
			tcp_host: self.tcp_host,
			tcp_port: self.tcp_port,
			languages,
			enabled: self.enabled.unwrap_or(true),
			init_options: self.initialization_options.unwrap_or(JsonValue::Null),
			settings: self.settings,
			env: self.env,
			experimental_capabilities: self.experimental_capabilities,
		})
	}
}

/// The globally configured servers, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientConfigs {
	all: Vec<ClientConfig>,
}

impl ClientConfigs {
	/// Wraps already-built configs.
	pub fn new(all: Vec<ClientConfig>) -> Self {
		Self { all }
	}

	/// Parses a mapping of server name to server settings.
	pub fn from_json(value: JsonValue) -> Result<Self> {
		let raw: IndexMap<String, RawClientConfig> = serde_json::from_value(value).map_err(|e| Error::InvalidConfig(e.to_string()))?;
		Self::from_raw(raw)
	}

	/// Parses the same mapping from TOML, one table per server.
	pub fn from_toml_str(text: &str) -> Result<Self> {
		let raw: IndexMap<String, RawClientConfig> = toml::from_str(text).map_err(|e| Error::InvalidConfig(e.to_string()))?;
		Self::from_raw(raw)
	}

	/// Reads a TOML or JSON file, chosen by extension.
	pub fn load(path: &Path) -> Result<Self> {
		let text = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))?;
		match path.extension().and_then(|ext| ext.to_str()) {
			Some("json") => Self::from_json(serde_json::from_str(&text).map_err(|e| Error::InvalidConfig(e.to_string()))?),
			_ => Self::from_toml_str(&text),
		}
	}

	fn from_raw(raw: IndexMap<String, RawClientConfig>) -> Result<Self> {
		let all = raw.into_iter().map(|(name, raw)| raw.into_config(name)).collect::<Result<_>>()?;
		Ok(Self { all })
	}

	/// All configs.
	pub fn all(&self) -> &[ClientConfig] {
		&self.all
	}

	/// Looks up a config by name.
	pub fn get(&self, name: &str) -> Option<&ClientConfig> {
		self.all.iter().find(|c| c.name == name)
	}
}

/// Project-level changes to one server config.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConfigOverride {
	/// Replaces the command.
	#[serde(alias = "binary_args")]
	pub command: Option<CommandLine>,
	/// Replaces the TCP host.
	pub tcp_host: Option<String>,
	/// Replaces the TCP port.
	pub tcp_port: Option<u16>,
	/// Enables or disables the server for the project.
	pub enabled: Option<bool>,
	/// Replaces `initializationOptions`.
	#[serde(rename = "initializationOptions")]
	pub initialization_options: Option<JsonValue>,
	/// Merged into the settings.
	pub settings: JsonMap,
	/// Merged into the environment.
	pub env: BTreeMap<String, String>,
	/// Replaces the experimental capabilities.
	pub experimental_capabilities: Option<JsonValue>,
}

/// Overrides keyed by server name.
pub type ProjectOverrides = IndexMap<String, ConfigOverride>;

/// Returns `config` with the project's overrides for it applied.
pub fn apply_project_overrides(config: &ClientConfig, overrides: &ProjectOverrides) -> ClientConfig {
	let Some(over) = overrides.get(&config.name) else {
		return config.clone();
	};

	let mut env = config.env.clone();
	env.extend(over.env.iter().map(|(k, v)| (k.clone(), v.clone())));

	ClientConfig {
		name: config.name.clone(),
		binary_args: over.command.as_ref().map(CommandLine::to_args).unwrap_or_else(|| config.binary_args.clone()),
		tcp_host: over.tcp_host.clone().or_else(|| config.tcp_host.clone()),
		tcp_port: over.tcp_port.or(config.tcp_port),
		languages: config.languages.clone(),
		enabled: over.enabled.unwrap_or(config.enabled),
		init_options: over.initialization_options.clone().unwrap_or_else(|| config.init_options.clone()),
		settings: merge_one_level(&config.settings, &over.settings),
		env,
		experimental_capabilities: over.experimental_capabilities.clone().or_else(|| config.experimental_capabilities.clone()),
	}
}

/// Merges `overrides` into `base`.
///
/// Override keys replace base keys, except that when both sides hold an object the two
/// objects are merged key by key. Deeper levels are replaced wholesale.
pub fn merge_one_level(base: &JsonMap, overrides: &JsonMap) -> JsonMap {
	let mut merged = base.clone();
	for (key, value) in overrides {
		let nested = match (base.get(key), value) {
			(Some(JsonValue::Object(base_obj)), JsonValue::Object(over_obj)) => {
				let mut inner = base_obj.clone();
				inner.extend(over_obj.iter().map(|(k, v)| (k.clone(), v.clone())));
				JsonValue::Object(inner)
			}
			_ => value.clone(),
		};
		merged.insert(key.clone(), nested);
	}
	merged
}

struct WindowConfigState {
	all: Vec<Arc<ClientConfig>>,
	overrides: ProjectOverrides,
	temporarily_disabled: HashSet<String>,
}

/// Configs as they apply to one window.
///
/// Resolves the global configs against the window's project overrides and any servers
/// disabled for the rest of the window's lifetime.
pub struct WindowConfigs {
	global: ClientConfigs,
	state: RwLock<WindowConfigState>,
}

impl WindowConfigs {
	/// Resolves `global` without project overrides.
	pub fn new(global: ClientConfigs) -> Self {
		Self::with_overrides(global, ProjectOverrides::new())
	}

	/// Resolves `global` against `overrides`.
	pub fn with_overrides(global: ClientConfigs, overrides: ProjectOverrides) -> Self {
		let configs = Self {
			global,
			state: RwLock::new(WindowConfigState {
				all: Vec::new(),
				overrides,
				temporarily_disabled: HashSet::new(),
			}),
		};
		configs.update();
		configs
	}

	/// All resolved configs.
	pub fn all(&self) -> Vec<Arc<ClientConfig>> {
		self.state.read().all.clone()
	}

	/// A resolved config by name.
	pub fn get(&self, name: &str) -> Option<Arc<ClientConfig>> {
		self.state.read().all.iter().find(|c| c.name == name).cloned()
	}

	/// Configs whose languages include the view's language.
	pub fn syntax_configs(&self, view: &dyn View, include_disabled: bool) -> Vec<Arc<ClientConfig>> {
		let Some(language_id) = view.language_id() else {
			return Vec::new();
		};
		self.state
			.read()
			.all
			.iter()
			.filter(|c| c.supports_language(&language_id) && (c.enabled || include_disabled))
			.cloned()
			.collect()
	}

	/// For each enabled config handling the view's language, the matching language entry.
	pub fn syntax_config_languages(&self, view: &dyn View) -> IndexMap<String, LanguageConfig> {
		let Some(language_id) = view.language_id() else {
			return IndexMap::new();
		};
		self.state
			.read()
			.all
			.iter()
			.filter(|c| c.enabled)
			.filter_map(|c| c.language(&language_id).map(|lang| (c.name.clone(), lang.clone())))
			.collect()
	}

	/// Returns true if an enabled config handles the view's language.
	pub fn is_supported(&self, view: &dyn View) -> bool {
		!self.syntax_configs(view, false).is_empty()
	}

	/// Re-resolves every config from the global set.
	pub fn update(&self) {
		let mut state = self.state.write();
		let all = self
			.global
			.all()
			.iter()
			.map(|config| {
				let mut resolved = apply_project_overrides(config, &state.overrides);
				if state.temporarily_disabled.contains(&resolved.name) {
					resolved.enabled = false;
				}
				Arc::new(resolved)
			})
			.collect();
		state.all = all;
	}

	/// Replaces the project overrides and re-resolves.
	pub fn set_project_overrides(&self, overrides: ProjectOverrides) {
		self.state.write().overrides = overrides;
		self.update();
	}

	/// Disables a config until the window closes or it is explicitly enabled.
	pub fn disable_temporarily(&self, name: &str) {
		debug!(config = name, "disabling config for this window");
		self.state.write().temporarily_disabled.insert(name.to_string());
		self.update();
	}

	/// Returns true if `name` was disabled by [`Self::disable_temporarily`].
	pub fn is_temporarily_disabled(&self, name: &str) -> bool {
		self.state.read().temporarily_disabled.contains(name)
	}

	/// Enables a config for the project, lifting any temporary disable.
	pub fn enable_config(&self, name: &str) {
		self.set_project_enabled(name, true);
	}

	/// Disables a config for the project.
	pub fn disable_config(&self, name: &str) {
		self.set_project_enabled(name, false);
	}

	fn set_project_enabled(&self, name: &str, enabled: bool) {
		{
			let mut state = self.state.write();
			state.overrides.entry(name.to_string()).or_default().enabled = Some(enabled);
			if enabled {
				state.temporarily_disabled.remove(name);
			}
		}
		self.update();
	}
}
