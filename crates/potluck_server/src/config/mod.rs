#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow, bail};
use potluck_domain::{InviteCode, RoomId, RoomVisibility, SecretString};
use serde::Deserialize;
use tracing::info;

/// Default config path: `~/.potluck/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".potluck").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg)?;

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub registry: RegistrySettings,
	pub persistence: PersistenceSettings,
	/// Rooms created at startup, before the accept loop.
	pub rooms: Vec<RoomSeed>,
}

/// Server settings loaded by the server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Name announced in the `Welcome` frame.
	pub server_name: String,
	/// Maximum wire frame payload size.
	pub max_frame_size: usize,
	/// Number of stored messages returned on join.
	pub history_limit: usize,
	/// Per-member fan-out queue depth before drops begin.
	pub subscriber_queue_capacity: usize,
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			server_name: "potluck".to_string(),
			max_frame_size: potluck_protocol::DEFAULT_MAX_FRAME_SIZE,
			history_limit: 50,
			subscriber_queue_capacity: 1024,
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			health_bind: None,
		}
	}
}

/// How session identities are established at `Hello` time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
	/// Trust the display name carried in the handshake.
	#[default]
	Anonymous,
	/// Require a signed token; the username comes from its claims.
	Token,
}

#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	pub mode: AuthMode,
	/// HMAC secret for stateless access tokens; required in token mode.
	pub token_secret: Option<SecretString>,
}

#[derive(Debug, Clone)]
pub struct RegistrySettings {
	/// Whether joining an unknown room creates it as public.
	pub create_on_demand: bool,
}

impl Default for RegistrySettings {
	fn default() -> Self {
		Self { create_on_demand: true }
	}
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable durable message history.
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

/// One `[[rooms]]` catalog entry.
#[derive(Debug, Clone)]
pub struct RoomSeed {
	pub room: RoomId,
	pub visibility: RoomVisibility,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	registry: FileRegistrySettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	rooms: Vec<FileRoomSeed>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	server_name: Option<String>,
	max_frame_size: Option<usize>,
	history_limit: Option<usize>,
	subscriber_queue_capacity: Option<usize>,
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	mode: Option<String>,
	token_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRegistrySettings {
	create_on_demand: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileRoomSeed {
	name: String,
	visibility: Option<String>,
	invite_code: Option<String>,
}

fn parse_auth_mode(s: &str) -> anyhow::Result<AuthMode> {
	match s.trim().to_ascii_lowercase().as_str() {
		"" | "anonymous" => Ok(AuthMode::Anonymous),
		"token" => Ok(AuthMode::Token),
		other => bail!("unknown auth mode: {other} (use anonymous or token)"),
	}
}

fn seed_from_file(entry: FileRoomSeed) -> anyhow::Result<RoomSeed> {
	let room = RoomId::new(entry.name.clone()).map_err(|e| anyhow!("invalid room name {:?}: {e}", entry.name))?;

	let visibility = match entry.visibility.as_deref().map(str::trim) {
		None | Some("") | Some("public") => {
			if entry.invite_code.as_deref().is_some_and(|c| !c.is_empty()) {
				bail!("room {room}: public rooms must not carry an invite_code");
			}
			RoomVisibility::Public
		}
		Some("private") => {
			let code = entry
				.invite_code
				.filter(|c| !c.is_empty())
				.ok_or_else(|| anyhow!("room {room}: private rooms require a non-empty invite_code"))?;
			RoomVisibility::Private {
				invite_code: InviteCode::new(code).map_err(|e| anyhow!("room {room}: invalid invite_code: {e}"))?,
			}
		}
		Some(other) => bail!("room {room}: unknown visibility: {other} (use public or private)"),
	};

	Ok(RoomSeed { room, visibility })
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let defaults = ServerSettings::default();

		let auth_mode = match file.auth.mode.as_deref() {
			Some(s) => parse_auth_mode(s)?,
			None => AuthMode::Anonymous,
		};

		let mut rooms = Vec::with_capacity(file.rooms.len());
		for entry in file.rooms {
			rooms.push(seed_from_file(entry)?);
		}

		let cfg = Self {
			server: ServerSettings {
				server_name: file
					.server
					.server_name
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.server_name),
				max_frame_size: file.server.max_frame_size.unwrap_or(defaults.max_frame_size),
				history_limit: file.server.history_limit.unwrap_or(defaults.history_limit),
				subscriber_queue_capacity: file
					.server
					.subscriber_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.subscriber_queue_capacity),
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
			auth: AuthSettings {
				mode: auth_mode,
				token_secret: file
					.auth
					.token_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
			},
			registry: RegistrySettings {
				create_on_demand: file.registry.create_on_demand.unwrap_or(true),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			rooms,
		};

		cfg.validate()?;
		Ok(cfg)
	}

	fn validate(&self) -> anyhow::Result<()> {
		if self.auth.mode == AuthMode::Token && self.auth.token_secret.is_none() {
			bail!("auth mode is token but no token_secret configured");
		}
		if self.persistence.enabled && self.persistence.database_url.is_none() {
			bail!("persistence enabled but no database_url configured");
		}
		Ok(())
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) -> anyhow::Result<()> {
	if let Ok(v) = std::env::var("POTLUCK_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("POTLUCK_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("POTLUCK_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("POTLUCK_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("POTLUCK_HISTORY_LIMIT")
		&& let Ok(limit) = v.trim().parse::<usize>()
	{
		cfg.server.history_limit = limit;
		info!(limit, "server config: history_limit overridden by env");
	}

	if let Ok(v) = std::env::var("POTLUCK_SUBSCRIBER_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.subscriber_queue_capacity = capacity;
		info!(capacity, "server config: subscriber_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("POTLUCK_AUTH_MODE") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.mode = parse_auth_mode(&v)?;
			info!(mode = v, "auth config: mode overridden by env");
		}
	}

	if let Ok(v) = std::env::var("POTLUCK_AUTH_TOKEN_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.token_secret = Some(SecretString::new(v));
			info!("auth config: token_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("POTLUCK_CREATE_ON_DEMAND")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.registry.create_on_demand = enabled;
		info!(enabled, "registry config: create_on_demand overridden by env");
	}

	if let Ok(v) = std::env::var("POTLUCK_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("POTLUCK_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	cfg.validate()
}
