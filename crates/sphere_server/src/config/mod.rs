#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_BIND: &str = "0.0.0.0:8080";

/// Default config path: `~/.sphere/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".sphere").join("config.toml"))
}

/// Load the server config from TOML plus `SPHERE_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_overrides(&mut cfg, |key| std::env::var(key).ok());
	cfg.validate();

	Ok(cfg)
}

/// A secret that never shows up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(value: impl Into<String>) -> Self {
		Self(value.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	/// Shared secret for internal endpoints such as `/internal/notify`.
	pub auth_token: Option<SecretString>,
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Listen address for the websocket and HTTP routes (host:port).
	pub bind: String,
	/// Optional Prometheus exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret for user tokens. Without it every connection is anonymous.
	pub auth_hmac_secret: Option<SecretString>,
	/// Refuse connections that present no token.
	pub require_identity: bool,
	/// Largest inbound text frame; larger frames are dropped.
	pub max_frame_bytes: usize,
	pub outbound_queue_capacity: usize,
	/// Per-recipient enqueue deadline during fan-out.
	pub send_timeout: Duration,
	pub ping_interval: Duration,
	/// Inbound event limiter; zero in either field disables it.
	pub event_rate_limit_burst: u32,
	pub event_rate_limit_per_minute: u32,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			bind: DEFAULT_BIND.to_string(),
			metrics_bind: None,
			auth_hmac_secret: None,
			require_identity: false,
			max_frame_bytes: sphere_protocol::DEFAULT_MAX_FRAME_SIZE,
			outbound_queue_capacity: 256,
			send_timeout: Duration::from_millis(2_000),
			ping_interval: Duration::from_secs(30),
			event_rate_limit_burst: 0,
			event_rate_limit_per_minute: 0,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// `sqlite:`, `postgres:` or `mysql:` URL. Unset means in-memory.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	auth_token: Option<String>,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	require_identity: Option<bool>,
	max_frame_bytes: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	send_timeout_ms: Option<u64>,
	ping_interval_secs: Option<u64>,
	event_rate_limit_burst: Option<u32>,
	event_rate_limit_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();

		Self {
			auth_token: non_empty(file.auth_token).map(SecretString::new),
			server: ServerSettings {
				bind: non_empty(file.server.bind).unwrap_or(defaults.bind),
				metrics_bind: non_empty(file.server.metrics_bind),
				auth_hmac_secret: non_empty(file.server.auth_hmac_secret).map(SecretString::new),
				require_identity: file.server.require_identity.unwrap_or(defaults.require_identity),
				max_frame_bytes: file.server.max_frame_bytes.unwrap_or(defaults.max_frame_bytes),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.unwrap_or(defaults.outbound_queue_capacity),
				send_timeout: file
					.server
					.send_timeout_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.send_timeout),
				ping_interval: file
					.server
					.ping_interval_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.ping_interval),
				event_rate_limit_burst: file.server.event_rate_limit_burst.unwrap_or(0),
				event_rate_limit_per_minute: file.server.event_rate_limit_per_minute.unwrap_or(0),
			},
			persistence: PersistenceSettings {
				database_url: non_empty(file.persistence.database_url),
			},
		}
	}

	fn validate(&mut self) {
		let defaults = ServerSettings::default();

		if self.server.max_frame_bytes == 0 {
			warn!("server config: max_frame_bytes = 0; using default");
			self.server.max_frame_bytes = defaults.max_frame_bytes;
		}
		if self.server.outbound_queue_capacity == 0 {
			warn!("server config: outbound_queue_capacity = 0; using default");
			self.server.outbound_queue_capacity = defaults.outbound_queue_capacity;
		}
		if self.server.send_timeout.is_zero() {
			warn!("server config: send_timeout_ms = 0; using default");
			self.server.send_timeout = defaults.send_timeout;
		}
		if self.server.ping_interval.is_zero() {
			self.server.ping_interval = defaults.ping_interval;
		}
		if self.server.require_identity && self.server.auth_hmac_secret.is_none() {
			warn!("server config: require_identity is set but auth_hmac_secret is missing; every connection will be refused");
		}
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

fn apply_overrides(cfg: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
	let get = |key: &str| non_empty(lookup(key));

	if let Some(v) = get("SPHERE_AUTH_TOKEN") {
		cfg.auth_token = Some(SecretString::new(v));
		info!("server auth: auth_token overridden by env");
	}

	if let Some(v) = get("SPHERE_BIND") {
		cfg.server.bind = v;
		info!(bind = %cfg.server.bind, "server config: bind overridden by env");
	}

	if let Some(v) = get("SPHERE_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = get("SPHERE_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = get("SPHERE_REQUIRE_IDENTITY")
		&& let Some(required) = parse_env_bool(&v)
	{
		cfg.server.require_identity = required;
		info!(required, "server config: require_identity overridden by env");
	}

	if let Some(v) = get("SPHERE_MAX_FRAME_BYTES")
		&& let Ok(max) = v.parse::<usize>()
	{
		cfg.server.max_frame_bytes = max;
		info!(max, "server config: max_frame_bytes overridden by env");
	}

	if let Some(v) = get("SPHERE_OUTBOUND_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.parse::<usize>()
	{
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Some(v) = get("SPHERE_SEND_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.server.send_timeout = Duration::from_millis(ms);
		info!(ms, "server config: send_timeout_ms overridden by env");
	}

	if let Some(v) = get("SPHERE_PING_INTERVAL_SECS")
		&& let Ok(secs) = v.parse::<u64>()
	{
		cfg.server.ping_interval = Duration::from_secs(secs);
		info!(secs, "server config: ping_interval_secs overridden by env");
	}

	if let Some(v) = get("SPHERE_EVENT_RATE_LIMIT_BURST")
		&& let Ok(burst) = v.parse::<u32>()
	{
		cfg.server.event_rate_limit_burst = burst;
		info!(burst, "server config: event_rate_limit_burst overridden by env");
	}

	if let Some(v) = get("SPHERE_EVENT_RATE_LIMIT_PER_MINUTE")
		&& let Ok(rate) = v.parse::<u32>()
	{
		cfg.server.event_rate_limit_per_minute = rate;
		info!(rate, "server config: event_rate_limit_per_minute overridden by env");
	}

	if let Some(v) = get("SPHERE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}
}
