#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use spectrebot_domain::SecretString;
use tracing::{info, warn};

use crate::session::{CoordinatorConfig, SchedulerConfig};

/// Default config path: `~/.spectrebot/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".spectrebot").join("config.toml"))
}

/// Load the bot config from TOML, then apply `SPECTREBOT_*` env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<BotConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = BotConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
	cfg.warn_on_gaps();

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct BotConfig {
	pub server: ServerSettings,
	pub twitch: TwitchSettings,
	pub session: SessionSettings,
	pub persistence: PersistenceSettings,
	pub bot: BotSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// HTTP bind address for the OAuth, status and health routes.
	pub http_bind: String,
	/// Externally reachable base URL, used in logs.
	pub public_url: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret for the OAuth `state` parameter.
	pub state_secret: Option<SecretString>,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			http_bind: "0.0.0.0:3000".to_string(),
			public_url: None,
			metrics_bind: None,
			state_secret: None,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct TwitchSettings {
	pub client_id: Option<String>,
	pub client_secret: Option<SecretString>,
	pub redirect_uri: Option<String>,
	/// Empty means the default scope set.
	pub scopes: Vec<String>,
	/// Shared bot identity; when both are set chat sessions use it instead
	/// of each account's own token.
	pub bot_username: Option<String>,
	pub bot_token: Option<SecretString>,
	pub irc_ws_url: Option<String>,
	pub helix_base_url: Option<String>,
	pub oauth_base_url: Option<String>,
}

impl TwitchSettings {
	pub fn bot_identity(&self) -> Option<(String, SecretString)> {
		match (&self.bot_username, &self.bot_token) {
			(Some(login), Some(token)) => Some((login.clone(), token.clone())),
			_ => None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
	pub refresh_lead: Duration,
	pub min_refresh_delay: Duration,
	pub retry_delay: Duration,
	pub sweep_interval: Duration,
	pub connect_timeout: Duration,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			refresh_lead: Duration::from_secs(300),
			min_refresh_delay: Duration::from_secs(60),
			retry_delay: Duration::from_secs(60),
			sweep_interval: Duration::from_secs(60),
			connect_timeout: Duration::from_secs(10),
		}
	}
}

impl SessionSettings {
	pub fn scheduler_config(&self) -> SchedulerConfig {
		SchedulerConfig {
			refresh_lead: self.refresh_lead,
			min_refresh_delay: self.min_refresh_delay,
			retry_delay: self.retry_delay,
		}
	}

	pub fn coordinator_config(&self) -> CoordinatorConfig {
		CoordinatorConfig {
			sweep_interval: self.sweep_interval,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Database URL (`sqlite:`, `postgres:` or `mysql:`); in-memory when unset.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BotSettings {
	/// Login allowed to run owner-only chat commands.
	pub owner: Option<String>,
	pub stats_base_url: Option<String>,
	pub notify_webhook_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	twitch: FileTwitchSettings,

	#[serde(default)]
	session: FileSessionSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	bot: FileBotSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	http_bind: Option<String>,
	public_url: Option<String>,
	metrics_bind: Option<String>,
	state_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileTwitchSettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	redirect_uri: Option<String>,
	#[serde(default)]
	scopes: Vec<String>,
	bot_username: Option<String>,
	bot_token: Option<String>,
	irc_ws_url: Option<String>,
	helix_base_url: Option<String>,
	oauth_base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSessionSettings {
	refresh_lead_secs: Option<u64>,
	min_refresh_delay_secs: Option<u64>,
	retry_delay_secs: Option<u64>,
	sweep_interval_secs: Option<u64>,
	connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBotSettings {
	owner: Option<String>,
	stats_base_url: Option<String>,
	notify_webhook_url: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn oauth_token(v: Option<String>) -> Option<SecretString> {
	non_empty(v).map(|s| SecretString::new(s.strip_prefix("oauth:").unwrap_or(&s).to_string()))
}

impl BotConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = SessionSettings::default();
		let secs = |v: Option<u64>, d: Duration| v.map(Duration::from_secs).unwrap_or(d);
		let server_defaults = ServerSettings::default();

		Self {
			server: ServerSettings {
				http_bind: non_empty(file.server.http_bind).unwrap_or(server_defaults.http_bind),
				public_url: non_empty(file.server.public_url),
				metrics_bind: non_empty(file.server.metrics_bind),
				state_secret: non_empty(file.server.state_secret).map(SecretString::new),
			},
			twitch: TwitchSettings {
				client_id: non_empty(file.twitch.client_id),
				client_secret: non_empty(file.twitch.client_secret).map(SecretString::new),
				redirect_uri: non_empty(file.twitch.redirect_uri),
				scopes: file
					.twitch
					.scopes
					.into_iter()
					.map(|s| s.trim().to_string())
					.filter(|s| !s.is_empty())
					.collect(),
				bot_username: non_empty(file.twitch.bot_username).map(|s| s.to_ascii_lowercase()),
				bot_token: oauth_token(file.twitch.bot_token),
				irc_ws_url: non_empty(file.twitch.irc_ws_url),
				helix_base_url: non_empty(file.twitch.helix_base_url),
				oauth_base_url: non_empty(file.twitch.oauth_base_url),
			},
			session: SessionSettings {
				refresh_lead: secs(file.session.refresh_lead_secs, defaults.refresh_lead),
				min_refresh_delay: secs(file.session.min_refresh_delay_secs, defaults.min_refresh_delay),
				retry_delay: secs(file.session.retry_delay_secs, defaults.retry_delay),
				sweep_interval: secs(file.session.sweep_interval_secs, defaults.sweep_interval),
				connect_timeout: secs(file.session.connect_timeout_secs, defaults.connect_timeout),
			},
			persistence: PersistenceSettings {
				database_url: non_empty(file.persistence.database_url),
			},
			bot: BotSettings {
				owner: non_empty(file.bot.owner).map(|s| s.to_ascii_lowercase()),
				stats_base_url: non_empty(file.bot.stats_base_url),
				notify_webhook_url: non_empty(file.bot.notify_webhook_url),
			},
		}
	}

	fn warn_on_gaps(&self) {
		if self.twitch.client_id.is_none() || self.twitch.client_secret.is_none() {
			warn!("twitch config: client_id/client_secret missing; OAuth login and token refresh will fail");
		}
		if self.twitch.redirect_uri.is_none() {
			warn!("twitch config: no redirect_uri; /login cannot complete");
		}
		if self.twitch.bot_username.is_some() != self.twitch.bot_token.is_some() {
			warn!("twitch config: bot_username and bot_token must be set together; using per-account identities");
		}
		if self.server.state_secret.is_none() {
			warn!("server config: no state_secret; OAuth state is not verified");
		}
		if self.session.retry_delay.is_zero() {
			warn!("session config: retry_delay of zero retries refreshes in a tight loop");
		}
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

fn apply_env_overrides(cfg: &mut BotConfig, env: impl Fn(&str) -> Option<String>) {
	let string = |key: &str| non_empty(env(key));
	let secs = |key: &str| env(key).and_then(|v| v.trim().parse::<u64>().ok());

	if let Some(v) = string("SPECTREBOT_HTTP_BIND") {
		cfg.server.http_bind = v;
		info!("server config: http_bind overridden by env");
	}

	if let Some(v) = string("SPECTREBOT_PUBLIC_URL") {
		cfg.server.public_url = Some(v);
		info!("server config: public_url overridden by env");
	}

	if let Some(v) = string("SPECTREBOT_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = string("SPECTREBOT_STATE_SECRET") {
		cfg.server.state_secret = Some(SecretString::new(v));
		info!("server config: state_secret overridden by env");
	}

	if let Some(v) = string("SPECTREBOT_TWITCH_CLIENT_ID") {
		cfg.twitch.client_id = Some(v);
		info!("twitch config: client_id overridden by env");
	}

	if let Some(v) = string("SPECTREBOT_TWITCH_CLIENT_SECRET") {
		cfg.twitch.client_secret = Some(SecretString::new(v));
		info!("twitch config: client_secret overridden by env");
	}

	if let Some(v) = string("SPECTREBOT_TWITCH_REDIRECT_URI") {
		cfg.twitch.redirect_uri = Some(v);
		info!("twitch config: redirect_uri overridden by env");
	}

	if let Some(v) = string("SPECTREBOT_TWITCH_SCOPES") {
		cfg.twitch.scopes = v.split([' ', ',']).filter(|s| !s.is_empty()).map(str::to_string).collect();
		info!(scopes = cfg.twitch.scopes.len(), "twitch config: scopes overridden by env");
	}

	if let Some(v) = string("SPECTREBOT_TWITCH_BOT_USERNAME") {
		cfg.twitch.bot_username = Some(v.to_ascii_lowercase());
		info!("twitch config: bot_username overridden by env");
	}

	if let Some(token) = oauth_token(env("SPECTREBOT_TWITCH_BOT_TOKEN")) {
		cfg.twitch.bot_token = Some(token);
		info!("twitch config: bot_token overridden by env");
	}

	if let Some(v) = string("SPECTREBOT_TWITCH_IRC_WS_URL") {
		cfg.twitch.irc_ws_url = Some(v);
		info!("twitch config: irc_ws_url overridden by env");
	}

	if let Some(v) = string("SPECTREBOT_TWITCH_HELIX_BASE_URL") {
		cfg.twitch.helix_base_url = Some(v);
		info!("twitch config: helix_base_url overridden by env");
	}

	if let Some(v) = string("SPECTREBOT_TWITCH_OAUTH_BASE_URL") {
		cfg.twitch.oauth_base_url = Some(v);
		info!("twitch config: oauth_base_url overridden by env");
	}

	if let Some(s) = secs("SPECTREBOT_REFRESH_LEAD_SECS") {
		cfg.session.refresh_lead = Duration::from_secs(s);
		info!(secs = s, "session config: refresh_lead overridden by env");
	}

	if let Some(s) = secs("SPECTREBOT_MIN_REFRESH_DELAY_SECS") {
		cfg.session.min_refresh_delay = Duration::from_secs(s);
		info!(secs = s, "session config: min_refresh_delay overridden by env");
	}

	if let Some(s) = secs("SPECTREBOT_RETRY_DELAY_SECS") {
		cfg.session.retry_delay = Duration::from_secs(s);
		info!(secs = s, "session config: retry_delay overridden by env");
	}

	if let Some(s) = secs("SPECTREBOT_SWEEP_INTERVAL_SECS") {
		cfg.session.sweep_interval = Duration::from_secs(s);
		info!(secs = s, "session config: sweep_interval overridden by env");
	}

	if let Some(s) = secs("SPECTREBOT_CONNECT_TIMEOUT_SECS") {
		cfg.session.connect_timeout = Duration::from_secs(s);
		info!(secs = s, "session config: connect_timeout overridden by env");
	}

	if let Some(v) = string("SPECTREBOT_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(v) = string("SPECTREBOT_OWNER") {
		cfg.bot.owner = Some(v.to_ascii_lowercase());
		info!("bot config: owner overridden by env");
	}

	if let Some(v) = string("SPECTREBOT_STATS_BASE_URL") {
		cfg.bot.stats_base_url = Some(v);
		info!("bot config: stats_base_url overridden by env");
	}

	if let Some(v) = string("SPECTREBOT_NOTIFY_WEBHOOK_URL") {
		cfg.bot.notify_webhook_url = Some(v);
		info!("bot config: notify_webhook_url overridden by env");
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	fn parse(toml_src: &str) -> BotConfig {
		let file: FileConfig = toml::from_str(toml_src).expect("toml");
		BotConfig::from_file(file)
	}

	#[test]
	fn empty_file_uses_defaults() {
		let cfg = parse("");
		assert_eq!(cfg.server.http_bind, "0.0.0.0:3000");
		assert_eq!(cfg.session.refresh_lead, Duration::from_secs(300));
		assert_eq!(cfg.session.min_refresh_delay, Duration::from_secs(60));
		assert_eq!(cfg.session.retry_delay, Duration::from_secs(60));
		assert_eq!(cfg.session.sweep_interval, Duration::from_secs(60));
		assert_eq!(cfg.session.connect_timeout, Duration::from_secs(10));
		assert!(cfg.persistence.database_url.is_none());
		assert!(cfg.twitch.bot_identity().is_none());
	}

	#[test]
	fn file_values_are_normalized() {
		let cfg = parse(
			r#"
			[server]
			http_bind = "127.0.0.1:8080"
			state_secret = "  "

			[twitch]
			client_id = "abc"
			scopes = ["user:bot", " ", "channel:bot"]
			bot_username = "SpectreBot"
			bot_token = "oauth:xyz"

			[session]
			refresh_lead_secs = 600
			sweep_interval_secs = 0

			[bot]
			owner = "Antiparty"
			"#,
		);
		assert_eq!(cfg.server.http_bind, "127.0.0.1:8080");
		assert!(cfg.server.state_secret.is_none(), "blank secret is treated as unset");
		assert_eq!(cfg.twitch.scopes, vec!["user:bot", "channel:bot"]);
		let (login, token) = cfg.twitch.bot_identity().expect("bot identity");
		assert_eq!(login, "spectrebot");
		assert_eq!(token.expose(), "xyz");
		assert_eq!(cfg.session.scheduler_config().refresh_lead, Duration::from_secs(600));
		assert!(cfg.session.coordinator_config().sweep_interval.is_zero());
		assert_eq!(cfg.bot.owner.as_deref(), Some("antiparty"));
	}

	#[test]
	fn env_overrides_win_over_file() {
		let mut cfg = parse(
			r#"
			[persistence]
			database_url = "sqlite://file.db"
			"#,
		);
		let env: HashMap<&str, &str> = HashMap::from([
			("SPECTREBOT_DATABASE_URL", "postgres://db/spectre"),
			("SPECTREBOT_RETRY_DELAY_SECS", " 15 "),
			("SPECTREBOT_SWEEP_INTERVAL_SECS", "not-a-number"),
			("SPECTREBOT_TWITCH_SCOPES", "user:bot,channel:bot user:read:chat"),
			("SPECTREBOT_OWNER", ""),
		]);
		apply_env_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

		assert_eq!(cfg.persistence.database_url.as_deref(), Some("postgres://db/spectre"));
		assert_eq!(cfg.session.retry_delay, Duration::from_secs(15));
		assert_eq!(cfg.session.sweep_interval, Duration::from_secs(60));
		assert_eq!(cfg.twitch.scopes.len(), 3);
		assert!(cfg.bot.owner.is_none());
	}

	#[test]
	fn missing_file_is_not_an_error() {
		let path = std::env::temp_dir().join(format!("spectrebot-missing-{}.toml", std::process::id()));
		assert!(read_toml_if_exists(&path).expect("read").is_none());
	}
}
