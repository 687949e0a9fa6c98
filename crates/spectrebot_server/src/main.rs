#![forbid(unsafe_code)]

mod commands;
mod config;
mod error;
mod http;
mod notify;
mod session;
mod stats;
mod store;
mod util;

#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use spectrebot_platform::twitch::{TwitchChatConfig, TwitchChatTransport, TwitchIdentityProvider, TwitchOAuthConfig};
use spectrebot_platform::{ChatCredentials, ChatTransport, IdentityProvider, SecretString};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::commands::{CommandDeps, CommandRouter};
use crate::config::BotConfig;
use crate::http::{HealthState, HttpState, spawn_http_server};
use crate::notify::Notifier;
use crate::session::{ConnectionSupervisor, RefreshScheduler, SESSION_EVENTS_CAPACITY, SessionCoordinator};
use crate::stats::{StatsProvider, WavescanClient};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: spectrebot [--config path]\n\
\n\
Options:\n\
\t--config  Config file (default: ~/.spectrebot/config.toml)\n\
\t--help    Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Option<PathBuf> {
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	config_path
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,spectrebot_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("spectrebot_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn identity_provider(cfg: &BotConfig) -> anyhow::Result<TwitchIdentityProvider> {
	let twitch = &cfg.twitch;
	let mut oauth = TwitchOAuthConfig::new(
		twitch.client_id.clone().unwrap_or_default(),
		twitch.client_secret.clone().unwrap_or_else(|| SecretString::new("")),
		twitch.redirect_uri.clone().unwrap_or_default(),
	);
	if !twitch.scopes.is_empty() {
		oauth.scopes = twitch.scopes.clone();
	}
	if let Some(url) = &twitch.oauth_base_url {
		oauth.oauth_base_url = url.clone();
	}
	if let Some(url) = &twitch.helix_base_url {
		oauth.helix_base_url = url.clone();
	}
	TwitchIdentityProvider::new(oauth).context("build twitch identity provider")
}

fn chat_transport(cfg: &BotConfig) -> TwitchChatTransport {
	let bot = cfg
		.twitch
		.bot_identity()
		.map(|(login, oauth_token)| ChatCredentials { login, oauth_token });
	if let Some(bot) = &bot {
		info!(login = %bot.login, "chat sessions use the shared bot identity");
	}

	let mut chat = TwitchChatConfig::new(bot);
	chat.connect_timeout = cfg.session.connect_timeout;
	if let Some(url) = &cfg.twitch.irc_ws_url {
		chat.irc_ws_url = url.clone();
	}
	TwitchChatTransport::new(chat)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let config_path = match parse_args() {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded bot config (toml + env overrides)");

	init_metrics(cfg.server.metrics_bind.as_deref());

	let http_bind: SocketAddr = cfg
		.server
		.http_bind
		.parse()
		.map_err(|e| anyhow!("invalid http_bind {:?}: {e}", cfg.server.http_bind))?;

	let store = crate::store::open_store(cfg.persistence.database_url.as_deref()).await?;
	let (events_tx, events_rx) = mpsc::channel(SESSION_EVENTS_CAPACITY);

	let provider: Arc<dyn IdentityProvider> = Arc::new(identity_provider(&cfg)?);
	let transport: Arc<dyn ChatTransport> = Arc::new(chat_transport(&cfg));

	let scheduler = RefreshScheduler::new(
		Arc::clone(&provider),
		Arc::clone(&store),
		events_tx.clone(),
		cfg.session.scheduler_config(),
	);

	let stats: Arc<dyn StatsProvider> = Arc::new(WavescanClient::new(cfg.bot.stats_base_url.clone())?);
	let router = CommandRouter::with_builtin_commands(CommandDeps {
		store: Arc::clone(&store),
		stats,
		provider: Arc::clone(&provider),
		events_tx: events_tx.clone(),
		owner: cfg.bot.owner.clone(),
	});
	info!(commands = ?router.command_names(), "chat commands registered");

	let supervisor = ConnectionSupervisor::new(transport, Arc::clone(&store), scheduler.clone(), Arc::new(router));

	let notifier = Notifier::new(cfg.bot.notify_webhook_url.clone());
	if notifier.is_enabled() {
		info!("account notifications go to the configured webhook");
	}
	let coordinator = Arc::new(SessionCoordinator::new(
		Arc::clone(&store),
		scheduler,
		supervisor,
		notifier,
		cfg.session.coordinator_config(),
	));

	let report = coordinator.bootstrap().await.context("bootstrap linked accounts")?;
	info!(?report, "bootstrap complete");

	let tasks = Arc::clone(&coordinator).spawn(events_rx);

	let health = HealthState::new();
	spawn_http_server(
		http_bind,
		HttpState {
			coordinator: Arc::clone(&coordinator),
			provider,
			events_tx,
			health: health.clone(),
			state_secret: cfg.server.state_secret.clone(),
		},
	);
	if let Some(public_url) = cfg.server.public_url.as_deref() {
		info!(%public_url, "authorize new accounts at {public_url}/login");
	}

	health.mark_ready();

	tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
	info!("shutting down");

	tasks.abort();
	let cancelled = coordinator.scheduler().cancel_all();
	let closed = coordinator.supervisor().disconnect_all().await;
	info!(cancelled, closed, "shutdown complete");

	Ok(())
}
