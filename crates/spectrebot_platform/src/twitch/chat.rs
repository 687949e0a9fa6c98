#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::irc::IrcMessage;
use crate::{ChatConnection, ChatCredentials, ChatEvent, ChatEventTx, ChatTransport, SecretString, new_session_id};

pub(crate) type IrcWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Twitch chat (IRC over WebSocket) configuration.
#[derive(Debug, Clone)]
pub struct TwitchChatConfig {
	pub irc_ws_url: String,
	/// Shared bot identity; when absent each channel logs in as itself.
	pub bot: Option<ChatCredentials>,
	pub connect_timeout: Duration,
	pub outbound_capacity: usize,
}

impl TwitchChatConfig {
	pub fn new(bot: Option<ChatCredentials>) -> Self {
		Self {
			irc_ws_url: "wss://irc-ws.chat.twitch.tv:443".to_string(),
			bot,
			connect_timeout: Duration::from_secs(10),
			outbound_capacity: 64,
		}
	}
}

/// Opens one IRC session per joined channel.
#[derive(Debug, Clone)]
pub struct TwitchChatTransport {
	cfg: TwitchChatConfig,
}

impl TwitchChatTransport {
	pub fn new(cfg: TwitchChatConfig) -> Self {
		Self { cfg }
	}

	async fn connect_irc_ws(url: &Url) -> anyhow::Result<IrcWs> {
		let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
			.await
			.context("connect_async to twitch irc ws")?;
		Ok(ws)
	}

	async fn login(ws: &mut IrcWs, creds: &ChatCredentials) -> anyhow::Result<()> {
		ws.send(Message::text("CAP REQ :twitch.tv/tags twitch.tv/commands"))
			.await
			.context("send CAP REQ")?;
		ws.send(Message::text(format!("PASS {}", pass_value(&creds.oauth_token))))
			.await
			.context("send PASS")?;
		ws.send(Message::text(format!("NICK {}", creds.login.to_ascii_lowercase())))
			.await
			.context("send NICK")?;
		Ok(())
	}

	async fn read_until_welcome(ws: &mut IrcWs) -> anyhow::Result<()> {
		loop {
			let Some(msg) = ws.next().await else {
				anyhow::bail!("irc ws closed before welcome");
			};
			let msg = msg.context("irc ws read")?;

			match msg {
				Message::Text(t) => {
					for line in t.as_str().lines() {
						let Some(parsed) = IrcMessage::parse(line) else {
							continue;
						};
						match parsed.command.as_str() {
							"001" => return Ok(()),
							"PING" => {
								let _ = ws.send(Message::text(pong_line(&parsed))).await;
							}
							"NOTICE" => {
								let notice = parsed.trailing().unwrap_or_default();
								anyhow::bail!("twitch irc login rejected: {notice}");
							}
							_ => {}
						}
					}
				}
				Message::Ping(p) => {
					let _ = ws.send(Message::Pong(p)).await;
				}
				Message::Close(c) => {
					anyhow::bail!("irc ws closed before welcome: close={c:?}");
				}
				_ => {}
			}
		}
	}
}

fn pass_value(token: &SecretString) -> String {
	let raw = token.expose().trim();
	if raw.starts_with("oauth:") {
		raw.to_string()
	} else {
		format!("oauth:{raw}")
	}
}

fn pong_line(ping: &IrcMessage) -> String {
	match ping.trailing() {
		Some(t) => format!("PONG :{t}"),
		None => "PONG".to_string(),
	}
}

#[async_trait::async_trait]
impl ChatTransport for TwitchChatTransport {
	fn requires_user_credential(&self) -> bool {
		self.cfg.bot.is_none()
	}

	async fn connect(
		&self,
		channel: &str,
		user_credentials: Option<ChatCredentials>,
		events: ChatEventTx,
	) -> anyhow::Result<Arc<dyn ChatConnection>> {
		let channel = channel.trim().trim_start_matches('#').to_ascii_lowercase();
		let creds = match (&self.cfg.bot, user_credentials) {
			(Some(bot), _) => bot.clone(),
			(None, Some(user)) => user,
			(None, None) => anyhow::bail!("no chat credentials for #{channel}"),
		};
		let url = Url::parse(&self.cfg.irc_ws_url).context("parse twitch irc ws url")?;

		let ws = tokio::time::timeout(self.cfg.connect_timeout, async {
			let mut ws = Self::connect_irc_ws(&url).await?;
			Self::login(&mut ws, &creds).await?;
			Self::read_until_welcome(&mut ws).await?;
			ws.send(Message::text(format!("JOIN #{channel}")))
				.await
				.context("send JOIN")?;
			anyhow::Ok(ws)
		})
		.await
		.with_context(|| format!("twitch irc connect to #{channel} timed out"))??;

		let session_id = new_session_id();
		info!(%channel, %session_id, login = %creds.login, "twitch chat session connected");
		metrics::counter!("spectrebot_chat_sessions_opened_total").increment(1);

		let _ = events.send(ChatEvent::Connected { channel: channel.clone() }).await;

		let (outbound_tx, outbound_rx) = mpsc::channel(self.cfg.outbound_capacity.max(1));
		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		let task = tokio::spawn(run_session(
			ws,
			SessionCtx {
				channel: channel.clone(),
				self_login: creds.login.to_ascii_lowercase(),
				session_id: session_id.clone(),
				events,
			},
			outbound_rx,
			shutdown_rx,
		));

		Ok(Arc::new(TwitchChatConnection {
			session_id,
			outbound: outbound_tx,
			shutdown: Mutex::new(Some(shutdown_tx)),
			task: Mutex::new(Some(task)),
		}))
	}
}

struct SessionCtx {
	channel: String,
	self_login: String,
	session_id: String,
	events: ChatEventTx,
}

enum LineOutcome {
	Continue,
	Reply(String),
	Reconnect,
}

impl SessionCtx {
	async fn handle_line(&self, line: &str) -> LineOutcome {
		let Some(msg) = IrcMessage::parse(line) else {
			return LineOutcome::Continue;
		};

		match msg.command.as_str() {
			"PING" => LineOutcome::Reply(pong_line(&msg)),
			"RECONNECT" => LineOutcome::Reconnect,
			"PRIVMSG" => {
				let Some(chat) = msg.to_chat_message() else {
					return LineOutcome::Continue;
				};
				if chat.sender.login == self.self_login {
					return LineOutcome::Continue;
				}
				if self.events.send(ChatEvent::Message(chat)).await.is_err() {
					debug!(channel = %self.channel, "chat events receiver dropped");
				}
				LineOutcome::Continue
			}
			"NOTICE" => {
				debug!(channel = %self.channel, notice = ?msg.trailing(), "twitch irc notice");
				LineOutcome::Continue
			}
			_ => LineOutcome::Continue,
		}
	}
}

async fn run_session(
	mut ws: IrcWs,
	ctx: SessionCtx,
	mut outbound_rx: mpsc::Receiver<String>,
	mut shutdown_rx: oneshot::Receiver<()>,
) {
	let reason = 'session: loop {
		tokio::select! {
			_ = &mut shutdown_rx => {
				let _ = ws.send(Message::text(format!("PART #{}", ctx.channel))).await;
				let _ = ws.close(None).await;
				debug!(channel = %ctx.channel, session_id = %ctx.session_id, "twitch chat session closed locally");
				return;
			}

			out = outbound_rx.recv() => {
				let Some(line) = out else {
					let _ = ws.close(None).await;
					return;
				};
				if let Err(e) = ws.send(Message::text(line)).await {
					break Some(format!("send failed: {e}"));
				}
			}

			msg = ws.next() => {
				match msg {
					None => break None,
					Some(Err(e)) => break Some(e.to_string()),
					Some(Ok(Message::Text(t))) => {
						for line in t.as_str().lines() {
							match ctx.handle_line(line).await {
								LineOutcome::Continue => {}
								LineOutcome::Reply(reply) => {
									if let Err(e) = ws.send(Message::text(reply)).await {
										break 'session Some(format!("send failed: {e}"));
									}
								}
								LineOutcome::Reconnect => break 'session Some("server requested reconnect".to_string()),
							}
						}
					}
					Some(Ok(Message::Ping(p))) => {
						let _ = ws.send(Message::Pong(p)).await;
					}
					Some(Ok(Message::Close(frame))) => break Some(format!("closed by server: {frame:?}")),
					Some(Ok(_)) => {}
				}
			}
		}
	};

	warn!(channel = %ctx.channel, session_id = %ctx.session_id, reason = ?reason, "twitch chat session lost");
	metrics::counter!("spectrebot_chat_sessions_lost_total").increment(1);
	let _ = ctx
		.events
		.send(ChatEvent::Disconnected {
			channel: ctx.channel.clone(),
			reason,
		})
		.await;
}

/// Handle to a running Twitch chat session.
struct TwitchChatConnection {
	session_id: String,
	outbound: mpsc::Sender<String>,
	shutdown: Mutex<Option<oneshot::Sender<()>>>,
	task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait::async_trait]
impl ChatConnection for TwitchChatConnection {
	fn session_id(&self) -> &str {
		&self.session_id
	}

	fn say(&self, channel: &str, text: &str) {
		let channel = channel.trim_start_matches('#');
		let text = text.replace(['\r', '\n'], " ");
		if let Err(e) = self.outbound.try_send(format!("PRIVMSG #{channel} :{text}")) {
			metrics::counter!("spectrebot_chat_replies_dropped_total").increment(1);
			warn!(%channel, session_id = %self.session_id, error = %e, "chat reply dropped");
		}
	}

	async fn close(&self) {
		if let Some(tx) = self.shutdown.lock().take() {
			let _ = tx.send(());
		}
		let task = self.task.lock().take();
		if let Some(task) = task {
			let _ = task.await;
		}
	}
}
