#![forbid(unsafe_code)]

mod admin;
mod game;
mod info;


use std::collections::HashMap;
use std::sync::Arc;

use spectrebot_domain::{ParseIdError, Username};
use spectrebot_platform::{ChatConnection, ChatMessage, ChatSender, IdentityProvider, split_command};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::session::{ChatMessageHandler, SessionEvent};
use crate::stats::StatsProvider;
use crate::store::{AccountStore, StoreError};

pub const COMMAND_PREFIX: char = '!';

/// Failure of a single command invocation; always answered in chat.
#[derive(Debug, Error)]
pub enum CommandError {
	#[error("sender is not allowed to run this command")]
	NotAuthorized,
	/// Upstream data could not be fetched; `what` names it in the reply.
	#[error("could not fetch {what}: {cause:#}")]
	Unavailable { what: &'static str, cause: anyhow::Error },
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("invalid channel: {0}")]
	InvalidChannel(#[from] ParseIdError),
	#[error("session coordinator is not running")]
	CoordinatorGone,
}

/// Everything a command may touch.
#[derive(Clone)]
pub struct CommandDeps {
	pub store: Arc<dyn AccountStore>,
	pub stats: Arc<dyn StatsProvider>,
	pub provider: Arc<dyn IdentityProvider>,
	pub events_tx: mpsc::Sender<SessionEvent>,
	/// Login allowed to run owner-only commands.
	pub owner: Option<String>,
}

impl CommandDeps {
	pub fn is_owner(&self, sender: &ChatSender) -> bool {
		self.owner
			.as_deref()
			.is_some_and(|owner| !owner.is_empty() && sender.login.eq_ignore_ascii_case(owner))
	}
}

/// One invocation of a chat command.
pub struct CommandContext {
	pub connection: Arc<dyn ChatConnection>,
	/// Channel name without `#`.
	pub channel: String,
	pub sender: ChatSender,
	pub args: Vec<String>,
}

impl CommandContext {
	pub fn reply(&self, text: impl AsRef<str>) {
		self.connection.say(&self.channel, text.as_ref());
	}

	/// `@DisplayName` of the sender.
	pub fn mention(&self) -> String {
		format!("@{}", self.sender.mention())
	}

	pub fn channel_username(&self) -> Result<Username, ParseIdError> {
		Username::new(&self.channel)
	}
}

#[async_trait::async_trait]
pub trait CommandHandler: Send + Sync + 'static {
	/// Command token without the prefix, lower-case.
	fn name(&self) -> &'static str;

	async fn execute(&self, ctx: &CommandContext, deps: &CommandDeps) -> Result<(), CommandError>;
}

/// Full set of chat commands, in registration order.
pub fn builtin_commands() -> Vec<Arc<dyn CommandHandler>> {
	vec![
		Arc::new(admin::AddAccount),
		Arc::new(info::Commands),
		Arc::new(info::Help),
		Arc::new(game::LastMatch),
		Arc::new(game::Rank),
		Arc::new(game::Record::default()),
		Arc::new(admin::ResetDb),
	]
}

/// Maps `!name` messages onto registered handlers.
pub struct CommandRouter {
	deps: CommandDeps,
	commands: HashMap<&'static str, Arc<dyn CommandHandler>>,
}

impl CommandRouter {
	pub fn new(deps: CommandDeps, handlers: Vec<Arc<dyn CommandHandler>>) -> Self {
		let mut commands = HashMap::with_capacity(handlers.len());
		for handler in handlers {
			if commands.insert(handler.name(), Arc::clone(&handler)).is_some() {
				warn!(command = handler.name(), "duplicate command registration; last one wins");
			}
		}
		Self { deps, commands }
	}

	pub fn with_builtin_commands(deps: CommandDeps) -> Self {
		Self::new(deps, builtin_commands())
	}

	pub fn command_names(&self) -> Vec<&'static str> {
		let mut names: Vec<&'static str> = self.commands.keys().copied().collect();
		names.sort_unstable();
		names
	}

	/// Run the command in `message`, if any. Returns whether one matched.
	pub async fn dispatch(&self, connection: Arc<dyn ChatConnection>, message: ChatMessage) -> bool {
		let Some((name, args)) = split_command(&message.text, COMMAND_PREFIX) else {
			return false;
		};
		let Some(handler) = self.commands.get(name.as_str()).cloned() else {
			debug!(command = %name, channel = %message.channel, "unknown command");
			return false;
		};

		let ctx = CommandContext {
			connection,
			channel: message.channel,
			sender: message.sender,
			args,
		};
		let command = handler.name();
		metrics::counter!("spectrebot_commands_total", "command" => command).increment(1);
		debug!(command, channel = %ctx.channel, sender = %ctx.sender.login, "dispatching command");

		if let Err(e) = handler.execute(&ctx, &self.deps).await {
			metrics::counter!("spectrebot_command_failures_total", "command" => command).increment(1);
			let mention = ctx.mention();
			match e {
				CommandError::NotAuthorized => {
					debug!(command, sender = %ctx.sender.login, "command refused");
					ctx.reply(format!("{mention}, you do not have permission to run this command."));
				}
				CommandError::Unavailable { what, cause } => {
					warn!(command, channel = %ctx.channel, error = %cause, "command data unavailable");
					ctx.reply(format!("{mention}, Sorry, I couldn't fetch the {what}."));
				}
				other => {
					warn!(command, channel = %ctx.channel, error = %other, "command failed");
					ctx.reply(format!("{mention}, there was an error executing the command."));
				}
			}
		}
		true
	}
}

#[async_trait::async_trait]
impl ChatMessageHandler for CommandRouter {
	async fn handle(&self, connection: Arc<dyn ChatConnection>, message: ChatMessage) {
		self.dispatch(connection, message).await;
	}
}
