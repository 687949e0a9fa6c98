#![forbid(unsafe_code)]

use tracing::info;

use super::{CommandContext, CommandDeps, CommandError, CommandHandler};
use crate::session::SessionEvent;

/// `!addaccount <playerId>`: link a game player to this channel.
pub struct AddAccount;

#[async_trait::async_trait]
impl CommandHandler for AddAccount {
	fn name(&self) -> &'static str {
		"addaccount"
	}

	async fn execute(&self, ctx: &CommandContext, deps: &CommandDeps) -> Result<(), CommandError> {
		let allowed =
			ctx.sender.is_broadcaster_of(&ctx.channel) || ctx.sender.is_moderator() || deps.is_owner(&ctx.sender);
		if !allowed {
			return Err(CommandError::NotAuthorized);
		}

		let Some(player_id) = ctx.args.first() else {
			ctx.reply(format!("{}, please provide a valid player ID.", ctx.mention()));
			return Ok(());
		};

		let username = ctx.channel_username()?;
		deps.store.link_player(&username, player_id).await?;
		info!(%username, %player_id, by = %ctx.sender.login, "player linked from chat");

		ctx.reply(format!(
			"{}, your account has been successfully linked with player ID: {player_id}",
			ctx.mention()
		));
		deps.events_tx
			.send(SessionEvent::PlayerLinked(username))
			.await
			.map_err(|_| CommandError::CoordinatorGone)?;
		Ok(())
	}
}

/// `!resetdb`: owner-only wipe of every linked account.
pub struct ResetDb;

#[async_trait::async_trait]
impl CommandHandler for ResetDb {
	fn name(&self) -> &'static str {
		"resetdb"
	}

	async fn execute(&self, ctx: &CommandContext, deps: &CommandDeps) -> Result<(), CommandError> {
		if !deps.is_owner(&ctx.sender) {
			return Err(CommandError::NotAuthorized);
		}

		// The reset closes this connection too, so the reply goes out first.
		let permit = deps
			.events_tx
			.reserve()
			.await
			.map_err(|_| CommandError::CoordinatorGone)?;
		ctx.reply(format!("{}, the database has been reset successfully.", ctx.mention()));
		info!(by = %ctx.sender.login, channel = %ctx.channel, "database reset requested from chat");
		permit.send(SessionEvent::ResetRequested {
			requested_by: ctx.sender.login.clone(),
		});
		Ok(())
	}
}
