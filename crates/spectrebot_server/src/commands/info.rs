#![forbid(unsafe_code)]

use super::{CommandContext, CommandDeps, CommandError, CommandHandler};

const COMMAND_LIST: &str = "!rank !lastmatch !record !addaccount <playerID>";
const SUPPORT_INVITE: &str = "discord.gg/santaigg";

pub struct Commands;

#[async_trait::async_trait]
impl CommandHandler for Commands {
	fn name(&self) -> &'static str {
		"commands"
	}

	async fn execute(&self, ctx: &CommandContext, _deps: &CommandDeps) -> Result<(), CommandError> {
		ctx.reply(format!("{}, current Spectre commands are {COMMAND_LIST}", ctx.mention()));
		Ok(())
	}
}

pub struct Help;

#[async_trait::async_trait]
impl CommandHandler for Help {
	fn name(&self) -> &'static str {
		"help"
	}

	async fn execute(&self, ctx: &CommandContext, _deps: &CommandDeps) -> Result<(), CommandError> {
		ctx.reply(format!(
			"{}, If you need help with the bot, please visit {SUPPORT_INVITE} , Otherwise, current Spectre commands are {COMMAND_LIST}",
			ctx.mention()
		));
		Ok(())
	}
}
