#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use parking_lot::Mutex;
use spectrebot_domain::Account;
use tracing::debug;

use super::{CommandContext, CommandDeps, CommandError, CommandHandler};
use crate::stats::PlayerProfile;

/// Linked account for the command's channel, or `None` after replying.
async fn linked_account(ctx: &CommandContext, deps: &CommandDeps) -> Result<Option<(Account, String)>, CommandError> {
	let username = ctx.channel_username()?;
	let account = deps.store.find_by_username(&username).await?;
	match account {
		Some(account) => match account.player_id.clone().filter(|p| !p.trim().is_empty()) {
			Some(player_id) => Ok(Some((account, player_id))),
			None => {
				ctx.reply(format!("{}, no player ID linked to this channel.", ctx.mention()));
				Ok(None)
			}
		},
		None => {
			ctx.reply(format!("{}, no player ID linked to this channel.", ctx.mention()));
			Ok(None)
		}
	}
}

async fn fetch_profile(deps: &CommandDeps, player_id: &str, what: &'static str) -> Result<PlayerProfile, CommandError> {
	deps.stats
		.full_profile(player_id)
		.await
		.map_err(|cause| CommandError::Unavailable { what, cause })
}

/// `!lastmatch`: summary of the linked player's most recent match.
pub struct LastMatch;

#[async_trait::async_trait]
impl CommandHandler for LastMatch {
	fn name(&self) -> &'static str {
		"lastmatch"
	}

	async fn execute(&self, ctx: &CommandContext, deps: &CommandDeps) -> Result<(), CommandError> {
		let Some((account, player_id)) = linked_account(ctx, deps).await? else {
			return Ok(());
		};
		let profile = fetch_profile(deps, &player_id, "last match data").await?;
		let mention = ctx.mention();

		let Some(last) = profile.matches.first() else {
			ctx.reply(format!("{mention}, No matches found for the player."));
			return Ok(());
		};
		let Some(player) = last.player(&player_id) else {
			ctx.reply(format!("{mention}, Sorry, no player data found for the last match."));
			return Ok(());
		};

		let outcome = if last.is_win() { "won" } else { "lost" };
		let sponsor = player.sponsor_name.as_deref().filter(|s| !s.is_empty()).unwrap_or("no sponsor");
		let mvp = if last.mvp().is_some_and(|m| m.id == player.id) {
			" (MVP)"
		} else {
			""
		};
		let rating = player
			.rating_delta()
			.map(|d| d.abs().to_string())
			.unwrap_or_else(|| "N/A".to_string());

		ctx.reply(format!(
			"{mention}, {channel} {outcome} the last game | Played {sponsor} on {map}{mvp} | KDA: {kda} | Ranked Rating {outcome}: {rating}",
			channel = account.username,
			map = last.map_name(),
			kda = player.kda(),
		));
		Ok(())
	}
}

/// `!rank`: current ranked rating of the linked player.
pub struct Rank;

#[async_trait::async_trait]
impl CommandHandler for Rank {
	fn name(&self) -> &'static str {
		"rank"
	}

	async fn execute(&self, ctx: &CommandContext, deps: &CommandDeps) -> Result<(), CommandError> {
		let Some((account, player_id)) = linked_account(ctx, deps).await? else {
			return Ok(());
		};
		let profile = fetch_profile(deps, &player_id, "rank data").await?;
		match profile.rank_rating() {
			Some(rating) => ctx.reply(format!("{}, {} is at {rating} SR.", ctx.mention(), account.username)),
			None => ctx.reply(format!("{}, no ranked rating found for {}.", ctx.mention(), account.username)),
		}
		Ok(())
	}
}

#[derive(Debug)]
struct StreamRecord {
	stream_started_at: SystemTime,
	tracked: HashSet<String>,
	wins: u32,
	losses: u32,
	/// First rating seen during this stream.
	start_rating: Option<i64>,
}

impl StreamRecord {
	fn new(stream_started_at: SystemTime) -> Self {
		Self {
			stream_started_at,
			tracked: HashSet::new(),
			wins: 0,
			losses: 0,
			start_rating: None,
		}
	}
}

/// `!record`: wins, losses and SR movement since the stream went live.
///
/// State is per channel and in memory; a new stream start resets it.
#[derive(Default)]
pub struct Record {
	records: Mutex<HashMap<String, StreamRecord>>,
}

#[async_trait::async_trait]
impl CommandHandler for Record {
	fn name(&self) -> &'static str {
		"record"
	}

	async fn execute(&self, ctx: &CommandContext, deps: &CommandDeps) -> Result<(), CommandError> {
		let Some((account, player_id)) = linked_account(ctx, deps).await? else {
			return Ok(());
		};
		let mention = ctx.mention();

		let Some(access_token) = account.access_token.clone().filter(|t| !t.is_empty()) else {
			ctx.reply(format!("{mention}, no valid access token found."));
			return Ok(());
		};

		let stream = deps
			.provider
			.stream_status(account.username.as_str(), &access_token)
			.await
			.map_err(|cause| CommandError::Unavailable {
				what: "record data",
				cause,
			})?;
		let Some(stream) = stream else {
			ctx.reply(format!("{mention}, the stream is not live."));
			return Ok(());
		};

		let profile = fetch_profile(deps, &player_id, "record data").await?;
		let Some(last) = profile.matches.first() else {
			ctx.reply(format!("{mention}, no matches played yet during this stream."));
			return Ok(());
		};

		let now = SystemTime::now();
		let during_stream = last
			.played_at()
			.is_some_and(|at| stream.started_at <= at && at <= now);
		if !during_stream {
			ctx.reply(format!("{mention}, No matches have been played yet."));
			return Ok(());
		}

		let current_rating = profile.rank_rating();
		let (change, wins, losses) = {
			let mut records = self.records.lock();
			let record = records
				.entry(account.username.to_string())
				.or_insert_with(|| StreamRecord::new(stream.started_at));
			if record.stream_started_at != stream.started_at {
				debug!(channel = %account.username, "new stream detected; resetting record");
				*record = StreamRecord::new(stream.started_at);
			}

			if record.tracked.insert(last.id.clone()) {
				if last.is_win() {
					record.wins += 1;
				} else {
					record.losses += 1;
				}
			}

			if record.start_rating.is_none() {
				record.start_rating = current_rating;
			}
			let change = match (record.start_rating, current_rating) {
				(Some(start), Some(cur)) => cur - start,
				_ => 0,
			};
			(change, record.wins, record.losses)
		};

		let movement = match change {
			c if c > 0 => format!("up {c} SR"),
			c if c < 0 => format!("down {} SR", c.abs()),
			_ => match current_rating {
				Some(rating) => format!("at {rating} SR"),
				None => "unranked".to_string(),
			},
		};
		ctx.reply(format!(
			"{} is {movement}, Won {wins} - Lost {losses} this stream",
			account.username
		));
		Ok(())
	}
}
