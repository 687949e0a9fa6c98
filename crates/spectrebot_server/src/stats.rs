#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime};

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_STATS_BASE_URL: &str = "https://wavescan-production.up.railway.app";

/// Raw map id -> name shown in chat.
const MAP_NAMES: &[(&str, &str)] = &[
	("Metro_P", "Metro"),
	("Greenbelt_P", "Mill"),
	("Commons", "Commons"),
	("Junction_P", "Skyway"),
];

pub fn map_display_name(raw: &str) -> &str {
	MAP_NAMES
		.iter()
		.find(|(id, _)| *id == raw)
		.map(|(_, name)| *name)
		.unwrap_or(raw)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayerProfile {
	/// Most recent first.
	#[serde(default)]
	pub matches: Vec<MatchSummary>,
	#[serde(default)]
	pub stats: Option<PlayerStats>,
}

impl PlayerProfile {
	pub fn rank_rating(&self) -> Option<i64> {
		self.stats.as_ref().and_then(|s| s.rank_rating)
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayerStats {
	#[serde(default)]
	pub rank_rating: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchSummary {
	pub id: String,
	#[serde(default)]
	pub map: Option<String>,
	#[serde(default)]
	pub winner: Option<i64>,
	#[serde(default)]
	pub match_date: Option<String>,
	pub player_team: MatchTeam,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchTeam {
	pub team_index: i64,
	#[serde(default)]
	pub players: Vec<MatchPlayer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchPlayer {
	pub id: String,
	#[serde(default)]
	pub sponsor_name: Option<String>,
	#[serde(default)]
	pub kills: i64,
	#[serde(default)]
	pub deaths: i64,
	#[serde(default)]
	pub assists: i64,
	#[serde(default)]
	pub ranked_rating: Option<i64>,
	#[serde(default)]
	pub previous_ranked_rating: Option<i64>,
}

impl MatchPlayer {
	pub fn score(&self) -> i64 {
		self.kills + self.assists - self.deaths
	}

	pub fn kda(&self) -> String {
		format!("{}/{}/{}", self.kills, self.deaths, self.assists)
	}

	pub fn rating_delta(&self) -> Option<i64> {
		Some(self.ranked_rating? - self.previous_ranked_rating?)
	}
}

impl MatchSummary {
	pub fn player(&self, player_id: &str) -> Option<&MatchPlayer> {
		self.player_team.players.iter().find(|p| p.id == player_id)
	}

	/// Highest kills + assists - deaths on the player's team; the first wins ties.
	pub fn mvp(&self) -> Option<&MatchPlayer> {
		self.player_team
			.players
			.iter()
			.fold(None, |best: Option<&MatchPlayer>, p| match best {
				Some(b) if b.score() >= p.score() => Some(b),
				_ => Some(p),
			})
	}

	pub fn is_win(&self) -> bool {
		self.winner == Some(self.player_team.team_index)
	}

	pub fn map_name(&self) -> &str {
		self.map.as_deref().map(map_display_name).unwrap_or("unknown map")
	}

	pub fn played_at(&self) -> Option<SystemTime> {
		let raw = self.match_date.as_deref()?;
		let dt = chrono::DateTime::parse_from_rfc3339(raw).ok()?;
		let secs = u64::try_from(dt.timestamp()).ok()?;
		Some(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
	}
}

/// Game statistics source for the chat commands.
#[async_trait::async_trait]
pub trait StatsProvider: Send + Sync + 'static {
	async fn full_profile(&self, player_id: &str) -> anyhow::Result<PlayerProfile>;
}

pub struct WavescanClient {
	http: reqwest::Client,
	base_url: String,
}

impl WavescanClient {
	pub fn new(base_url: Option<String>) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(10))
			.build()
			.context("build stats http client")?;
		let base_url = base_url
			.filter(|s| !s.trim().is_empty())
			.unwrap_or_else(|| DEFAULT_STATS_BASE_URL.to_string());
		Ok(Self {
			http,
			base_url: base_url.trim_end_matches('/').to_string(),
		})
	}
}

#[async_trait::async_trait]
impl StatsProvider for WavescanClient {
	async fn full_profile(&self, player_id: &str) -> anyhow::Result<PlayerProfile> {
		let mut url = url::Url::parse(&self.base_url).context("parse stats base url")?;
		url.path_segments_mut()
			.map_err(|_| anyhow::anyhow!("stats base url cannot be a base"))?
			.pop_if_empty()
			.extend(["api", "v1", "player", player_id, "full_profile"]);

		let resp = self
			.http
			.get(url)
			.send()
			.await
			.context("stats profile send")?
			.error_for_status()
			.context("stats profile status")?;
		resp.json::<PlayerProfile>().await.context("stats profile decode")
	}
}
