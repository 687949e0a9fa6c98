#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Streaming account login; doubles as the chat channel name.
///
/// Normalized on construction: surrounding whitespace and a leading `#` are
/// stripped and the value is lower-cased, so `#Foo` and `foo` are the same
/// account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

impl Username {
	pub fn new(raw: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let s = raw.as_ref().trim();
		let s = s.strip_prefix('#').unwrap_or(s);
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if s.chars().any(|c| c.is_whitespace() || c == '#') {
			return Err(ParseIdError::InvalidFormat(format!("username contains invalid characters: {s:?}")));
		}
		Ok(Self(s.to_ascii_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// IRC channel form (`#login`).
	pub fn channel(&self) -> String {
		format!("#{}", self.0)
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Username {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Username::new(s)
	}
}

impl TryFrom<String> for Username {
	type Error = ParseIdError;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		Username::new(value)
	}
}

impl From<Username> for String {
	fn from(value: Username) -> Self {
		value.0
	}
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
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

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// A linked streaming account as persisted by the account store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
	pub username: Username,
	pub player_id: Option<String>,
	pub access_token: Option<SecretString>,
	pub refresh_token: Option<SecretString>,
	pub token_expires_at: Option<SystemTime>,
}

impl Account {
	/// Account with no credential and no player link.
	pub fn new(username: Username) -> Self {
		Self {
			username,
			player_id: None,
			access_token: None,
			refresh_token: None,
			token_expires_at: None,
		}
	}

	pub fn with_player_id(mut self, player_id: impl Into<String>) -> Self {
		self.player_id = Some(player_id.into());
		self
	}

	pub fn with_credential(mut self, credential: Credential) -> Self {
		self.access_token = Some(credential.access_token);
		self.refresh_token = Some(credential.refresh_token);
		self.token_expires_at = Some(credential.expires_at);
		self
	}

	/// Usable credential; `None` unless access token, refresh token and
	/// expiry are all present.
	pub fn credential(&self) -> Option<Credential> {
		match (&self.access_token, &self.refresh_token, self.token_expires_at) {
			(Some(access), Some(refresh), Some(expires_at)) if !access.is_empty() && !refresh.is_empty() => {
				Some(Credential {
					access_token: access.clone(),
					refresh_token: refresh.clone(),
					expires_at,
				})
			}
			_ => None,
		}
	}

	pub fn has_player_link(&self) -> bool {
		self.player_id.as_deref().is_some_and(|p| !p.trim().is_empty())
	}
}

/// Complete OAuth credential for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
	pub access_token: SecretString,
	pub refresh_token: SecretString,
	pub expires_at: SystemTime,
}

impl Credential {
	/// Time left before expiry, or `None` once expired.
	pub fn remaining(&self, now: SystemTime) -> Option<Duration> {
		self.expires_at.duration_since(now).ok().filter(|d| !d.is_zero())
	}

	pub fn is_expired(&self, now: SystemTime) -> bool {
		self.remaining(now).is_none()
	}
}
