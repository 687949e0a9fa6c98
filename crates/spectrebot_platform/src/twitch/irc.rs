#![forbid(unsafe_code)]

//! Minimal IRCv3 line parsing for Twitch chat.

use std::collections::BTreeMap;

use crate::{ChatMessage, ChatSender};

/// One parsed IRC line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrcMessage {
	pub tags: BTreeMap<String, String>,
	pub prefix: Option<String>,
	pub command: String,
	pub params: Vec<String>,
}

impl IrcMessage {
	/// Parse a single line (without the trailing CRLF).
	pub fn parse(line: &str) -> Option<Self> {
		let mut rest = line.trim_end_matches(['\r', '\n']);

		let mut tags = BTreeMap::new();
		if let Some(stripped) = rest.strip_prefix('@') {
			let (raw_tags, tail) = stripped.split_once(' ')?;
			for pair in raw_tags.split(';') {
				let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
				if !k.is_empty() {
					tags.insert(k.to_string(), unescape_tag_value(v));
				}
			}
			rest = tail.trim_start();
		}

		let mut prefix = None;
		if let Some(stripped) = rest.strip_prefix(':') {
			let (p, tail) = stripped.split_once(' ')?;
			prefix = Some(p.to_string());
			rest = tail.trim_start();
		}

		let (command, mut rest) = match rest.split_once(' ') {
			Some((c, tail)) => (c, tail),
			None => (rest, ""),
		};
		if command.is_empty() {
			return None;
		}

		let mut params = Vec::new();
		loop {
			rest = rest.trim_start_matches(' ');
			if rest.is_empty() {
				break;
			}
			if let Some(trailing) = rest.strip_prefix(':') {
				params.push(trailing.to_string());
				break;
			}
			match rest.split_once(' ') {
				Some((p, tail)) => {
					params.push(p.to_string());
					rest = tail;
				}
				None => {
					params.push(rest.to_string());
					break;
				}
			}
		}

		Some(Self {
			tags,
			prefix,
			command: command.to_ascii_uppercase(),
			params,
		})
	}

	/// Nick portion of a `nick!user@host` prefix.
	pub fn nick(&self) -> Option<&str> {
		let prefix = self.prefix.as_deref()?;
		Some(prefix.split_once('!').map(|(n, _)| n).unwrap_or(prefix))
	}

	pub fn trailing(&self) -> Option<&str> {
		self.params.last().map(String::as_str)
	}

	pub fn tag(&self, key: &str) -> Option<&str> {
		self.tags.get(key).map(String::as_str).filter(|v| !v.is_empty())
	}

	/// Convert a `PRIVMSG` into a chat message.
	pub fn to_chat_message(&self) -> Option<ChatMessage> {
		if self.command != "PRIVMSG" || self.params.len() < 2 {
			return None;
		}
		let channel = self.params[0].trim_start_matches('#').to_ascii_lowercase();
		let login = self.nick()?.to_ascii_lowercase();
		let display_name = self.tag("display-name").unwrap_or(&login).to_string();

		Some(ChatMessage {
			channel,
			sender: ChatSender {
				display_name,
				user_id: self.tag("user-id").map(str::to_string),
				badges: self.tag("badges").map(parse_badges).unwrap_or_default(),
				message_id: self.tag("id").map(str::to_string),
				login,
			},
			text: self.params[1].clone(),
		})
	}
}

/// `broadcaster/1,moderator/1` -> `{broadcaster: 1, moderator: 1}`.
pub fn parse_badges(raw: &str) -> BTreeMap<String, String> {
	raw.split(',')
		.filter(|b| !b.is_empty())
		.map(|b| {
			let (name, version) = b.split_once('/').unwrap_or((b, ""));
			(name.to_string(), version.to_string())
		})
		.collect()
}

fn unescape_tag_value(v: &str) -> String {
	let mut out = String::with_capacity(v.len());
	let mut chars = v.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some(':') => out.push(';'),
			Some('s') => out.push(' '),
			Some('\\') => out.push('\\'),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some(other) => out.push(other),
			None => {}
		}
	}
	out
}
