#![forbid(unsafe_code)]

pub mod chat;
pub mod irc;
pub mod oauth;

pub use chat::{TwitchChatConfig, TwitchChatTransport};
pub use oauth::{TwitchIdentityProvider, TwitchOAuthConfig};
