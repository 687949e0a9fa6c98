#![forbid(unsafe_code)]

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
	content: &'a str,
}

/// Fire-and-forget operator notifications over a Discord-style webhook.
#[derive(Clone)]
pub struct Notifier {
	inner: Option<Arc<NotifierInner>>,
}

struct NotifierInner {
	http: reqwest::Client,
	url: String,
}

impl Notifier {
	pub fn new(webhook_url: Option<String>) -> Self {
		let inner = webhook_url.filter(|u| !u.trim().is_empty()).map(|url| {
			Arc::new(NotifierInner {
				http: reqwest::Client::new(),
				url,
			})
		});
		Self { inner }
	}

	#[cfg(test)]
	pub fn disabled() -> Self {
		Self { inner: None }
	}

	pub fn is_enabled(&self) -> bool {
		self.inner.is_some()
	}

	/// Post `message` in the background. Failures are logged only.
	pub fn notify(&self, message: impl Into<String>) {
		let message = message.into();
		let Some(inner) = self.inner.clone() else {
			debug!(%message, "notification skipped (no webhook configured)");
			return;
		};
		tokio::spawn(async move {
			let res = inner
				.http
				.post(&inner.url)
				.json(&WebhookPayload { content: &message })
				.send()
				.await
				.and_then(|r| r.error_for_status());
			match res {
				Ok(_) => metrics::counter!("spectrebot_notifications_sent_total").increment(1),
				Err(e) => {
					metrics::counter!("spectrebot_notification_failures_total").increment(1);
					warn!(error = %e, "webhook notification failed");
				}
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn blank_url_disables() {
		assert!(!Notifier::new(Some("  ".into())).is_enabled());
		assert!(!Notifier::new(None).is_enabled());
		assert!(Notifier::new(Some("http://127.0.0.1:9/hook".into())).is_enabled());
	}

	#[tokio::test]
	async fn disabled_notify_is_a_no_op() {
		Notifier::disabled().notify("New account added foo");
	}
}
