#![forbid(unsafe_code)]

pub mod state;


use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde_json::json;
use spectrebot_domain::{SecretString, Username};
use spectrebot_platform::IdentityProvider;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

use self::state::{STATE_TTL, issue_state, verify_state};
use crate::session::{SessionCoordinator, SessionEvent};

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Shared state behind every HTTP request.
#[derive(Clone)]
pub struct HttpState {
	pub coordinator: Arc<SessionCoordinator>,
	pub provider: Arc<dyn IdentityProvider>,
	pub events_tx: mpsc::Sender<SessionEvent>,
	pub health: HealthState,
	/// Signs the OAuth `state` parameter; unsigned flow when `None`.
	pub state_secret: Option<SecretString>,
}

pub fn spawn_http_server(bind: SocketAddr, state: HttpState) {
	tokio::spawn(async move {
		if let Err(err) = run_http_server(bind, state).await {
			warn!(error = %err, "http server stopped");
		}
	});
}

async fn run_http_server(bind: SocketAddr, state: HttpState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, "http server listening");
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "http connection error");
			}
		});
	}
}

async fn handle_request(req: Request<Incoming>, state: HttpState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	Ok(route(req.method(), req.uri(), &state).await)
}

/// Dispatch on method and path; never fails, errors become status codes.
pub async fn route(method: &Method, uri: &Uri, state: &HttpState) -> Response<Full<Bytes>> {
	if method != Method::GET {
		return text(StatusCode::METHOD_NOT_ALLOWED, "");
	}
	metrics::counter!("spectrebot_http_requests_total").increment(1);

	let query = query_params(uri);
	match uri.path() {
		"/" => redirect("/login"),
		"/login" => login(state),
		"/callback" => callback(&query, state).await,
		"/status" => status(state).await,
		"/api/v2/connected-accounts" => connected_accounts(state).await,
		"/addaccount" => add_account(&query, state).await,
		"/healthz" => text(StatusCode::OK, "ok"),
		"/readyz" => {
			if state.health.is_ready() {
				text(StatusCode::OK, "ready")
			} else {
				text(StatusCode::SERVICE_UNAVAILABLE, "not-ready")
			}
		}
		_ => text(StatusCode::NOT_FOUND, ""),
	}
}

fn query_params(uri: &Uri) -> HashMap<String, String> {
	uri.query()
		.map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
		.unwrap_or_default()
}

fn param<'a>(query: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
	query.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn login(state: &HttpState) -> Response<Full<Bytes>> {
	let oauth_state = match &state.state_secret {
		Some(secret) => match issue_state(secret.expose(), STATE_TTL) {
			Ok(s) => Some(s),
			Err(e) => {
				warn!(error = %e, "failed to issue oauth state");
				return text(StatusCode::INTERNAL_SERVER_ERROR, "Authentication failed");
			}
		},
		None => None,
	};

	match state.provider.authorize_url(oauth_state.as_deref()) {
		Ok(url) => redirect(&url),
		Err(e) => {
			warn!(error = %e, "failed to build authorize url");
			text(StatusCode::INTERNAL_SERVER_ERROR, "Authentication failed")
		}
	}
}

async fn callback(query: &HashMap<String, String>, state: &HttpState) -> Response<Full<Bytes>> {
	let Some(code) = param(query, "code") else {
		if let Some(error) = param(query, "error") {
			info!(%error, "authorization denied by user");
		}
		return text(StatusCode::BAD_REQUEST, "Invalid code");
	};

	if let Some(secret) = &state.state_secret {
		let verified = param(query, "state")
			.ok_or_else(|| anyhow::anyhow!("missing state"))
			.and_then(|s| verify_state(s, secret.expose()));
		if let Err(e) = verified {
			warn!(error = %e, "oauth callback with bad state");
			return text(StatusCode::BAD_REQUEST, "Invalid state");
		}
	}

	let grant = match state.provider.exchange_code(code).await {
		Ok(g) => g,
		Err(e) => {
			warn!(error = %e, "authorization code exchange failed");
			metrics::counter!("spectrebot_oauth_failures_total").increment(1);
			return text(StatusCode::INTERNAL_SERVER_ERROR, "Authentication failed");
		}
	};

	let owner = match state.provider.token_owner(&grant.access_token).await {
		Ok(o) => o,
		Err(e) => {
			warn!(error = %e, "token owner lookup failed");
			metrics::counter!("spectrebot_oauth_failures_total").increment(1);
			return text(StatusCode::INTERNAL_SERVER_ERROR, "Authentication failed");
		}
	};

	match state.coordinator.on_account_linked(&owner.login, grant).await {
		Ok(linked) => {
			info!(username = %linked.username, connection = ?linked.connection, "oauth login complete");
			text(StatusCode::OK, "Successfully authenticated with Twitch!")
		}
		Err(e) => {
			warn!(login = %owner.login, error = %e, "failed to persist authorized account");
			metrics::counter!("spectrebot_oauth_failures_total").increment(1);
			text(StatusCode::INTERNAL_SERVER_ERROR, "Authentication failed")
		}
	}
}

async fn status(state: &HttpState) -> Response<Full<Bytes>> {
	let accounts = match state.coordinator.store().list_all().await {
		Ok(accounts) => accounts,
		Err(e) => {
			warn!(error = %e, "status: failed to list accounts");
			return text(StatusCode::INTERNAL_SERVER_ERROR, "");
		}
	};

	let scheduler = state.coordinator.scheduler();
	let sessions: Vec<_> = state
		.coordinator
		.supervisor()
		.snapshot()
		.into_iter()
		.map(|s| {
			json!({
				"username": s.username.as_str(),
				"channel": s.channel,
				"session_id": s.session_id,
				"connected": s.connected,
			})
		})
		.collect();
	let linked: Vec<_> = accounts
		.iter()
		.map(|a| {
			json!({
				"username": a.username.as_str(),
				"player_linked": a.has_player_link(),
				"authorized": a.credential().is_some(),
				"refresh_pending": scheduler.pending(&a.username).is_some(),
				"refreshing": scheduler.is_refreshing(&a.username),
			})
		})
		.collect();

	json_response(&json!({
		"accounts": linked,
		"sessions": sessions,
		"pending_refreshes": scheduler.pending_count(),
	}))
}

async fn connected_accounts(state: &HttpState) -> Response<Full<Bytes>> {
	match state.coordinator.store().list_all().await {
		Ok(accounts) => {
			let names: Vec<String> = accounts.into_iter().map(|a| a.username.into_string()).collect();
			json_response(&json!(names))
		}
		Err(e) => {
			warn!(error = %e, "connected-accounts: failed to list accounts");
			text(StatusCode::INTERNAL_SERVER_ERROR, "")
		}
	}
}

async fn add_account(query: &HashMap<String, String>, state: &HttpState) -> Response<Full<Bytes>> {
	let (Some(channel), Some(player_id)) = (param(query, "channel"), param(query, "playerId")) else {
		return text(StatusCode::BAD_REQUEST, "Channel and Player ID are required");
	};
	let Ok(username) = Username::new(channel) else {
		return text(StatusCode::BAD_REQUEST, "Channel and Player ID are required");
	};

	if let Err(e) = state.coordinator.store().link_player(&username, player_id).await {
		warn!(%username, error = %e, "failed to link player");
		return text(StatusCode::INTERNAL_SERVER_ERROR, "Error linking player account");
	}
	info!(%username, %player_id, "player linked over http");
	if state.events_tx.send(SessionEvent::PlayerLinked(username.clone())).await.is_err() {
		warn!(%username, "session coordinator gone; link stored without connecting");
	}

	text(
		StatusCode::OK,
		format!("Player ID {player_id} has been successfully linked to channel {username}"),
	)
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
	resp
}

fn json_response(value: &serde_json::Value) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(Bytes::from(value.to_string())));
	resp.headers_mut()
		.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
	resp
}

fn redirect(location: &str) -> Response<Full<Bytes>> {
	match HeaderValue::from_str(location) {
		Ok(value) => {
			let mut resp = Response::new(Full::new(Bytes::new()));
			*resp.status_mut() = StatusCode::FOUND;
			resp.headers_mut().insert(LOCATION, value);
			resp
		}
		Err(e) => {
			warn!(error = %e, "redirect target is not a valid header value");
			text(StatusCode::INTERNAL_SERVER_ERROR, "")
		}
	}
}
