#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::util::time::unix_secs_now;

/// Lifetime of an OAuth `state` value.
pub const STATE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateClaims {
	pub nonce: String,
	pub exp: i64,
}

/// Mint a signed `v1.<payload>.<sig>` state value.
pub fn issue_state(secret: &str, ttl: Duration) -> anyhow::Result<String> {
	let claims = StateClaims {
		nonce: spectrebot_platform::new_session_id(),
		exp: unix_secs_now() + ttl.as_secs() as i64,
	};
	let payload = serde_json::to_vec(&claims).context("encode state claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

pub fn verify_state(token: &str, secret: &str) -> anyhow::Result<StateClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid state format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode state payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode state signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid state signature"));
	}

	let claims: StateClaims = serde_json::from_slice(&payload).context("parse state claims")?;
	if claims.exp <= unix_secs_now() {
		return Err(anyhow!("state expired"));
	}

	Ok(claims)
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("hmac key: {e}"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn issued_state_verifies() {
		let token = issue_state("s3cret", STATE_TTL).expect("issue");
		let claims = verify_state(&token, "s3cret").expect("verify");
		assert!(claims.exp > unix_secs_now());
		assert!(!claims.nonce.is_empty());
	}

	#[test]
	fn wrong_secret_or_tampering_is_rejected() {
		let token = issue_state("s3cret", STATE_TTL).expect("issue");
		assert!(verify_state(&token, "other").is_err());

		let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
		parts[1] = URL_SAFE_NO_PAD.encode(br#"{"nonce":"x","exp":99999999999}"#);
		assert!(verify_state(&parts.join("."), "s3cret").is_err());

		assert!(verify_state("not-a-token", "s3cret").is_err());
		assert!(verify_state("v2.a.b", "s3cret").is_err());
	}

	#[test]
	fn expired_state_is_rejected() {
		let token = issue_state("s3cret", Duration::ZERO).expect("issue");
		let err = verify_state(&token, "s3cret").expect_err("expired");
		assert!(err.to_string().contains("expired"));
	}
}
