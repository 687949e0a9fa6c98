#![forbid(unsafe_code)]

use spectrebot_domain::{ParseIdError, Username};
use thiserror::Error;

use crate::store::StoreError;

/// Failures surfaced by the session lifecycle components.
#[derive(Debug, Error)]
pub enum SessionError {
	#[error("token refresh failed: {0:#}")]
	RefreshFailed(anyhow::Error),
	#[error("token validation failed: {0:#}")]
	ValidationFailed(anyhow::Error),
	#[error("chat connect failed: {0:#}")]
	ConnectFailed(anyhow::Error),
	#[error(transparent)]
	Store(#[from] StoreError),
	#[error("account {0} has no usable credential")]
	NoCredential(Username),
	#[error("account {0} is not linked")]
	UnknownAccount(Username),
	#[error("invalid username: {0}")]
	InvalidUsername(#[from] ParseIdError),
}
