#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in seconds.
#[inline]
pub fn unix_secs_now() -> i64 {
	to_unix_secs(SystemTime::now())
}

/// Seconds since the Unix epoch; pre-epoch times clamp to zero.
pub fn to_unix_secs(t: SystemTime) -> i64 {
	t.duration_since(UNIX_EPOCH).unwrap_or(Duration::from_secs(0)).as_secs() as i64
}

/// Inverse of [`to_unix_secs`]; negative values clamp to the epoch.
pub fn from_unix_secs(secs: i64) -> SystemTime {
	UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn unix_secs_conversion_truncates_subsecond() {
		let t = UNIX_EPOCH + Duration::from_millis(1_700_000_000_999);
		assert_eq!(to_unix_secs(t), 1_700_000_000);
		assert_eq!(from_unix_secs(1_700_000_000), UNIX_EPOCH + Duration::from_secs(1_700_000_000));
		assert_eq!(from_unix_secs(-5), UNIX_EPOCH);
	}
}
