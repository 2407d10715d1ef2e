//! Shared-secret handshake. The client proves knowledge of the token by
//! sending `md5_hex(token ∥ decimal(timestamp))`; the timestamp must fall
//! inside the configured window unless the window is disabled.

use std::time::{SystemTime, UNIX_EPOCH};

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum AuthError {
	#[error("authorization failed")]
	InvalidKey,
	#[error("authorization timeout")]
	Expired,
}

pub fn now_ts() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as i64)
		.unwrap_or(0)
}

/// The privilege key for a login, and the sign key for a visitor handshake.
pub fn sign_key(token: &str, timestamp: i64) -> String {
	let digest = md5::compute(format!("{}{}", token, timestamp).as_bytes());
	format!("{:x}", digest)
}

/// `auth_timeout == 0` disables the window check; the key comparison itself
/// is never disabled.
pub fn validate_key(
	token: &str,
	key: &str,
	timestamp: i64,
	now: i64,
	auth_timeout: i64,
) -> Result<(), AuthError> {
	if auth_timeout != 0 && (now - timestamp).abs() > auth_timeout {
		return Err(AuthError::Expired);
	}
	if sign_key(token, timestamp) != key {
		return Err(AuthError::InvalidKey);
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn key_is_md5_of_token_and_decimal_timestamp() {
		// md5("s1700000000")
		assert_eq!(sign_key("s", 1700000000), format!("{:x}", md5::compute(b"s1700000000")));
	}

	#[test]
	fn valid_key_inside_window_passes() {
		let now = 1700000000;
		let key = sign_key("secret", now - 100);
		assert_eq!(validate_key("secret", &key, now - 100, now, 900), Ok(()));
	}

	#[test]
	fn wrong_key_fails() {
		let now = 1700000000;
		assert_eq!(
			validate_key("secret", "bad", now, now, 900),
			Err(AuthError::InvalidKey)
		);
	}

	#[test]
	fn stale_timestamp_fails_even_with_a_good_key() {
		let now = 1700000000;
		let ts = now - 901;
		let key = sign_key("secret", ts);
		assert_eq!(
			validate_key("secret", &key, ts, now, 900),
			Err(AuthError::Expired)
		);
	}

	#[test]
	fn zero_window_disables_the_timestamp_check() {
		let now = 1700000000;
		let ts = now - 100000;
		let key = sign_key("secret", ts);
		assert_eq!(validate_key("secret", &key, ts, now, 0), Ok(()));
	}

	#[test]
	fn future_timestamps_are_bounded_too() {
		let now = 1700000000;
		let ts = now + 901;
		let key = sign_key("secret", ts);
		assert_eq!(
			validate_key("secret", &key, ts, now, 900),
			Err(AuthError::Expired)
		);
	}
}
