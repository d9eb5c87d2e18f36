#[cfg(test)]
mod auth_test;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use md5::{Digest, Md5};
use ring::hmac;

use crate::error::Result;

/// Creates a time-limited username/password pair from a shared secret,
/// in the format used by REST-style TURN credential services. The
/// username is the expiry unix timestamp and the password is the
/// base64-encoded HMAC-SHA1 of the username.
pub fn generate_long_term_credentials(
    shared_secret: &str,
    duration: Duration,
) -> Result<(String, String)> {
    let t = SystemTime::now().duration_since(UNIX_EPOCH)? + duration;
    let username = t.as_secs().to_string();
    let password = long_term_credentials(&username, shared_secret);
    Ok((username, password))
}

pub fn long_term_credentials(username: &str, shared_secret: &str) -> String {
    let mac = hmac::Key::new(
        hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
        shared_secret.as_bytes(),
    );
    let password = hmac::sign(&mac, username.as_bytes()).as_ref().to_vec();
    BASE64_STANDARD.encode(password)
}

/// Computes the long-term credential key: MD5 over
/// "username:realm:password".
pub fn generate_auth_key(username: &str, realm: &str, password: &str) -> Vec<u8> {
    let s = format!("{username}:{realm}:{password}");

    let mut h = Md5::new();
    h.update(s.as_bytes());
    h.finalize().to_vec()
}
