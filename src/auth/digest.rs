//! HTTP Digest authentication (RFC 2617, MD5, qop=auth).
//!
//! Nonces carry their issue time and a keyed SHA-256 tag, so issuing one
//! stores nothing and a challenge flood cannot push out nonces that real
//! clients hold. A nonce is good for [`NONCE_LIFETIME`]. Only nonces that
//! have authenticated a request are tracked: with qop the nonce count must
//! strictly increase, without qop a nonce is good for a single request.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::{ct_eq, strip_scheme};
use crate::config::Credentials;
use crate::error::AuthError;

pub const NONCE_LIFETIME: Duration = Duration::from_secs(300);

/// Issue time (ms) + salt + truncated tag
const NONCE_BYTES: usize = 8 + 8 + 16;

/// Nonce that has authenticated at least one request
struct NonceUse {
    issued_ms: u64,
    /// `None` once spent by a request without qop
    last_nc: Option<u32>,
}

pub struct DigestAuth {
    credentials: Credentials,
    realm: String,
    opaque: String,
    lifetime: Duration,
    secret: [u8; 32],
    started: Instant,
    used: Mutex<HashMap<String, NonceUse>>,
}

/// Client's qop fields
pub struct QopParams<'a> {
    pub qop: &'a str,
    pub nc: &'a str,
    pub cnonce: &'a str,
}

impl DigestAuth {
    pub fn new(credentials: Credentials, realm: &str) -> Self {
        Self::with_lifetime(credentials, realm, NONCE_LIFETIME)
    }

    pub fn with_lifetime(credentials: Credentials, realm: &str, lifetime: Duration) -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let mut hasher = Sha256::new();
        hasher.update(realm.as_bytes());
        hasher.update(secret);
        let opaque = hex::encode(&hasher.finalize()[..16]);

        Self {
            credentials,
            realm: realm.to_string(),
            opaque,
            lifetime,
            secret,
            started: Instant::now(),
            used: Mutex::new(HashMap::new()),
        }
    }

    /// Issue a fresh nonce and build the challenge header.
    pub fn challenge(&self, stale: bool) -> String {
        let nonce = self.issue_nonce();
        let mut header = format!(
            "Digest realm=\"{}\", qop=\"auth\", algorithm=MD5, nonce=\"{}\", opaque=\"{}\"",
            self.realm, nonce, self.opaque
        );
        if stale {
            header.push_str(", stale=true");
        }
        header
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn tag(&self, issued: &[u8], salt: &[u8]) -> [u8; 16] {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        hasher.update(issued);
        hasher.update(salt);
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&hasher.finalize()[..16]);
        tag
    }

    fn issue_nonce(&self) -> String {
        let issued = self.now_ms().to_be_bytes();
        let mut salt = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut nonce = Vec::with_capacity(NONCE_BYTES);
        nonce.extend_from_slice(&issued);
        nonce.extend_from_slice(&salt);
        nonce.extend_from_slice(&self.tag(&issued, &salt));
        hex::encode(nonce)
    }

    /// Issue time of a nonce this server minted and that has not expired.
    fn check_nonce(&self, nonce: &str) -> Result<u64, AuthError> {
        let bytes = hex::decode(nonce).map_err(|_| AuthError::StaleNonce)?;
        if bytes.len() != NONCE_BYTES {
            return Err(AuthError::StaleNonce);
        }
        let (issued, rest) = bytes.split_at(8);
        let (salt, tag) = rest.split_at(8);
        if !bool::from(self.tag(issued, salt)[..].ct_eq(tag)) {
            return Err(AuthError::StaleNonce);
        }

        let mut issued_ms = [0u8; 8];
        issued_ms.copy_from_slice(issued);
        let issued_ms = u64::from_be_bytes(issued_ms);
        if self.now_ms().saturating_sub(issued_ms) >= self.lifetime.as_millis() as u64 {
            return Err(AuthError::StaleNonce);
        }
        Ok(issued_ms)
    }

    pub fn verify(&self, method: &str, request_uri: &str, header: &str) -> Result<(), AuthError> {
        let params = parse_params(strip_scheme(header, "Digest").ok_or(AuthError::Malformed)?)?;
        let field = |name: &str| params.get(name).map(String::as_str).ok_or(AuthError::Malformed);

        let username = field("username")?;
        let realm = field("realm")?;
        let nonce = field("nonce")?;
        let uri = field("uri")?;
        let response = field("response")?;

        if realm != self.realm || uri != request_uri {
            return Err(AuthError::BadCredentials);
        }
        if let Some(opaque) = params.get("opaque") {
            if *opaque != self.opaque {
                return Err(AuthError::BadCredentials);
            }
        }
        if let Some(algorithm) = params.get("algorithm") {
            if !algorithm.eq_ignore_ascii_case("MD5") {
                return Err(AuthError::Malformed);
            }
        }

        let qop = match params.get("qop") {
            Some(qop) if qop == "auth" => Some(QopParams {
                qop,
                nc: field("nc")?,
                cnonce: field("cnonce")?,
            }),
            Some(_) => return Err(AuthError::Malformed),
            None => None,
        };

        let expected = expected_response(&self.credentials, &self.realm, method, uri, nonce, qop.as_ref());
        let ok = ct_eq(username, &self.credentials.username) & ct_eq(&response.to_ascii_lowercase(), &expected);
        if !bool::from(ok) {
            return Err(AuthError::BadCredentials);
        }

        let issued_ms = self.check_nonce(nonce)?;
        let nc = match &qop {
            Some(qop) => Some(u32::from_str_radix(qop.nc, 16).map_err(|_| AuthError::Malformed)?),
            None => None,
        };

        let mut used = self.used.lock().map_err(|_| AuthError::StaleNonce)?;
        let now_ms = self.now_ms();
        let lifetime_ms = self.lifetime.as_millis() as u64;
        used.retain(|_, state| now_ms.saturating_sub(state.issued_ms) < lifetime_ms);

        match (used.get_mut(nonce), nc) {
            (Some(state), Some(nc)) => match state.last_nc {
                Some(last) if nc > last => state.last_nc = Some(nc),
                Some(_) => return Err(AuthError::Replay),
                None => return Err(AuthError::StaleNonce),
            },
            (Some(_), None) => return Err(AuthError::StaleNonce),
            (None, last_nc) => {
                used.insert(nonce.to_string(), NonceUse { issued_ms, last_nc });
            }
        }
        Ok(())
    }
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// The `response` value a client holding `credentials` must send.
pub fn expected_response(
    credentials: &Credentials,
    realm: &str,
    method: &str,
    uri: &str,
    nonce: &str,
    qop: Option<&QopParams<'_>>,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", credentials.username, realm, credentials.password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));
    match qop {
        Some(q) => md5_hex(&format!("{}:{}:{}:{}:{}:{}", ha1, nonce, q.nc, q.cnonce, q.qop, ha2)),
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

/// Parse `key=value, key="quoted, value"` lists. Keys are lowercased.
fn parse_params(input: &str) -> Result<HashMap<String, String>, AuthError> {
    let mut params = HashMap::new();
    let mut rest = input.trim();

    while !rest.is_empty() {
        let eq = rest.find('=').ok_or(AuthError::Malformed)?;
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = rest[eq + 1..].trim_start();

        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let mut value = String::new();
            let mut escaped = false;
            let mut end = None;
            for (i, c) in quoted.char_indices() {
                if escaped {
                    value.push(c);
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    end = Some(i);
                    break;
                } else {
                    value.push(c);
                }
            }
            let end = end.ok_or(AuthError::Malformed)?;
            rest = &quoted[end + 1..];
            value
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let value = rest[..end].trim().to_string();
            rest = &rest[end..];
            value
        };

        if key.is_empty() {
            return Err(AuthError::Malformed);
        }
        params.insert(key, value);
        rest = rest.trim_start().trim_start_matches(',').trim_start();
    }
    Ok(params)
}
