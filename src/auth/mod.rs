//! Credential checks applied before any frame data leaves the server.

pub mod digest;

use anyhow::{bail, Result};
use base64::Engine;
use subtle::{Choice, ConstantTimeEq};

use crate::config::{AuthMode, Credentials};
use crate::error::AuthError;

pub use digest::DigestAuth;

/// Realm for both Basic and Digest challenges
pub const REALM: &str = "Virtual Security Camera";

pub enum AuthGate {
    None,
    Basic(BasicAuth),
    Digest(DigestAuth),
}

impl AuthGate {
    pub fn new(mode: AuthMode, credentials: Option<Credentials>) -> Result<Self> {
        Ok(match (mode, credentials) {
            (AuthMode::None, _) => Self::None,
            (AuthMode::Basic, Some(creds)) => Self::Basic(BasicAuth::new(creds)),
            (AuthMode::Digest, Some(creds)) => Self::Digest(DigestAuth::new(creds, REALM)),
            (mode, None) => bail!("{:?} authentication needs a username and password", mode),
        })
    }

    /// Check the `Authorization` header of a request.
    pub fn verify(&self, method: &str, uri: &str, authorization: Option<&str>) -> Result<(), AuthError> {
        match self {
            Self::None => Ok(()),
            Self::Basic(basic) => basic.verify(authorization.ok_or(AuthError::Missing)?),
            Self::Digest(digest) => digest.verify(method, uri, authorization.ok_or(AuthError::Missing)?),
        }
    }

    /// `WWW-Authenticate` value to send with a 401
    pub fn challenge(&self, stale: bool) -> Option<String> {
        match self {
            Self::None => None,
            Self::Basic(_) => Some(format!("Basic realm=\"{}\", charset=\"UTF-8\"", REALM)),
            Self::Digest(digest) => Some(digest.challenge(stale)),
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic(_) => "basic",
            Self::Digest(_) => "digest",
        }
    }
}

pub struct BasicAuth {
    credentials: Credentials,
}

impl BasicAuth {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }

    pub fn verify(&self, header: &str) -> Result<(), AuthError> {
        let token = strip_scheme(header, "Basic").ok_or(AuthError::Malformed)?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(token.trim())
            .map_err(|_| AuthError::Malformed)?;
        let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;
        let (username, password) = decoded.split_once(':').ok_or(AuthError::Malformed)?;

        let ok = ct_eq(username, &self.credentials.username) & ct_eq(password, &self.credentials.password);
        if bool::from(ok) {
            Ok(())
        } else {
            Err(AuthError::BadCredentials)
        }
    }
}

/// Constant-time string comparison
pub(crate) fn ct_eq(a: &str, b: &str) -> Choice {
    a.as_bytes().ct_eq(b.as_bytes())
}

/// Return the parameters after `scheme` if the header uses it.
pub(crate) fn strip_scheme<'a>(header: &'a str, scheme: &str) -> Option<&'a str> {
    let (given, rest) = header.trim().split_once(' ')?;
    given.eq_ignore_ascii_case(scheme).then_some(rest.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials {
            username: "username".into(),
            password: "password".into(),
        }
    }

    #[test]
    fn test_none_always_passes() {
        let gate = AuthGate::new(AuthMode::None, None).unwrap();
        assert_eq!(gate.scheme(), "none");
        assert!(gate.verify("GET", "/stream", None).is_ok());
        assert!(gate.challenge(false).is_none());
    }

    #[test]
    fn test_basic_accepts_valid_credentials() {
        let gate = AuthGate::new(AuthMode::Basic, Some(creds())).unwrap();
        // base64("username:password")
        assert!(gate.verify("GET", "/stream", Some("Basic dXNlcm5hbWU6cGFzc3dvcmQ=")).is_ok());
        assert!(gate.verify("GET", "/stream", Some("basic dXNlcm5hbWU6cGFzc3dvcmQ=")).is_ok());
    }

    #[test]
    fn test_basic_rejects_bad_credentials() {
        let gate = AuthGate::new(AuthMode::Basic, Some(creds())).unwrap();
        let wrong = base64::engine::general_purpose::STANDARD.encode("username:nope");
        assert_eq!(
            gate.verify("GET", "/stream", Some(&format!("Basic {}", wrong))),
            Err(AuthError::BadCredentials)
        );
        assert_eq!(gate.verify("GET", "/stream", None), Err(AuthError::Missing));
        assert_eq!(
            gate.verify("GET", "/stream", Some("Basic !!!notbase64")),
            Err(AuthError::Malformed)
        );
        assert_eq!(
            gate.verify("GET", "/stream", Some("Bearer dXNlcm5hbWU6cGFzc3dvcmQ=")),
            Err(AuthError::Malformed)
        );
    }

    #[test]
    fn test_basic_challenge_names_realm() {
        let gate = AuthGate::new(AuthMode::Basic, Some(creds())).unwrap();
        let challenge = gate.challenge(false).unwrap();
        assert!(challenge.starts_with("Basic "));
        assert!(challenge.contains(REALM));
    }

    #[test]
    fn test_modes_require_credentials() {
        assert!(AuthGate::new(AuthMode::Basic, None).is_err());
        assert!(AuthGate::new(AuthMode::Digest, None).is_err());
    }

    #[test]
    fn test_ct_eq() {
        assert!(bool::from(ct_eq("abc", "abc")));
        assert!(!bool::from(ct_eq("abc", "abd")));
        assert!(!bool::from(ct_eq("abc", "abcd")));
    }
}
