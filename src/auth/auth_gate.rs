//! Authentication strategies for the query surface.
//!
//! The mode is a closed set: every match below is exhaustive, so an
//! unrecognized mode cannot silently fall through to a no-op handler.

use std::fmt;
use std::path::PathBuf;

use base64::Engine;
use clap::ValueEnum;
use log::debug;
use serde::{Deserialize, Serialize};

use super::nonce_store::NonceStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Openshift,
    Internal,
    #[default]
    Unsecured,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::Openshift => "openshift",
            AuthMode::Internal => "internal",
            AuthMode::Unsecured => "unsecured",
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity reported on the user endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub username: String,
    #[serde(rename = "authType")]
    pub auth_mode: String,
}

/// What the logout endpoint should do for the active mode.
#[derive(Debug, PartialEq, Eq)]
pub enum LogoutOutcome {
    /// Session is done; respond 200.
    LoggedOut,
    /// First leg of the internal nonce handshake; respond 401 with a
    /// basic-auth challenge.
    Unauthorized,
    /// Expire the oauth proxy cookie.
    ClearCookie,
}

pub struct AuthGate {
    mode: AuthMode,
    users_dir: Option<PathBuf>,
    nonces: NonceStore,
}

impl AuthGate {
    pub fn new(mode: AuthMode, users_dir: Option<PathBuf>) -> Self {
        Self {
            mode,
            users_dir,
            nonces: NonceStore::new(),
        }
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Whether a request carrying this Authorization header may proceed.
    /// Openshift requests were already authenticated by the oauth proxy in
    /// front of the collector; unsecured mode admits everything.
    pub fn authorize(&self, authorization: Option<&str>) -> bool {
        match self.mode {
            AuthMode::Unsecured | AuthMode::Openshift => true,
            AuthMode::Internal => authorization
                .and_then(basic_credentials)
                .map(|(user, password)| self.check_password(&user, &password))
                .unwrap_or(false),
        }
    }

    /// Identity for the user endpoint, from the request's Authorization
    /// header and oauth proxy cookie.
    pub fn user_for(&self, authorization: Option<&str>, oauth_cookie: Option<&str>) -> UserResponse {
        let username = match self.mode {
            AuthMode::Openshift => oauth_cookie
                .and_then(|raw| base64::engine::general_purpose::STANDARD.decode(raw).ok())
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default(),
            AuthMode::Internal => authorization
                .and_then(basic_credentials)
                .map(|(user, _)| user)
                .unwrap_or_default(),
            AuthMode::Unsecured => String::new(),
        };
        UserResponse {
            username,
            auth_mode: self.mode.as_str().to_string(),
        }
    }

    pub fn logout(&self, nonce: Option<&str>) -> LogoutOutcome {
        match self.mode {
            AuthMode::Openshift => LogoutOutcome::ClearCookie,
            AuthMode::Unsecured => LogoutOutcome::LoggedOut,
            AuthMode::Internal => {
                let nonce = nonce.unwrap_or("");
                if self.nonces.take(nonce) {
                    LogoutOutcome::LoggedOut
                } else {
                    LogoutOutcome::Unauthorized
                }
            }
        }
    }

    /// The users directory holds one file per user containing that user's
    /// password.
    fn check_password(&self, user: &str, password: &str) -> bool {
        let dir = match &self.users_dir {
            Some(dir) => dir,
            None => return false,
        };
        // user names must stay within the users directory
        if user.is_empty() || user.contains('/') || user.contains("..") {
            return false;
        }
        match std::fs::read_to_string(dir.join(user)) {
            Ok(stored) => stored == password,
            Err(e) => {
                debug!("failed to authenticate {}: {}", user, e);
                false
            }
        }
    }
}

fn basic_credentials(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use std::io::Write;

    fn basic_header(user: &str, password: &str) -> String {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", user, password));
        format!("Basic {}", token)
    }

    #[test]
    fn unsecured_admits_everything() {
        let gate = AuthGate::new(AuthMode::Unsecured, None);
        assert!(gate.authorize(None));
        assert_eq!(gate.user_for(None, None).username, "");
        assert_eq!(gate.logout(None), LogoutOutcome::LoggedOut);
    }

    #[test]
    fn internal_checks_the_users_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("alice")).unwrap();
        write!(file, "secret").unwrap();
        let gate = AuthGate::new(AuthMode::Internal, Some(dir.path().to_path_buf()));

        assert!(gate.authorize(Some(&basic_header("alice", "secret"))));
        assert!(!gate.authorize(Some(&basic_header("alice", "wrong"))));
        assert!(!gate.authorize(Some(&basic_header("bob", "secret"))));
        assert!(!gate.authorize(Some(&basic_header("../alice", "secret"))));
        assert!(!gate.authorize(None));

        let user = gate.user_for(Some(&basic_header("alice", "secret")), None);
        assert_eq!(user.username, "alice");
        assert_eq!(user.auth_mode, "internal");
    }

    #[test]
    fn internal_logout_is_a_two_step_handshake() {
        let gate = AuthGate::new(AuthMode::Internal, None);
        assert_eq!(gate.logout(Some("n1")), LogoutOutcome::Unauthorized);
        assert_eq!(gate.logout(Some("n1")), LogoutOutcome::LoggedOut);
    }

    #[test]
    fn openshift_reads_the_proxy_cookie() {
        let gate = AuthGate::new(AuthMode::Openshift, None);
        let cookie = base64::engine::general_purpose::STANDARD.encode("deployer");
        assert_eq!(gate.user_for(None, Some(&cookie)).username, "deployer");
        assert_eq!(gate.logout(None), LogoutOutcome::ClearCookie);
        assert!(gate.authorize(None));
    }
}
