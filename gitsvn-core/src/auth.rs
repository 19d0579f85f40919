//! Authentication providers.
//!
//! The session engine speaks the SASL-shaped mechanism negotiation of the
//! `svn://` protocol; providers supply the mechanism list and verify the
//! client's responses. Supported mechanisms: `ANONYMOUS` (when anonymous
//! read is configured), `PLAIN` and `CRAM-MD5`.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use md5::Md5;

/// Result of one authentication step.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthOutcome {
    /// Authentication finished; carries the user name.
    Authenticated(String),
    /// The mechanism wants another round trip; carries the challenge.
    Challenge(Vec<u8>),
    /// Authentication failed.
    Rejected(String),
}

/// An in-flight mechanism exchange.
pub trait AuthAttempt: Send {
    /// Feeds the client's response bytes (the initial token for
    /// mechanisms that send one).
    fn step(&mut self, response: &[u8]) -> AuthOutcome;
}

/// Authentication provider: announces mechanisms and starts attempts.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Mechanism names to advertise, strongest first.
    fn mechanisms(&self, anonymous_allowed: bool) -> Vec<&'static str>;

    /// Starts an attempt for `mech`; `None` when the mechanism is not
    /// offered.
    async fn start(&self, mech: &str, anonymous_allowed: bool) -> Option<Box<dyn AuthAttempt>>;
}

/// Password-file provider.
///
/// The file holds `user:password` lines with `#` comments. Passwords are
/// stored recoverably because CRAM-MD5 needs the cleartext secret on the
/// server side.
#[derive(Clone, Default)]
pub struct PasswordFileProvider {
    users: HashMap<String, String>,
    realm: String,
}

impl PasswordFileProvider {
    pub fn from_file(path: impl AsRef<Path>, realm: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|err| format!("failed to read password file: {err}"))?;
        Self::from_content(&content, realm)
    }

    pub fn from_content(content: &str, realm: &str) -> Result<Self, String> {
        let mut users = HashMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((user, password)) = line.split_once(':') else {
                return Err(format!("invalid password file line: {line}"));
            };
            let user = user.trim();
            if user.is_empty() {
                return Err(format!("invalid password file line: {line}"));
            }
            users.insert(user.to_string(), password.trim().to_string());
        }
        Ok(Self {
            users,
            realm: realm.to_string(),
        })
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    fn check(&self, user: &str, password: &str) -> bool {
        self.users.get(user).is_some_and(|stored| stored == password)
    }
}

#[async_trait]
impl AuthProvider for PasswordFileProvider {
    fn mechanisms(&self, anonymous_allowed: bool) -> Vec<&'static str> {
        let mut mechs = vec!["CRAM-MD5", "PLAIN"];
        if anonymous_allowed {
            mechs.push("ANONYMOUS");
        }
        mechs
    }

    async fn start(&self, mech: &str, anonymous_allowed: bool) -> Option<Box<dyn AuthAttempt>> {
        match mech {
            "CRAM-MD5" => Some(Box::new(CramMd5Attempt::new(self.clone()))),
            "PLAIN" => Some(Box::new(PlainAttempt {
                provider: self.clone(),
            })),
            "ANONYMOUS" if anonymous_allowed => Some(Box::new(AnonymousAttempt)),
            _ => None,
        }
    }
}

/// Provider for repositories without authentication: `ANONYMOUS` only.
#[derive(Clone, Default)]
pub struct AnonymousProvider;

#[async_trait]
impl AuthProvider for AnonymousProvider {
    fn mechanisms(&self, _anonymous_allowed: bool) -> Vec<&'static str> {
        vec!["ANONYMOUS"]
    }

    async fn start(&self, mech: &str, _anonymous_allowed: bool) -> Option<Box<dyn AuthAttempt>> {
        (mech == "ANONYMOUS").then(|| Box::new(AnonymousAttempt) as Box<dyn AuthAttempt>)
    }
}

struct AnonymousAttempt;

impl AuthAttempt for AnonymousAttempt {
    fn step(&mut self, _response: &[u8]) -> AuthOutcome {
        AuthOutcome::Authenticated("anonymous".to_string())
    }
}

struct PlainAttempt {
    provider: PasswordFileProvider,
}

impl AuthAttempt for PlainAttempt {
    fn step(&mut self, response: &[u8]) -> AuthOutcome {
        // RFC 4616: authzid NUL authcid NUL password
        let mut parts = response.split(|&b| b == 0);
        let _authzid = parts.next();
        let user = parts.next().and_then(|b| std::str::from_utf8(b).ok());
        let password = parts.next().and_then(|b| std::str::from_utf8(b).ok());
        match (user, password) {
            (Some(user), Some(password)) if self.provider.check(user, password) => {
                AuthOutcome::Authenticated(user.to_string())
            }
            _ => AuthOutcome::Rejected("incorrect username or password".to_string()),
        }
    }
}

struct CramMd5Attempt {
    provider: PasswordFileProvider,
    challenge: Option<String>,
}

impl CramMd5Attempt {
    fn new(provider: PasswordFileProvider) -> Self {
        Self {
            provider,
            challenge: None,
        }
    }
}

impl AuthAttempt for CramMd5Attempt {
    fn step(&mut self, response: &[u8]) -> AuthOutcome {
        let Some(challenge) = &self.challenge else {
            // RFC 2195 challenge; uniqueness matters, cryptographic
            // strength does not.
            let challenge = format!(
                "<{}.{}@{}>",
                uuid::Uuid::new_v4().simple(),
                chrono::Utc::now().timestamp(),
                self.provider.realm()
            );
            self.challenge = Some(challenge.clone());
            return AuthOutcome::Challenge(challenge.into_bytes());
        };

        // Response: "user digest-hex"
        let Ok(text) = std::str::from_utf8(response) else {
            return AuthOutcome::Rejected("malformed CRAM-MD5 response".to_string());
        };
        let Some((user, digest_hex)) = text.rsplit_once(' ') else {
            return AuthOutcome::Rejected("malformed CRAM-MD5 response".to_string());
        };
        let Some(password) = self.provider.users.get(user) else {
            return AuthOutcome::Rejected("incorrect username or password".to_string());
        };
        let mut mac = match Hmac::<Md5>::new_from_slice(password.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return AuthOutcome::Rejected("internal digest failure".to_string()),
        };
        mac.update(challenge.as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());
        if expected == digest_hex.to_lowercase() {
            AuthOutcome::Authenticated(user.to_string())
        } else {
            AuthOutcome::Rejected("incorrect username or password".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> PasswordFileProvider {
        PasswordFileProvider::from_content("# users\nalice:secret\nbob:hunter2\n", "test realm")
            .unwrap()
    }

    #[test]
    fn parses_password_file() {
        let provider = provider();
        assert!(provider.check("alice", "secret"));
        assert!(!provider.check("alice", "wrong"));
        assert!(!provider.check("eve", "secret"));
    }

    #[test]
    fn rejects_malformed_password_file() {
        assert!(PasswordFileProvider::from_content("no-colon-here", "r").is_err());
    }

    #[tokio::test]
    async fn plain_mechanism() {
        let provider = provider();
        let mut attempt = provider.start("PLAIN", false).await.unwrap();
        assert_eq!(
            attempt.step(b"\0alice\0secret"),
            AuthOutcome::Authenticated("alice".to_string())
        );
        let mut attempt = provider.start("PLAIN", false).await.unwrap();
        assert!(matches!(
            attempt.step(b"\0alice\0nope"),
            AuthOutcome::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn cram_md5_mechanism() {
        let provider = provider();
        let mut attempt = provider.start("CRAM-MD5", false).await.unwrap();
        let AuthOutcome::Challenge(challenge) = attempt.step(&[]) else {
            panic!("expected challenge");
        };

        let mut mac = Hmac::<Md5>::new_from_slice(b"hunter2").unwrap();
        mac.update(&challenge);
        let digest = hex::encode(mac.finalize().into_bytes());
        assert_eq!(
            attempt.step(format!("bob {digest}").as_bytes()),
            AuthOutcome::Authenticated("bob".to_string())
        );
    }

    #[tokio::test]
    async fn cram_md5_rejects_bad_digest() {
        let provider = provider();
        let mut attempt = provider.start("CRAM-MD5", false).await.unwrap();
        let AuthOutcome::Challenge(_) = attempt.step(&[]) else {
            panic!("expected challenge");
        };
        assert!(matches!(
            attempt.step(b"bob 00112233445566778899aabbccddeeff"),
            AuthOutcome::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn anonymous_only_when_allowed() {
        let provider = provider();
        assert!(provider.start("ANONYMOUS", false).await.is_none());
        let mut attempt = provider.start("ANONYMOUS", true).await.unwrap();
        assert_eq!(
            attempt.step(b""),
            AuthOutcome::Authenticated("anonymous".to_string())
        );
    }
}
