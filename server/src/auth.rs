//! Credential checks for the authentication phase.

use shared::constant_time_eq;

/// Decides whether a credential blob is acceptable.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credentials: &[u8]) -> bool;
}

/// Accepts any credentials, including an empty blob.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _credentials: &[u8]) -> bool {
        true
    }
}

/// Accepts exactly the configured secrets.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    accepted: Vec<Vec<u8>>,
}

impl StaticCredentials {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        Self {
            accepted: secrets.into_iter().map(|s| s.as_ref().to_vec()).collect(),
        }
    }
}

impl Authenticator for StaticCredentials {
    fn authenticate(&self, credentials: &[u8]) -> bool {
        // Every secret is compared so the match position is not observable.
        self.accepted
            .iter()
            .fold(false, |found, secret| constant_time_eq(secret, credentials) | found)
    }
}

/// Builds the authenticator for a configured credential list. An empty list
/// means the server is open.
pub fn from_credentials(credentials: &[String]) -> Box<dyn Authenticator> {
    if credentials.is_empty() {
        Box::new(AllowAll)
    } else {
        Box::new(StaticCredentials::new(credentials))
    }
}
