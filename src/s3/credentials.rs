use std::{env, fmt, sync::Arc};

use crate::error::{Error, Result};

/// An immutable credentials snapshot.
///
/// Every S3 operation resolves a fresh snapshot from its provider before
/// issuing any request; a provider refresh never rewrites in-flight
/// signing.
#[derive(Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Result<Credentials> {
        let access_key_id = access_key_id.into();
        let secret_access_key = secret_access_key.into();

        if access_key_id.is_empty() {
            return Err(Error::argument("access_key_id must not be empty"));
        }
        if secret_access_key.is_empty() {
            return Err(Error::argument("secret_access_key must not be empty"));
        }

        Ok(Credentials {
            access_key_id,
            secret_access_key,
            session_token: None,
        })
    }

    pub fn with_session_token(mut self, token: impl Into<String>) -> Credentials {
        self.session_token = Some(token.into());
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_deref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Anything that can produce a credentials snapshot.
pub trait CredentialsProvider: fmt::Debug + Send + Sync {
    fn credentials(&self) -> Result<Credentials>;
}

pub type DynCredentialsProvider = Arc<dyn CredentialsProvider>;

/// Fixed credentials supplied at construction.
#[derive(Debug, Clone)]
pub struct StaticProvider {
    credentials: Credentials,
}

impl StaticProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl CredentialsProvider for StaticProvider {
    fn credentials(&self) -> Result<Credentials> {
        Ok(self.credentials.clone())
    }
}

/// Credentials from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, and
/// optionally `AWS_SESSION_TOKEN`.
#[derive(Debug, Default, Clone)]
pub struct EnvProvider;

impl CredentialsProvider for EnvProvider {
    fn credentials(&self) -> Result<Credentials> {
        let access_key_id = env::var("AWS_ACCESS_KEY_ID")
            .map_err(|_| Error::argument("AWS_ACCESS_KEY_ID is not set"))?;
        let secret_access_key = env::var("AWS_SECRET_ACCESS_KEY")
            .map_err(|_| Error::argument("AWS_SECRET_ACCESS_KEY is not set"))?;

        let mut credentials = Credentials::new(access_key_id, secret_access_key)?;
        if let Ok(token) = env::var("AWS_SESSION_TOKEN")
            && !token.is_empty()
        {
            credentials = credentials.with_session_token(token);
        }
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_keys_are_rejected() {
        assert!(Credentials::new("", "secret").is_err());
        assert!(Credentials::new("AKID", "").is_err());
    }

    #[test]
    fn debug_redacts_secrets() {
        let creds = Credentials::new("AKIDEXAMPLE", "secret")
            .unwrap()
            .with_session_token("token");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("AKIDEXAMPLE"));
        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("token"));
    }

    #[test]
    fn static_provider_returns_its_snapshot() {
        let provider = StaticProvider::new(Credentials::new("AKID", "sk").unwrap());
        let creds = provider.credentials().unwrap();
        assert_eq!(creds.access_key_id, "AKID");
    }
}
