use base64::Engine as _;

/// Forward proxy for a connection pool.
///
/// HTTPS endpoints tunnel through the proxy with `CONNECT`; plain HTTP
/// endpoints send absolute-form request targets. When credentials are set,
/// requests carry `Proxy-Authorization: Basic ...`.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub(crate) fn authorization_value(&self) -> Option<String> {
        let username = self.username.as_deref()?;
        let password = self.password.as_deref().unwrap_or("");
        let raw = format!("{username}:{password}");
        Some(format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(raw)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_encodes_credentials() {
        let proxy = ProxyOptions::new("proxy.local", 8080).basic_auth("user", "pass");
        assert_eq!(
            proxy.authorization_value().unwrap(),
            "Basic dXNlcjpwYXNz"
        );
    }

    #[test]
    fn no_credentials_means_no_authorization_header() {
        let proxy = ProxyOptions::new("proxy.local", 8080);
        assert!(proxy.authorization_value().is_none());
    }
}
