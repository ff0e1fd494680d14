use std::fmt;

use url::Url;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
        }
    }
}

/// The `(scheme, host, port)` triple identifying a remote service.
///
/// Hosts are case-folded at parse time and ports filled with the scheme
/// default, so two spellings of the same endpoint compare equal and land
/// in the same pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Endpoint {
    /// Parse `scheme://host[:port]`. The scheme is case-insensitive and
    /// must be `http` or `https`; paths, queries, and fragments are not
    /// part of an endpoint.
    pub fn parse(input: &str) -> Result<Endpoint> {
        let url = Url::parse(input).map_err(|e| {
            Error::argument(format!(
                "invalid endpoint '{input}': expected scheme://host[:port] ({e})"
            ))
        })?;

        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => {
                return Err(Error::argument(format!(
                    "unsupported scheme '{other}' in endpoint '{input}': expected http or https"
                )));
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::argument(format!("empty host in endpoint '{input}'")))?
            .to_ascii_lowercase();

        if !matches!(url.path(), "" | "/") || url.query().is_some() || url.fragment().is_some() {
            return Err(Error::argument(format!(
                "endpoint '{input}' must not include a path, query, or fragment"
            )));
        }

        let port = url.port().unwrap_or_else(|| scheme.default_port());

        Ok(Endpoint { scheme, host, port })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// The value for a `Host` header: port elided when it is the scheme
    /// default.
    pub fn authority(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fills_default_ports_by_scheme() {
        let http = Endpoint::parse("http://example.com").unwrap();
        assert_eq!(http.port(), 80);

        let https = Endpoint::parse("https://example.com").unwrap();
        assert_eq!(https.port(), 443);

        let custom = Endpoint::parse("http://example.com:8080").unwrap();
        assert_eq!(custom.port(), 8080);
    }

    #[test]
    fn scheme_is_case_insensitive_and_host_is_folded() {
        let a = Endpoint::parse("HTTPS://Example.COM").unwrap();
        let b = Endpoint::parse("https://example.com:443").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.host(), "example.com");
    }

    #[test]
    fn trailing_slash_is_tolerated() {
        let e = Endpoint::parse("http://example.com/").unwrap();
        assert_eq!(e.authority(), "example.com");
    }

    #[test]
    fn invalid_endpoints_are_argument_errors() {
        for bad in [
            "example.com",
            "ftp://example.com",
            "http://",
            "http://example.com/path",
            "http://example.com?q=1",
            "http://example.com:notaport",
        ] {
            let err = Endpoint::parse(bad).unwrap_err();
            assert!(matches!(err, Error::Argument { .. }), "{bad}: {err}");
        }
    }

    #[test]
    fn authority_elides_default_ports() {
        assert_eq!(
            Endpoint::parse("https://example.com").unwrap().authority(),
            "example.com"
        );
        assert_eq!(
            Endpoint::parse("https://example.com:8443")
                .unwrap()
                .authority(),
            "example.com:8443"
        );
    }
}
