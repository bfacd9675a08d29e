/// Scoped websocket URL validation.
///
/// Accepts the common `ws://` and `wss://` URLs used by exchanges and
/// rejects malformed inputs without attempting full RFC compliance.
/// Parsing happens once per `connect()`; the resulting [`Endpoint`] is
/// retained for the life of the session so reconnection needs no re-parse.
use url::Url;

use crate::errors::ErrorKind;

/// A validated websocket endpoint.
///
/// Invariants: `host` is non-empty, `port` is in `1..=65535`, `path`
/// begins with `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// true = `wss`, false = `ws`.
    pub secure: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Endpoint {
    /// Parse and validate a websocket URL.
    ///
    /// Example inputs:
    ///   `wss://ws.kraken.com/v2`
    ///   `ws://example.com:8080/stream`
    pub fn parse(url: &str) -> Result<Self, ErrorKind> {
        let parsed = Url::parse(url).map_err(|_| ErrorKind::InvalidUrl)?;

        let secure = match parsed.scheme() {
            "ws" => false,
            "wss" => true,
            _ => return Err(ErrorKind::InvalidUrl),
        };

        let host = match parsed.host_str() {
            Some(h) if !h.is_empty() => h.to_string(),
            _ => return Err(ErrorKind::InvalidUrl),
        };

        // Default port by scheme; an explicit `:0` never reaches us because
        // the url crate rejects out-of-range ports at parse time.
        let port = match parsed.port() {
            Some(p) if p > 0 => p,
            Some(_) => return Err(ErrorKind::InvalidUrl),
            None => {
                if secure {
                    443
                } else {
                    80
                }
            }
        };

        let path = match parsed.path() {
            "" => "/".to_string(),
            p if p.starts_with('/') => p.to_string(),
            _ => return Err(ErrorKind::InvalidUrl),
        };

        Ok(Self {
            secure,
            host,
            port,
            path,
        })
    }

    /// Rebuild the URL string handed to the platform websocket library.
    pub fn to_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, self.path)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_url())
    }
}
