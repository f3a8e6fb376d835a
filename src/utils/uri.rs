use std::fmt;

/// Parsed endpoint URI of the form `scheme://host:port/`.
///
/// App URIs double as routing keys, so the textual form is kept as-is
/// (no normalization beyond stripping a trailing slash on parse).
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Uri {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Uri {
    pub fn parse(raw: &str) -> Result<Self, UriError> {
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| UriError::new(raw, "missing '://'"))?;
        if scheme.is_empty() {
            return Err(UriError::new(raw, "empty scheme"));
        }

        let rest = rest.trim_end_matches('/');
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| UriError::new(raw, "missing port"))?;
        if host.is_empty() {
            return Err(UriError::new(raw, "empty host"));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| UriError::new(raw, "invalid port"))?;

        Ok(Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port,
        })
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}/", self.scheme, self.host, self.port)
    }
}

#[derive(Debug)]
pub struct UriError {
    pub raw: String,
    pub reason: &'static str,
}

impl UriError {
    fn new(raw: &str, reason: &'static str) -> Self {
        Self {
            raw: raw.to_string(),
            reason,
        }
    }
}

impl fmt::Display for UriError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid uri '{}': {}", self.raw, self.reason)
    }
}

impl std::error::Error for UriError {}

/// Resolves the URI other processes should use to reach this app.
///
/// Deployments behind NAT or inside containers substitute their own
/// resolver; the default reports the configured URI untouched.
pub trait AdvertisedHost: Send + Sync {
    fn advertised_uri(&self, configured: &str) -> String;
}

/// Default resolver: the configured URI is already reachable.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfiguredHost;

impl AdvertisedHost for ConfiguredHost {
    fn advertised_uri(&self, configured: &str) -> String {
        configured.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scheme_host_port() {
        let uri = Uri::parse("msgpack://127.0.0.1:8001/").unwrap();
        assert_eq!(uri.scheme, "msgpack");
        assert_eq!(uri.host, "127.0.0.1");
        assert_eq!(uri.port, 8001);
        assert_eq!(uri.to_string(), "msgpack://127.0.0.1:8001/");
    }

    #[test]
    fn trailing_slash_is_optional() {
        let a = Uri::parse("mem://alpha:1/").unwrap();
        let b = Uri::parse("mem://alpha:1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Uri::parse("no-scheme-here").is_err());
        assert!(Uri::parse("tcp://:80/").is_err());
        assert!(Uri::parse("tcp://host:notaport/").is_err());
        assert!(Uri::parse("://host:80/").is_err());
    }
}
