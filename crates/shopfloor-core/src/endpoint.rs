//! Realtime endpoint resolution.
//!
//! The order feed lives next to the REST API: the API base URL is upgraded to
//! its WebSocket scheme, the path is replaced by the feed route and the
//! session token travels as a `token` query parameter.

use std::fmt;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use url::Url;

/// Default route of the order feed.
pub const DEFAULT_EVENTS_PATH: &str = "/ws/orders";

/// Errors that can occur while resolving the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    /// No API base URL is configured.
    #[error("API base URL is not configured")]
    NotConfigured,

    /// The base URL could not be parsed.
    #[error("Invalid API base URL: {0}")]
    InvalidUrl(String),

    /// The base URL uses a scheme with no WebSocket counterpart.
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
}

/// A resolved realtime endpoint.
///
/// Two endpoints are equal when their full URLs, token included, are equal.
/// `Display` redacts the token so endpoints are safe to log.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    /// Get the full URL, token included.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Get the parsed URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Whether the endpoint carries a session token.
    #[must_use]
    pub fn has_token(&self) -> bool {
        self.url.query_pairs().any(|(key, _)| key == "token")
    }

    /// Whether the endpoint uses TLS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "wss"
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_token() {
            return f.write_str(self.url.as_str());
        }
        let mut redacted = self.url.clone();
        redacted.set_query(Some("token=***"));
        f.write_str(redacted.as_str())
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Endpoint").field(&self.to_string()).finish()
    }
}

/// Resolve the realtime endpoint from the API base URL and session token.
///
/// # Errors
///
/// Returns [`EndpointError::NotConfigured`] for a missing or blank base URL,
/// [`EndpointError::InvalidUrl`] if it cannot be parsed and
/// [`EndpointError::UnsupportedScheme`] for schemes other than
/// `http`/`https`/`ws`/`wss`.
pub fn resolve(
    api_url: Option<&str>,
    token: Option<&str>,
    path: &str,
) -> Result<Endpoint, EndpointError> {
    let base = api_url.map(str::trim).filter(|s| !s.is_empty());
    let Some(base) = base else {
        return Err(EndpointError::NotConfigured);
    };

    let mut url = if base.contains("://") {
        Url::parse(base)
    } else {
        Url::parse(&format!("http://{base}"))
    }
    .map_err(|e| EndpointError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|()| EndpointError::UnsupportedScheme(url.scheme().to_string()))?;

    url.set_path(path);
    url.set_query(None);
    url.set_fragment(None);

    if let Some(token) = token.filter(|t| !t.is_empty()) {
        url.query_pairs_mut().append_pair("token", token);
    }

    Ok(Endpoint { url })
}

/// Supplies the current API base URL and session token.
///
/// Read each time a connection is established, so changes take effect on the
/// next connect.
pub trait EndpointSource: Send + Sync {
    /// Get the configured API base URL.
    fn api_url(&self) -> Option<String>;

    /// Get the current session token.
    fn session_token(&self) -> Option<String>;
}

/// Settable, thread-safe [`EndpointSource`].
#[derive(Debug, Default)]
pub struct SessionSettings {
    inner: RwLock<SessionInner>,
}

#[derive(Debug, Default, Clone)]
struct SessionInner {
    api_url: Option<String>,
    token: Option<String>,
}

impl SessionSettings {
    /// Create settings from an optional base URL and token.
    #[must_use]
    pub fn new(api_url: Option<String>, token: Option<String>) -> Self {
        Self {
            inner: RwLock::new(SessionInner { api_url, token }),
        }
    }

    /// Replace the API base URL.
    pub fn set_api_url(&self, api_url: Option<String>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .api_url = api_url;
    }

    /// Replace the session token.
    pub fn set_token(&self, token: Option<String>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .token = token;
    }

    fn read(&self) -> SessionInner {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EndpointSource for SessionSettings {
    fn api_url(&self) -> Option<String> {
        self.read().api_url
    }

    fn session_token(&self) -> Option<String> {
        self.read().token
    }
}
