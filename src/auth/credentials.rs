use base64::{engine::general_purpose::STANDARD, Engine as _};
use http::{header, HeaderMap};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::auth::requirement::BasicCredentials;

static BASIC_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Basic\s([A-Za-z0-9+/]+={0,2})$").expect("valid basic pattern"));
static BEARER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Bearer\s([A-Za-z0-9._-]+)$").expect("valid bearer pattern"));

/// Credentials presented by an inbound call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestCredentials {
    authorization: Option<String>,
}

impl RequestCredentials {
    /// No request is available, e.g. a call that did not arrive over HTTP.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_authorization(value: impl Into<String>) -> Self {
        Self {
            authorization: Some(value.into()),
        }
    }

    /// Reads the `Authorization` header. A value that is not valid ASCII counts
    /// as absent.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            authorization: headers
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string),
        }
    }

    pub fn authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }

    /// The token of a `Bearer <token>` header.
    pub fn bearer_token(&self) -> Option<&str> {
        let authorization = self.authorization.as_deref()?;
        BEARER_PATTERN
            .captures(authorization)
            .and_then(|captures| captures.get(1))
            .map(|token| token.as_str())
    }

    /// The decoded `username:password` pair of a `Basic <base64>` header.
    pub fn basic_credentials(&self) -> Option<BasicCredentials> {
        let authorization = self.authorization.as_deref()?;
        let encoded = BASIC_PATTERN.captures(authorization)?.get(1)?.as_str();
        let decoded = STANDARD.decode(encoded).ok()?;
        let text = String::from_utf8(decoded).ok()?;
        let (username, password) = text.split_once(':')?;
        Some(BasicCredentials::new(username, password))
    }
}

impl From<&HeaderMap> for RequestCredentials {
    fn from(headers: &HeaderMap) -> Self {
        Self::from_headers(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_bearer_token() {
        let creds = RequestCredentials::from_authorization("Bearer abc.DEF-123_x");
        assert_eq!(creds.bearer_token(), Some("abc.DEF-123_x"));
        assert_eq!(creds.basic_credentials(), None);

        assert_eq!(RequestCredentials::from_authorization("Bearer").bearer_token(), None);
        assert_eq!(RequestCredentials::from_authorization("Bearer ").bearer_token(), None);
        assert_eq!(RequestCredentials::from_authorization("Token abc").bearer_token(), None);
        assert_eq!(RequestCredentials::none().bearer_token(), None);
    }

    #[test]
    fn test_basic_credentials() {
        let creds = RequestCredentials::from_authorization("Basic Zm9vOmJhcg==");
        assert_eq!(creds.basic_credentials(), Some(BasicCredentials::new("foo", "bar")));
        assert_eq!(creds.bearer_token(), None);

        assert_eq!(RequestCredentials::from_authorization("Basic").basic_credentials(), None);
        assert_eq!(RequestCredentials::from_authorization("Basic !!!").basic_credentials(), None);
        // "foobar" has no separator
        assert_eq!(RequestCredentials::from_authorization("Basic Zm9vYmFy").basic_credentials(), None);
    }

    #[test]
    fn test_basic_credentials_split_on_first_colon() {
        // base64("user:pa:ss")
        let creds = RequestCredentials::from_authorization("Basic dXNlcjpwYTpzcw==");
        assert_eq!(creds.basic_credentials(), Some(BasicCredentials::new("user", "pa:ss")));
    }

    #[test]
    fn test_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(RequestCredentials::from_headers(&headers), RequestCredentials::none());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer token"));
        let creds = RequestCredentials::from(&headers);
        assert_eq!(creds.authorization(), Some("Bearer token"));
        assert_eq!(creds.bearer_token(), Some("token"));
    }
}
