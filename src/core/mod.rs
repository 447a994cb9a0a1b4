pub mod context;
pub mod middleware;


use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;

use self::middleware::AuthMiddleware;

#[derive(Debug, Deserialize)]
pub struct GoogleErrorResponse {
    pub error: GoogleErrorDetails,
}

#[derive(Debug, Deserialize)]
pub struct GoogleErrorDetails {
    pub code: u16,
    pub message: String,
    pub status: Option<String>,
}

impl GoogleErrorResponse {
    pub fn display_message(&self) -> String {
        match &self.error.status {
            Some(status) => format!("{} ({} {})", self.error.message, self.error.code, status),
            None => format!("{} (code: {})", self.error.message, self.error.code),
        }
    }
}

/// Turns a non-success response into a readable message, falling back to the
/// status line when the body is not a Google API error document.
pub async fn parse_error_response(response: reqwest::Response, default_msg: &str) -> String {
    let status = response.status();
    match response.json::<GoogleErrorResponse>().await {
        Ok(error_resp) => error_resp.display_message(),
        Err(_) => format!("{}: {}", default_msg, status),
    }
}

/// Client used by every service module: transient failures retried with
/// exponential backoff, then the OAuth2 bearer token attached.
pub(crate) fn authorized_client(middleware: AuthMiddleware) -> ClientWithMiddleware {
    let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);

    ClientBuilder::new(Client::new())
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .with(middleware)
        .build()
}

/// Client that only attaches the bearer token. Used for calls that are not
/// safe to repeat, where the caller owns the retry policy.
pub(crate) fn authenticated_client(middleware: AuthMiddleware) -> ClientWithMiddleware {
    ClientBuilder::new(Client::new()).with(middleware).build()
}
