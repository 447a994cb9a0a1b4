//! `multipart/mixed` encoding for the FCM batch endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::GoogleErrorResponse;
use crate::messaging::models::{Message, SendResponse, SendResponseInternal};
use crate::messaging::{MessagingError, SendRequest};

static BOUNDARY_SEQ: AtomicU64 = AtomicU64::new(0);

/// A boundary unique within the process.
pub(crate) fn new_boundary() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!("batch_{}_{}", nanos, BOUNDARY_SEQ.fetch_add(1, Ordering::Relaxed))
}

/// One `application/http` part per message, each a `messages:send` call.
pub(crate) fn encode(
    messages: &[Message],
    send_path: &str,
    dry_run: bool,
    boundary: &str,
) -> Result<String, MessagingError> {
    let mut body = String::new();

    for (index, message) in messages.iter().enumerate() {
        let request = serde_json::to_string(&SendRequest {
            validate_only: dry_run,
            message,
        })?;

        body.push_str(&format!("--{}\r\n", boundary));
        body.push_str("Content-Type: application/http\r\n");
        body.push_str("Content-Transfer-Encoding: binary\r\n");
        body.push_str(&format!("Content-ID: {}\r\n\r\n", index + 1));
        body.push_str(&format!("POST {}\r\n", send_path));
        body.push_str("Content-Type: application/json\r\n\r\n");
        body.push_str(&request);
        body.push_str("\r\n");
    }

    body.push_str(&format!("--{}--\r\n", boundary));
    Ok(body)
}

/// Boundary declared in a `multipart/mixed` content type.
pub(crate) fn boundary_of(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))
        .map(|boundary| boundary.trim_matches('"'))
}

/// Splits a batch response into one [`SendResponse`] per part.
pub(crate) fn decode(body: &str, boundary: &str) -> Result<Vec<SendResponse>, MessagingError> {
    let delimiter = format!("--{}", boundary);

    body.split(delimiter.as_str())
        .map(str::trim)
        .filter(|part| !part.is_empty() && *part != "--")
        .map(decode_part)
        .collect()
}

fn decode_part(part: &str) -> Result<SendResponse, MessagingError> {
    // part headers, then the embedded HTTP response
    let (_, http) = split_head(part)
        .ok_or_else(|| MessagingError::MultipartError("part has no body".to_string()))?;
    let (head, json) = split_head(http)
        .ok_or_else(|| MessagingError::MultipartError("embedded response has no body".to_string()))?;

    let status = head
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| MessagingError::MultipartError(format!("bad status line in part: {}", head)))?;
    let json = json.trim();

    if (200..300).contains(&status) {
        let sent: SendResponseInternal = serde_json::from_str(json)
            .map_err(|e| MessagingError::MultipartError(format!("unreadable send result: {}", e)))?;
        return Ok(SendResponse {
            success: true,
            message_id: Some(sent.name),
            error: None,
        });
    }

    let error = match serde_json::from_str::<GoogleErrorResponse>(json) {
        Ok(error) => error.display_message(),
        Err(_) => format!("send failed with status {}: {}", status, json),
    };
    Ok(SendResponse {
        success: false,
        message_id: None,
        error: Some(error),
    })
}

fn split_head(text: &str) -> Option<(&str, &str)> {
    text.split_once("\r\n\r\n").or_else(|| text.split_once("\n\n"))
}
