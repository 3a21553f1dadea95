use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::error::OrchestratorError;
use crate::util::http_client;

/// Failure of an outbound JSON request, split so callers can map timeouts
/// and specific status codes onto their own error families.
#[derive(Debug)]
pub enum HttpError {
    /// URL or header could not be built.
    Invalid(String),
    Timeout(String),
    Transport(String),
    Status { status: StatusCode, body: String },
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::Invalid(msg) => write!(f, "{msg}"),
            HttpError::Timeout(msg) => write!(f, "request timed out: {msg}"),
            HttpError::Transport(msg) => write!(f, "HTTP request failed: {msg}"),
            HttpError::Status { status, body } => write!(f, "HTTP {status}: {body}"),
        }
    }
}

impl std::error::Error for HttpError {}

impl From<HttpError> for OrchestratorError {
    fn from(err: HttpError) -> Self {
        OrchestratorError::Http(err.to_string())
    }
}

pub fn build_url(base: &str, path: &str) -> Result<Url, HttpError> {
    let base_url =
        Url::parse(base).map_err(|err| HttpError::Invalid(format!("Invalid base URL: {err}")))?;
    base_url
        .join(path)
        .map_err(|err| HttpError::Invalid(format!("Invalid path '{path}': {err}")))
}

pub fn auth_headers(token: &str) -> Result<HeaderMap, HttpError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| HttpError::Invalid("Invalid auth token".into()))?;
    headers.insert(AUTHORIZATION, value);

    Ok(headers)
}

pub async fn send_json(
    method: Method,
    url: Url,
    body: Option<Value>,
    headers: HeaderMap,
    timeout: Duration,
) -> Result<(StatusCode, String), HttpError> {
    let client = http_client(timeout).map_err(|err| HttpError::Invalid(err.to_string()))?;
    let mut request = client.request(method, url).headers(headers).timeout(timeout);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request.send().await.map_err(classify)?;
    let status = response.status();
    let text = response.text().await.map_err(classify)?;

    if !status.is_success() {
        return Err(HttpError::Status { status, body: text });
    }

    Ok((status, text))
}

fn classify(err: reqwest::Error) -> HttpError {
    if err.is_timeout() {
        HttpError::Timeout(err.to_string())
    } else {
        HttpError::Transport(err.to_string())
    }
}

/// Send a request and parse the JSON response body; an empty body yields `Value::Null`.
pub async fn request_json(
    method: Method,
    url: Url,
    body: Option<Value>,
    headers: HeaderMap,
    timeout: Duration,
) -> Result<Value, HttpError> {
    let (_, text) = send_json(method, url, body, headers, timeout).await?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text)
        .map_err(|err| HttpError::Transport(format!("Invalid response JSON: {err}")))
}
