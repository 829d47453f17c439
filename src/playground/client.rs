use std::fmt;

use serde::Deserialize;

use super::form::GeneratePayload;

/// Successful reply from the generation endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub texts: Vec<String>,
    pub compute_time: f64,
}

/// Anything that kept a submission from producing a [`Completion`].
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFailure {
    pub status: Option<u16>,
    pub reason: String,
    pub content: String,
}

impl fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self
            .status
            .map_or_else(|| "None".to_string(), |code| code.to_string());
        write!(
            f,
            "Request failed, status_code={status}, reason={}, content={}",
            self.reason, self.content
        )
    }
}

impl std::error::Error for RequestFailure {}

#[derive(Deserialize)]
struct Reply {
    compute_time: f64,
    output: ReplyOutput,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReplyOutput {
    Texts(Vec<String>),
    Detailed { sequences: Vec<String> },
}

/// HTTP client for the server's generation endpoint.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    url: String,
}

impl BackendClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Posts one payload; the body is interpreted regardless of the status
    /// code, and anything that does not parse is a failure.
    pub async fn generate(&self, payload: &GeneratePayload) -> Result<Completion, RequestFailure> {
        let response = self
            .http
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|err| RequestFailure {
                status: err.status().map(|status| status.as_u16()),
                reason: err.to_string(),
                content: String::new(),
            })?;

        let status = response.status();
        let failure = |content: String| RequestFailure {
            status: Some(status.as_u16()),
            reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            content,
        };

        let body = response
            .bytes()
            .await
            .map_err(|err| failure(err.to_string()))?;
        let reply: Reply = serde_json::from_slice(&body)
            .map_err(|_| failure(String::from_utf8_lossy(&body).into_owned()))?;

        let texts = match reply.output {
            ReplyOutput::Texts(texts) => texts,
            ReplyOutput::Detailed { sequences } => sequences,
        };

        Ok(Completion {
            texts,
            compute_time: reply.compute_time,
        })
    }
}

/// Formats seconds with three significant digits, switching to exponent
/// notation for very small or large values (`0.123`, `1.5`, `1.23e+03`).
pub fn format_seconds(value: f64) -> String {
    const DIGITS: i32 = 3;

    if value == 0.0 {
        return "0.0".to_string();
    }
    if !value.is_finite() {
        return value.to_string();
    }

    let scientific = format!("{:.*e}", (DIGITS - 1) as usize, value);
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if exponent < -4 || exponent >= DIGITS {
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{}e{sign}{:02}", trim_zeros(mantissa), exponent.abs());
    }

    let decimals = (DIGITS - 1 - exponent).max(0) as usize;
    let fixed = trim_zeros(&format!("{value:.decimals$}")).to_string();
    if fixed.contains('.') {
        fixed
    } else {
        format!("{fixed}.0")
    }
}

fn trim_zeros(number: &str) -> &str {
    if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    }
}
