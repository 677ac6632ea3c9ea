// 🌐 QRZ Logbook client - the authoritative source of confirmed contacts
//
// GET https://logbook.qrz.com/api?KEY=...&ACTION=FETCH&OPTION=...
//
// The body is an HTML-escaped, form-encoded string:
//   RESULT=OK&COUNT=2&ADIF=&lt;call:5&gt;AB1CD...
// RESULT is OK, FAIL or AUTH; REASON explains a FAIL.

use super::adif;
use super::{ConfirmedSet, Verifier, VerifierError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "https://logbook.qrz.com/api";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(12);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct QrzConfig {
    pub api_key: String,
    pub endpoint: String,
    /// Per-request timeout
    pub request_timeout: Duration,
    /// Total attempts per fetch (transient failures only)
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl QrzConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        QrzConfig {
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Longest a fetch can take: every attempt timing out, plus the
    /// backoff between attempts.
    pub fn worst_case_duration(&self) -> Duration {
        let attempts = self.max_attempts.max(1);
        self.request_timeout * attempts + self.retry_backoff * (attempts - 1)
    }

    /// Key with everything but the edges hidden, for logs
    pub fn masked_key(&self) -> String {
        let chars: Vec<char> = self.api_key.chars().collect();
        if chars.len() <= 8 {
            return "****".to_string();
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

pub struct QrzLogbookClient {
    http: reqwest::Client,
    config: QrzConfig,
}

impl QrzLogbookClient {
    pub fn new(config: QrzConfig) -> Result<Self, VerifierError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("callsign-queue/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| VerifierError::Unavailable(format!("http client setup: {}", e)))?;

        Ok(QrzLogbookClient { http, config })
    }

    pub fn config(&self) -> &QrzConfig {
        &self.config
    }

    async fn fetch_once(&self, option: &str) -> Result<String, VerifierError> {
        let response = self
            .http
            .get(&self.config.endpoint)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .query(&[
                ("KEY", self.config.api_key.as_str()),
                ("ACTION", "FETCH"),
                ("OPTION", option),
            ])
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(VerifierError::AuthFailure(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(VerifierError::Unavailable(format!("HTTP {}", status)));
        }

        response.text().await.map_err(classify_transport)
    }
}

fn classify_transport(err: reqwest::Error) -> VerifierError {
    if err.is_timeout() {
        VerifierError::Timeout
    } else if err.is_decode() {
        VerifierError::ParseFailure(err.to_string())
    } else {
        VerifierError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl Verifier for QrzLogbookClient {
    fn name(&self) -> &str {
        "qrz-logbook"
    }

    async fn fetch_confirmed(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<ConfirmedSet, VerifierError> {
        let option = fetch_option(since);
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;

        let body = loop {
            tracing::debug!(
                attempt,
                option = %option,
                key = %self.config.masked_key(),
                "fetching QRZ logbook"
            );

            match self.fetch_once(&option).await {
                Ok(body) => break body,
                Err(err) if err.is_transient() && attempt < attempts => {
                    tracing::warn!(attempt, error = %err, "QRZ fetch failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };

        let confirmed = parse_fetch_response(&body, since)?;
        tracing::debug!(confirmed = confirmed.len(), "QRZ logbook parsed");
        Ok(confirmed)
    }
}

fn fetch_option(since: Option<DateTime<Utc>>) -> String {
    match since {
        Some(since) => format!("MODSINCE:{}", since.format("%Y-%m-%d")),
        None => "ALL".to_string(),
    }
}

// ============================================================================
// RESPONSE PARSING
// ============================================================================

fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn form_decode(value: &str) -> String {
    let spaced = value.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(spaced)
}

/// Turn a raw QRZ FETCH body into the set of confirmed callsigns.
pub fn parse_fetch_response(
    body: &str,
    since: Option<DateTime<Utc>>,
) -> Result<ConfirmedSet, VerifierError> {
    let decoded = unescape_html(body.trim());

    // ADIF is the last field and may itself contain '&' and '='
    let (head, adif) = match decoded.split_once("ADIF=") {
        Some((head, adif)) => (head, Some(form_decode(adif))),
        None => (decoded.as_str(), None),
    };

    let fields: HashMap<String, String> = head
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_ascii_uppercase(), form_decode(value)))
        .collect();

    let result = fields
        .get("RESULT")
        .ok_or_else(|| VerifierError::ParseFailure("missing RESULT field".to_string()))?;
    let reason = fields.get("REASON").cloned().unwrap_or_default();

    match result.trim().to_ascii_uppercase().as_str() {
        "OK" => {}
        "AUTH" => return Err(VerifierError::AuthFailure(reason)),
        "FAIL" => {
            let lower = reason.to_ascii_lowercase();
            if lower.contains("invalid api key")
                || lower.contains("auth")
                || lower.contains("access")
            {
                return Err(VerifierError::AuthFailure(reason));
            }
            if fields.get("COUNT").map(|c| c.trim()) == Some("0") {
                return Ok(ConfirmedSet::new());
            }
            return Err(VerifierError::ParseFailure(format!("FAIL: {}", reason)));
        }
        other => {
            return Err(VerifierError::ParseFailure(format!(
                "unexpected RESULT {:?}",
                other
            )))
        }
    }

    let Some(adif) = adif else {
        return Ok(ConfirmedSet::new());
    };

    let records = adif::parse_records(&adif)
        .map_err(|e| VerifierError::ParseFailure(e.to_string()))?;
    Ok(adif::confirmed_since(
        &records,
        since.map(|s| s.date_naive()),
    ))
}
