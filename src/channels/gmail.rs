//! Gmail REST API message source.
//!
//! Exchanges the configured refresh token for an access token, lists
//! message ids with an `after:<unix>` query and fetches each one in `raw`
//! format, which is then parsed like any other RFC 5322 message. The Gmail
//! message id is the idempotency key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::channels::mime::parse_raw;
use crate::config::GmailConfig;
use crate::error::FetchError;
use crate::pipeline::{Message, MessageSource};

const SOURCE_NAME: &str = "gmail";

/// Gmail's `raw` field is base64url, with or without padding.
const RAW_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: String,
    raw: String,
    /// Milliseconds since the epoch, as a decimal string.
    internal_date: Option<String>,
}

struct AccessToken {
    value: SecretString,
    expires_at: Instant,
}

pub struct GmailSource {
    config: GmailConfig,
    http: reqwest::Client,
    token: Mutex<Option<AccessToken>>,
    closed: AtomicBool,
}

impl GmailSource {
    pub fn new(config: GmailConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            config,
            http,
            token: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/gmail/v1/users/{}/messages",
            self.config.api_base.trim_end_matches('/'),
            self.config.user_id
        )
    }

    /// Cached access token, refreshed a minute before it expires.
    async fn access_token(&self) -> Result<SecretString, FetchError> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.expose_secret()),
                ("refresh_token", self.config.refresh_token.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| unreachable(format!("token request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::AuthFailed {
                source_name: SOURCE_NAME.into(),
                reason: format!("token refresh returned {status}: {body}"),
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| invalid(format!("token response: {e}")))?;

        let value = SecretString::from(token.access_token);
        *guard = Some(AccessToken {
            value: value.clone(),
            expires_at: Instant::now()
                + Duration::from_secs(token.expires_in.saturating_sub(60)),
        });
        debug!(expires_in = token.expires_in, "Gmail access token refreshed");
        Ok(value)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .get(url)
            .bearer_auth(token.expose_secret())
            .query(query)
            .send()
            .await
            .map_err(|e| unreachable(format!("GET {url}: {e}")))?;

        match response.status() {
            s if s.is_success() => response
                .json()
                .await
                .map_err(|e| invalid(format!("GET {url}: {e}"))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                *self.token.lock().await = None;
                Err(FetchError::AuthFailed {
                    source_name: SOURCE_NAME.into(),
                    reason: format!("GET {url} returned {}", response.status()),
                })
            }
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                Err(unreachable(format!("GET {url} returned {s}")))
            }
            s => Err(invalid(format!("GET {url} returned {s}"))),
        }
    }

    async fn list_ids(&self, since: DateTime<Utc>) -> Result<Vec<String>, FetchError> {
        let url = self.messages_url();
        let q = format!("after:{}", since.timestamp());
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("q", q.as_str())];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }
            let page: ListResponse = self.get_json(&url, &query).await?;
            ids.extend(page.messages.into_iter().map(|m| m.id));

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }
        Ok(ids)
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>, FetchError> {
        let url = format!("{}/{id}", self.messages_url());
        let raw: RawMessage = self.get_json(&url, &[("format", "raw")]).await?;

        let bytes = RAW_ENGINE
            .decode(raw.raw.trim())
            .map_err(|e| invalid(format!("message {id}: bad base64: {e}")))?;

        Ok(parse_raw(&bytes, &raw.id).map(|mut message| {
            message.id = raw.id.clone();
            if message.received_at.is_none() {
                message.received_at = raw
                    .internal_date
                    .as_deref()
                    .and_then(|ms| ms.parse::<i64>().ok())
                    .and_then(DateTime::<Utc>::from_timestamp_millis);
            }
            message
        }))
    }
}

fn unreachable(reason: impl Into<String>) -> FetchError {
    FetchError::Unreachable {
        source_name: SOURCE_NAME.into(),
        reason: reason.into(),
    }
}

fn invalid(reason: impl Into<String>) -> FetchError {
    FetchError::InvalidResponse {
        source_name: SOURCE_NAME.into(),
        reason: reason.into(),
    }
}

#[async_trait]
impl MessageSource for GmailSource {
    fn name(&self) -> &str {
        SOURCE_NAME
    }

    async fn fetch_new(&self, since: DateTime<Utc>) -> Result<Vec<Message>, FetchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FetchError::Closed {
                source_name: SOURCE_NAME.into(),
            });
        }

        let ids = self.list_ids(since).await?;
        debug!(count = ids.len(), "Gmail list complete");

        let mut messages = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.get_message(id).await {
                Ok(Some(message)) => messages.push(message),
                Ok(None) => warn!(message_id = %id, "Failed to parse Gmail message"),
                Err(e) => warn!(message_id = %id, error = %e, "Failed to get Gmail message"),
            }
        }
        Ok(messages)
    }

    async fn close(&self) -> Result<(), FetchError> {
        self.closed.store(true, Ordering::Release);
        *self.token.lock().await = None;
        debug!("Gmail source closed");
        Ok(())
    }
}
