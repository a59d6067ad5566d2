/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The session endpoint, which recommends a shard count and reports how
//! many session starts remain.

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;

/// Session start allowance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartLimit {
    /// Starts allowed per reset window.
    pub total: u32,
    /// Starts remaining in the current window.
    pub remaining: u32,
    /// Milliseconds until the window resets.
    pub reset_after: u64,
}

/// The session endpoint's response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Gateway URL.
    pub url: String,
    /// Recommended shard count, at 1000 guilds per shard.
    pub shards: u32,
    /// Session start allowance.
    pub session_start_limit: SessionStartLimit,
}

/// Errors querying the session endpoint.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    /// The request failed or the response did not parse.
    #[error("session request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The endpoint answered with an error status.
    #[error("session endpoint returned {status}: {body}")]
    Status {
        /// The status.
        status: StatusCode,
        /// The response body.
        body: String,
    },
}

/// Something that can report session information.
#[async_trait]
pub trait SessionSource: Send + Sync + 'static {
    /// Query the session endpoint.
    async fn fetch(&self) -> Result<SessionInfo, SessionError>;
}

/// Queries `GET {base}/gateway/bot` with a bot token.
#[derive(Clone, Debug)]
pub struct GatewaySession {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl GatewaySession {
    /// A session source for the API at `base_url`. A leading `Bot ` on the
    /// token is optional.
    pub fn new(base_url: impl Into<String>, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: strip_bot_prefix(token).to_string(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/gateway/bot", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl SessionSource for GatewaySession {
    async fn fetch(&self) -> Result<SessionInfo, SessionError> {
        let response = self
            .client
            .get(self.endpoint())
            .header(AUTHORIZATION, format!("Bot {}", self.token))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SessionError::Status { status, body });
        }
        Ok(response.json().await?)
    }
}

/// A session source that always reports the same information.
#[derive(Clone, Debug)]
pub struct StaticSession(pub SessionInfo);

#[async_trait]
impl SessionSource for StaticSession {
    async fn fetch(&self) -> Result<SessionInfo, SessionError> {
        Ok(self.0.clone())
    }
}

/// Strip a case-insensitive `Bot` prefix, and any whitespace after it.
fn strip_bot_prefix(token: &str) -> &str {
    match token.get(..3) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bot") => token[3..].trim_start(),
        _ => token,
    }
}
