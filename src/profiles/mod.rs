//! Dispatcharr stream-profile switching
//!
//! Runs for selected profiles activate each profile through the server API
//! before tuning the proxied playlist, then put the original profile back.

use std::fmt;
use std::str::FromStr;

use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, REFERER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::{debug, info};

use crate::constants::{HTTP_TIMEOUT, RAW_STREAM_MARKER};
use crate::types::Channel;

const DEFAULT_PROFILE_KEY: &str = "default-stream-profile";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("API request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("API login failed: {0}")]
    Login(String),

    #[error("Server returned {status} for {url}")]
    Status { url: String, status: StatusCode },

    #[error("Setting '{0}' not found on the server")]
    SettingNotFound(String),

    #[error("Invalid authorization token")]
    InvalidToken,
}

/// Which server profiles to test, by 1-based position in the server's list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileSelection {
    All,
    Numbers(Vec<usize>),
}

impl FromStr for ProfileSelection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(ProfileSelection::All);
        }
        let numbers = s
            .split(',')
            .map(|part| match part.trim().parse::<usize>() {
                Ok(n) if n >= 1 => Ok(n),
                _ => Err(format!("invalid profile number '{}', use comma-separated numbers or 'all'", part.trim())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ProfileSelection::Numbers(numbers))
    }
}

impl ProfileSelection {
    /// Picks the selected profiles in the order given; out-of-range numbers are skipped.
    pub fn apply<'p>(&self, profiles: &'p [StreamProfile]) -> Vec<&'p StreamProfile> {
        match self {
            ProfileSelection::All => profiles.iter().collect(),
            ProfileSelection::Numbers(numbers) => numbers
                .iter()
                .filter_map(|n| profiles.get(n.wrapping_sub(1)))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamProfile {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
}

/// The server setting holding the active profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveProfile {
    pub setting_id: String,
    pub profile_id: String,
}

#[derive(Debug, Deserialize)]
struct Setting {
    #[serde(deserialize_with = "string_or_number")]
    id: String,
    key: String,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access: Option<String>,
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected string or number, got {other}"))),
    }
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s)),
        serde_json::Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(serde::de::Error::custom(format!("expected string or number, got {other}"))),
    }
}

/// Authenticated API session
pub struct DispatcharrClient {
    base_url: String,
    http: Client,
}

impl DispatcharrClient {
    /// Obtains a JWT and builds a client that sends it with every request.
    pub async fn login(base_url: &str, user_agent: &str, username: &str, password: &str) -> Result<Self, ApiError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let url = format!("{base_url}/api/accounts/token/");
        let anonymous = build_client(user_agent, HeaderMap::new()).map_err(|e| request_error(&url, e))?;

        let response = anonymous
            .post(&url)
            .json(&serde_json::json!({ "username": username, "password": password }))
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        if !response.status().is_success() {
            return Err(ApiError::Login(format!("server returned {}", response.status())));
        }
        let token: TokenResponse = response.json().await.map_err(|e| request_error(&url, e))?;
        let access = token
            .access
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ApiError::Login("login returned no token".into()))?;

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {access}")).map_err(|_| ApiError::InvalidToken)?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert("x-requested-with", HeaderValue::from_static("XMLHttpRequest"));
        if let Ok(referer) = HeaderValue::from_str(&format!("{base_url}/")) {
            headers.insert(REFERER, referer);
        }
        let http = build_client(user_agent, headers).map_err(|e| request_error(&url, e))?;

        info!("Successfully authenticated with Dispatcharr API using JWT.");
        Ok(Self { base_url, http })
    }

    /// HTTP client carrying the session token, for authenticated playlist downloads
    pub fn http(&self) -> &Client {
        &self.http
    }

    pub async fn list_profiles(&self) -> Result<Vec<StreamProfile>, ApiError> {
        self.get_json("/api/core/streamprofiles/").await
    }

    pub async fn active_profile(&self) -> Result<ActiveProfile, ApiError> {
        let settings: Vec<Setting> = self.get_json("/api/core/settings/").await?;
        settings
            .into_iter()
            .find(|s| s.key == DEFAULT_PROFILE_KEY)
            .and_then(|s| {
                Some(ActiveProfile {
                    setting_id: s.id,
                    profile_id: s.value?,
                })
            })
            .ok_or_else(|| ApiError::SettingNotFound(DEFAULT_PROFILE_KEY.into()))
    }

    pub async fn set_active_profile(&self, setting_id: &str, profile_id: &str) -> Result<(), ApiError> {
        let url = format!("{}/api/core/settings/{setting_id}/", self.base_url);
        let response = self
            .http
            .patch(&url)
            .json(&serde_json::json!({ "value": profile_id }))
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;
        check_status(&url, response.status())?;
        info!("  -> Set active profile to ID: {profile_id}");
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = format!("{}{path}", self.base_url);
        debug!("GET {url}");
        let response = self.http.get(&url).send().await.map_err(|e| request_error(&url, e))?;
        check_status(&url, response.status())?;
        response.json().await.map_err(|e| request_error(&url, e))
    }
}

fn build_client(user_agent: &str, headers: HeaderMap) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(user_agent)
        .default_headers(headers)
        .timeout(HTTP_TIMEOUT)
        .build()
}

fn request_error(url: &str, source: reqwest::Error) -> ApiError {
    ApiError::Request {
        url: url.to_string(),
        source,
    }
}

fn check_status(url: &str, status: StatusCode) -> Result<(), ApiError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(ApiError::Status {
            url: url.to_string(),
            status,
        })
    }
}

/// How a playlist's streams reach the player
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileType {
    Ffmpeg,
    Proxy,
    Direct,
}

impl ProfileType {
    /// Classifies one entry relative to the server's base URL.
    pub fn detect(channel: &Channel, server_base_url: &str) -> Self {
        if channel.name.contains(RAW_STREAM_MARKER) {
            ProfileType::Ffmpeg
        } else if channel.stream_url.contains("/proxy/") || channel.stream_url.starts_with(server_base_url) {
            ProfileType::Proxy
        } else {
            ProfileType::Direct
        }
    }

    /// Type of a whole playlist, judged by its first entry
    pub fn detect_playlist(channels: &[Channel], server_base_url: &str) -> Option<Self> {
        channels.first().map(|c| Self::detect(c, server_base_url))
    }
}

impl fmt::Display for ProfileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProfileType::Ffmpeg => "Ffmpeg",
            ProfileType::Proxy => "Proxy",
            ProfileType::Direct => "Direct",
        })
    }
}
