//! services/worker/src/adapters/youtube.rs
//!
//! This module contains the adapter for the liked-video source.
//! It implements the `LikedItemSource` port against the YouTube Data API, using the
//! access token stored on the user's linked account.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use likeshelf_core::{
    domain::{ItemPage, SourceItem},
    ports::{AuthFailure, DatabaseService, LikedItemSource, PortError, PortResult},
};
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements `LikedItemSource` for the user's liked YouTube videos.
#[derive(Clone)]
pub struct YoutubeLikesAdapter {
    http: reqwest::Client,
    base_url: String,
    db: Arc<dyn DatabaseService>,
}

impl YoutubeLikesAdapter {
    /// Creates a new `YoutubeLikesAdapter`. `base_url` has no trailing slash.
    pub fn new(base_url: String, timeout: Duration, db: Arc<dyn DatabaseService>) -> PortResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(Self { http, base_url, db })
    }

    async fn access_token(&self, user_id: Uuid) -> PortResult<String> {
        let account = self
            .db
            .linked_account(user_id)
            .await?
            .ok_or(PortError::Authentication(AuthFailure::NoLinkedAccount))?;
        let access_token = account
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or(PortError::Authentication(AuthFailure::NoAccessToken))?;

        // An expired token without a refresh token can never work again.
        let expired = account.expires_at.is_some_and(|at| at <= Utc::now());
        if expired && account.refresh_token.as_deref().map_or(true, str::is_empty) {
            return Err(PortError::Authentication(AuthFailure::NoRefreshToken));
        }
        Ok(access_token)
    }
}

//=========================================================================================
// Wire Types
//=========================================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<Video>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct Video {
    id: String,
    snippet: Option<Snippet>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    #[serde(default)]
    title: String,
    description: Option<String>,
    channel_title: Option<String>,
    channel_id: Option<String>,
    published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    thumbnails: Thumbnails,
}

#[derive(Deserialize, Default)]
struct Thumbnails {
    default: Option<Thumbnail>,
    medium: Option<Thumbnail>,
    high: Option<Thumbnail>,
    standard: Option<Thumbnail>,
    maxres: Option<Thumbnail>,
}

impl Thumbnails {
    /// The highest resolution on offer.
    fn best(self) -> Option<String> {
        [self.maxres, self.standard, self.high, self.medium, self.default]
            .into_iter()
            .flatten()
            .map(|thumbnail| thumbnail.url)
            .next()
    }
}

#[derive(Deserialize)]
struct Thumbnail {
    url: String,
}

#[derive(Deserialize, Default)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    reason: String,
}

impl Video {
    fn into_source_item(self) -> SourceItem {
        let snippet = self.snippet;
        let (title, description, channel_name, channel_id, published_at, thumbnail_url) = match snippet {
            Some(s) => (
                s.title,
                s.description.filter(|d| !d.is_empty()),
                s.channel_title,
                s.channel_id,
                s.published_at,
                s.thumbnails.best(),
            ),
            None => (String::new(), None, None, None, None, None),
        };
        SourceItem {
            external_id: self.id,
            title,
            description,
            thumbnail_url,
            channel_name,
            channel_id,
            published_at,
        }
    }
}

/// Maps an unsuccessful response onto the port's error classes.
fn classify_failure(status: StatusCode, body: &str) -> PortError {
    let envelope: ErrorEnvelope = serde_json::from_str(body).unwrap_or_default();
    let (message, reasons): (String, Vec<String>) = match envelope.error {
        Some(error) => (
            error.message,
            error.errors.into_iter().map(|detail| detail.reason).collect(),
        ),
        None => (body.chars().take(200).collect(), Vec::new()),
    };
    let detail = format!("YouTube API returned {}: {}", status.as_u16(), message);

    match status {
        StatusCode::UNAUTHORIZED => PortError::Authentication(AuthFailure::RefreshFailed),
        StatusCode::TOO_MANY_REQUESTS => PortError::RateLimited(detail),
        StatusCode::FORBIDDEN
            if reasons
                .iter()
                .any(|r| matches!(r.as_str(), "rateLimitExceeded" | "userRateLimitExceeded" | "quotaExceeded")) =>
        {
            PortError::RateLimited(detail)
        }
        s if s.is_server_error() => PortError::Transient(detail),
        _ => PortError::Unexpected(detail),
    }
}

fn transport_error(e: reqwest::Error) -> PortError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        PortError::Transient(e.to_string())
    } else {
        PortError::Unexpected(e.to_string())
    }
}

//=========================================================================================
// `LikedItemSource` Trait Implementation
//=========================================================================================

#[async_trait]
impl LikedItemSource for YoutubeLikesAdapter {
    async fn fetch_page(
        &self,
        user_id: Uuid,
        page_size: usize,
        page_token: Option<&str>,
    ) -> PortResult<ItemPage> {
        let token = self.access_token(user_id).await?;
        let url = format!("{}/videos", self.base_url);
        let max_results = page_size.to_string();

        let mut query: Vec<(&str, &str)> = vec![
            ("part", "snippet"),
            ("myRating", "like"),
            ("maxResults", max_results.as_str()),
        ];
        if let Some(page_token) = page_token {
            query.push(("pageToken", page_token));
        }

        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body));
        }

        let page: VideoListResponse = response
            .json()
            .await
            .map_err(|e| PortError::Unexpected(format!("Malformed YouTube response: {}", e)))?;

        debug!(
            %user_id,
            returned = page.items.len(),
            has_more = page.next_page_token.is_some(),
            "Fetched liked videos page"
        );

        Ok(ItemPage {
            items: page.items.into_iter().map(Video::into_source_item).collect(),
            next_token: page.next_page_token.filter(|t| !t.is_empty()),
        })
    }
}
