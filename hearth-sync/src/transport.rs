//! Change-feed transport.
//!
//! A subscription is one long-lived request carrying the table, the
//! compiled predicate, its bound parameters and, when resuming, the last
//! applied cursor:
//!
//! ```text
//! GET /v1/feed?table=messages&where=channel_id+%3D+ANY%28%241%29&params=[[..]]&cursor=41
//! Authorization: Bearer <token>
//! ```
//!
//! The default transport upgrades that request to a WebSocket and yields
//! text frames as raw chunks; record framing is left to
//! [`FeedDecoder`](crate::feed::FeedDecoder).

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{self, Message};
use url::Url;

use crate::config::{parse_feed_url, ConfigError, SyncConfig};
use crate::context::Credential;
use crate::feed::Cursor;
use crate::policy::{Predicate, Table};

/// Stream-level failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("feed responded with status {0}")]
    Status(u16),
    #[error("feed rejected credentials with status {0}")]
    Auth(u16),
    #[error("malformed feed payload: {0}")]
    Malformed(String),
    #[error("feed closed by server")]
    Ended,
}

impl StreamError {
    pub fn from_status(code: u16) -> Self {
        match code {
            401 | 403 => Self::Auth(code),
            _ => Self::Status(code),
        }
    }

    /// Authorization-class errors are terminal; retrying with the same
    /// token cannot succeed.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Everything needed to (re)open a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRequest {
    pub table: Table,
    pub predicate: Predicate,
    pub cursor: Option<Cursor>,
    pub bearer: Option<Credential>,
}

impl FeedRequest {
    pub fn new(table: Table, predicate: Predicate) -> Self {
        Self {
            table,
            predicate,
            cursor: None,
            bearer: None,
        }
    }

    /// `base` with this request's query parameters appended.
    pub fn to_url(&self, base: &Url) -> Result<Url, StreamError> {
        let params = serde_json::to_string(&self.predicate.params)
            .map_err(|e| StreamError::Transport(format!("cannot encode params: {e}")))?;
        let mut url = base.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("table", self.table.name())
                .append_pair("where", &self.predicate.sql)
                .append_pair("params", &params);
            if let Some(cursor) = self.cursor {
                query.append_pair("cursor", &cursor.to_string());
            }
        }
        Ok(url)
    }
}

/// Raw text chunks of one feed connection.
pub type FeedStream = BoxStream<'static, Result<String, StreamError>>;

/// Opens change-feed connections.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn open(&self, request: &FeedRequest) -> Result<FeedStream, StreamError>;
}

/// WebSocket change-feed transport.
pub struct WsFeedTransport {
    endpoint: Url,
}

impl WsFeedTransport {
    pub fn new(endpoint: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            endpoint: parse_feed_url(endpoint)?,
        })
    }

    /// Transport for the configured `feed_url`.
    pub fn from_config(config: &SyncConfig) -> Result<Self, ConfigError> {
        Self::new(&config.feed_url)
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

fn map_connect_error(error: tungstenite::Error) -> StreamError {
    match error {
        tungstenite::Error::Http(response) => StreamError::from_status(response.status().as_u16()),
        other => StreamError::Transport(other.to_string()),
    }
}

#[async_trait]
impl FeedTransport for WsFeedTransport {
    async fn open(&self, request: &FeedRequest) -> Result<FeedStream, StreamError> {
        let url = request.to_url(&self.endpoint)?;
        let mut ws_request = url
            .as_str()
            .into_client_request()
            .map_err(|e| StreamError::Transport(e.to_string()))?;
        if let Some(credential) = &request.bearer {
            let value = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
                .map_err(|e| StreamError::Transport(format!("invalid bearer token: {e}")))?;
            ws_request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _response) = tokio_tungstenite::connect_async(ws_request)
            .await
            .map_err(map_connect_error)?;
        log::debug!("feed connected: {} cursor={:?}", request.table, request.cursor);

        let chunks = ws_stream.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => Some(
                    String::from_utf8(data.to_vec())
                        .map_err(|e| StreamError::Malformed(e.to_string())),
                ),
                Ok(_) => None,
                Err(e) => Some(Err(StreamError::Transport(e.to_string()))),
            }
        });
        Ok(chunks.boxed())
    }
}
