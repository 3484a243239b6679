pub mod http;
pub mod mock;

use async_trait::async_trait;
use log::info;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use crate::cli::Args;
use crate::models::chat::{ ConversationEntry, EntryRecord, GeoPoint };
use crate::models::trip::{ SavedPlace, TripContext, TripKey };

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Resource not found")]
    NotFound,
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Unexpected HTTP status {0}")]
    Status(u16),
    #[error("Server rejected request with result code {code}: {message}")]
    Rejected {
        code: i64,
        message: String,
    },
    #[error("Invalid response payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Invalid gateway URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound)
    }
}

/// What the recommendation endpoint answered to a user query.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryReply {
    pub text: String,
    pub is_structured: bool,
    pub geo: Vec<GeoPoint>,
}

impl QueryReply {
    pub fn plain(text: impl Into<String>) -> Self {
        Self { text: text.into(), is_structured: false, geo: Vec::new() }
    }

    pub fn structured(text: impl Into<String>, geo: Vec<GeoPoint>) -> Self {
        Self { text: text.into(), is_structured: true, geo }
    }

    pub fn into_entry(self) -> ConversationEntry {
        if self.is_structured {
            ConversationEntry::structured(self.text, self.geo)
        } else {
            ConversationEntry::bot(self.text)
        }
    }
}

/// Request/response boundary to the trip-planning server. Implementations hold
/// no conversation state between calls.
#[async_trait]
pub trait ConversationGateway: Send + Sync {
    async fn fetch_trip_context(&self, key: &TripKey) -> Result<TripContext, GatewayError>;

    /// `GatewayError::NotFound` means the trip has no conversation yet.
    async fn fetch_history(&self, key: &TripKey) -> Result<Vec<ConversationEntry>, GatewayError>;

    /// Returns a welcome entry that the server has already stored.
    async fn fetch_or_create_welcome(
        &self,
        key: &TripKey
    ) -> Result<ConversationEntry, GatewayError>;

    async fn submit_query(&self, key: &TripKey, text: &str) -> Result<QueryReply, GatewayError>;

    async fn persist_entry(&self, key: &TripKey, record: &EntryRecord) -> Result<(), GatewayError>;

    async fn fetch_saved_places(&self, key: &TripKey) -> Result<Vec<SavedPlace>, GatewayError>;
}

pub fn create_gateway(args: &Args) -> Result<Arc<dyn ConversationGateway>, GatewayError> {
    info!("Trip API will be reached at: {}", args.api_url);
    let gateway = http::HttpGateway::new(
        &args.api_url,
        Duration::from_secs(args.request_timeout_secs)
    )?;
    Ok(Arc::new(gateway))
}
