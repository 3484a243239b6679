use chrono::{ DateTime, Utc };
use serde::{ Serialize, Deserialize };
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Bot => "bot",
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Sender {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Sender::User),
            "bot" | "assistant" => Ok(Sender::Bot),
            _ => Err(format!("Unknown sender: '{}'", s)),
        }
    }
}

/// A `[latitude, longitude]` pair as sent by the recommendation endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl From<[f64; 2]> for GeoPoint {
    fn from(pair: [f64; 2]) -> Self {
        GeoPoint { latitude: pair[0], longitude: pair[1] }
    }
}

impl From<GeoPoint> for [f64; 2] {
    fn from(point: GeoPoint) -> Self {
        [point.latitude, point.longitude]
    }
}

/// Where an entry stands relative to the server copy of the conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    /// Loaded from, or created by, the server.
    Persisted,
    /// Queued for persistence.
    Pending,
    /// Every persistence attempt failed.
    Unsent,
    /// Generated on the client and never meant to be stored.
    Local,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub text: String,
    pub sender: Sender,
    pub is_structured: bool,
    pub timestamp: DateTime<Utc>,
    pub page_cursor: usize,
    /// Coordinates paired with the location blocks of a structured entry.
    pub geo: Vec<GeoPoint>,
    pub delivery: Delivery,
    /// Set on a user entry whose query failed, cleared on a successful retry.
    pub unanswered: bool,
}

impl ConversationEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender: Sender::User,
            is_structured: false,
            timestamp: Utc::now(),
            page_cursor: 0,
            geo: Vec::new(),
            delivery: Delivery::Pending,
            unanswered: false,
        }
    }

    pub fn bot(text: impl Into<String>) -> Self {
        Self {
            sender: Sender::Bot,
            ..Self::user(text)
        }
    }

    pub fn structured(text: impl Into<String>, geo: Vec<GeoPoint>) -> Self {
        Self {
            is_structured: true,
            geo,
            ..Self::bot(text)
        }
    }

    pub fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn record(&self) -> EntryRecord {
        EntryRecord {
            sender: self.sender,
            text: self.text.clone(),
            is_structured: self.is_structured,
            geo: self.geo.clone(),
        }
    }
}

/// The persisted shape of an entry: what `saveChatMessage` receives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub sender: Sender,
    pub text: String,
    pub is_structured: bool,
    pub geo: Vec<GeoPoint>,
}
