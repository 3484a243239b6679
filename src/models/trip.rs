use chrono::{ DateTime, NaiveDate };
use serde::{ Serialize, Deserialize };
use std::fmt;

/// Identifies one user's conversation about one trip.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TripKey {
    pub user_id: String,
    pub trip_id: String,
}

impl TripKey {
    pub fn new(user_id: impl Into<String>, trip_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), trip_id: trip_id.into() }
    }
}

impl fmt::Display for TripKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user_id, self.trip_id)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TripContext {
    pub trip_id: String,
    pub owner_user_id: String,
    pub city: String,
    pub start_date: String,
    pub end_date: String,
    pub owner_display_name: String,
}

impl TripContext {
    pub fn with_display_name_fallback(mut self, nickname: &str) -> Self {
        if self.owner_display_name.trim().is_empty() {
            self.owner_display_name = nickname.to_string();
        }
        self
    }

    pub fn formatted_start(&self, format: &str) -> String {
        format_trip_date(&self.start_date, format)
    }

    pub fn formatted_end(&self, format: &str) -> String {
        format_trip_date(&self.end_date, format)
    }
}

/// Formats an RFC 3339 timestamp or a plain `YYYY-MM-DD` date; anything else is
/// returned unchanged.
pub fn format_trip_date(raw: &str, format: &str) -> String {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return ts.date_naive().format(format).to_string();
    }
    let date_part = raw.get(..10).unwrap_or(raw);
    match NaiveDate::parse_from_str(date_part, "%Y-%m-%d") {
        Ok(date) => date.format(format).to_string(),
        Err(_) => raw.to_string(),
    }
}

/// A place the user saved to the trip, owned by the trip-place collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedPlace {
    pub title: String,
    #[serde(default)]
    pub address: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub description: String,
}
