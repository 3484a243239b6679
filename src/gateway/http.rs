use async_trait::async_trait;
use chrono::{ DateTime, NaiveDateTime, Utc };
use log::{ debug, warn };
use reqwest::{ Client as HttpClient, RequestBuilder, StatusCode };
use serde::{ Deserialize, Deserializer, Serialize };
use serde_json::Value as JsonValue;
use std::time::Duration;
use url::Url;
use super::{ ConversationGateway, GatewayError, QueryReply };
use crate::models::chat::{ ConversationEntry, Delivery, EntryRecord, GeoPoint, Sender };
use crate::models::trip::{ SavedPlace, TripContext, TripKey };

const RESULT_OK: i64 = 200;
const RESULT_NOT_FOUND: i64 = 404;

/// Gateway speaking the trip server's JSON-over-HTTP contract.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    http: HttpClient,
    base_url: Url,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TripQuery<'a> {
    user_id: &'a str,
    trip_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SaveMessageRequest<'a> {
    user_id: &'a str,
    trip_id: &'a str,
    sender: Sender,
    message: &'a str,
    #[serde(rename = "isSerp", skip_serializing_if = "std::ops::Not::not")]
    is_serp: bool,
    #[serde(skip_serializing_if = "no_geo")]
    geo: &'a [GeoPoint],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    user_id: &'a str,
    trip_id: &'a str,
    sender: Sender,
    message: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TripPayload {
    #[serde(default, alias = "trip_id", deserialize_with = "string_or_number")]
    trip_id: String,
    #[serde(default, alias = "user_id", alias = "ownerUserId", deserialize_with = "string_or_number")]
    user_id: String,
    #[serde(default)]
    city: String,
    #[serde(default, alias = "start_date")]
    start_date: String,
    #[serde(default, alias = "end_date")]
    end_date: String,
    #[serde(default, alias = "ownerDisplayName")]
    nickname: Option<String>,
}

#[derive(Deserialize)]
struct TripsResponse {
    #[serde(default)]
    response: Vec<TripPayload>,
}

#[derive(Deserialize)]
struct MessagePayload {
    message: String,
    sender: String,
    #[serde(default, rename = "isSerp")]
    is_serp: Option<bool>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    geo: Option<Vec<GeoPoint>>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    messages: Vec<MessagePayload>,
}

#[derive(Deserialize)]
struct WelcomeResponse {
    welcome_message: String,
}

#[derive(Deserialize)]
struct QueryResponse {
    response: String,
    #[serde(default, rename = "isSerp")]
    is_serp: Option<bool>,
    #[serde(default)]
    geo: Option<Vec<GeoPoint>>,
}

#[derive(Deserialize)]
struct SavedPlacesResponse {
    #[serde(default)]
    response: Vec<SavedPlace>,
}

fn no_geo(geo: &&[GeoPoint]) -> bool {
    geo.is_empty()
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error> where D: Deserializer<'de> {
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => s,
        JsonValue::Null => String::new(),
        other => other.to_string(),
    })
}

/// Endpoints disagree on the key spelling; both forms are accepted.
fn result_code(body: &JsonValue) -> Option<i64> {
    body.get("result_code")
        .or_else(|| body.get("result code"))
        .and_then(JsonValue::as_i64)
}

fn check_result(body: JsonValue) -> Result<JsonValue, GatewayError> {
    match result_code(&body) {
        Some(RESULT_OK) => Ok(body),
        Some(RESULT_NOT_FOUND) => Err(GatewayError::NotFound),
        Some(code) => {
            let message = body
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string();
            Err(GatewayError::Rejected { code, message })
        }
        None =>
            Err(GatewayError::Rejected {
                code: 0,
                message: "response carried no result code".to_string(),
            }),
    }
}

fn parse_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Utc::now();
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return ts.with_timezone(&Utc);
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return naive.and_utc();
        }
    }
    warn!("Unrecognized message timestamp '{}', using current time", raw);
    Utc::now()
}

impl MessagePayload {
    fn into_entry(self) -> ConversationEntry {
        let sender = self.sender.parse::<Sender>().unwrap_or_else(|e| {
            warn!("{}; treating message as bot output", e);
            Sender::Bot
        });
        let timestamp = parse_timestamp(self.timestamp.as_deref());
        let geo = self.geo.unwrap_or_default();
        let entry = match (sender, self.is_serp.unwrap_or(false)) {
            (Sender::Bot, true) => ConversationEntry::structured(self.message, geo),
            (Sender::Bot, false) => ConversationEntry::bot(self.message),
            (Sender::User, _) => ConversationEntry::user(self.message),
        };
        entry.with_timestamp(timestamp).with_delivery(Delivery::Persisted)
    }
}

impl HttpGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self {
            http: HttpClient::builder().timeout(timeout).build()?,
            base_url: Url::parse(&base)?,
        })
    }

    fn endpoint(&self, route: &str) -> Result<Url, GatewayError> {
        Ok(self.base_url.join(route)?)
    }

    async fn send(&self, req: RequestBuilder) -> Result<String, GatewayError> {
        let resp = req.send().await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Err(GatewayError::NotFound),
            s if !s.is_success() => Err(GatewayError::Status(s.as_u16())),
            _ => Ok(resp.text().await?),
        }
    }

    async fn get_checked(&self, route: &str, key: &TripKey) -> Result<JsonValue, GatewayError> {
        let url = self.endpoint(route)?;
        debug!("GET {} for {}", url, key);
        let query = TripQuery { user_id: &key.user_id, trip_id: &key.trip_id };
        let body = self.send(self.http.get(url).query(&query)).await?;
        check_result(serde_json::from_str(&body)?)
    }

    async fn post_checked<T: Serialize + ?Sized>(
        &self,
        route: &str,
        payload: &T
    ) -> Result<JsonValue, GatewayError> {
        let url = self.endpoint(route)?;
        debug!("POST {}", url);
        let body = self.send(self.http.post(url).json(payload)).await?;
        check_result(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl ConversationGateway for HttpGateway {
    async fn fetch_trip_context(&self, key: &TripKey) -> Result<TripContext, GatewayError> {
        let body = self.get_checked("getMyTrips", key).await?;
        let trips: TripsResponse = serde_json::from_value(body)?;
        let trip = trips.response.into_iter().next().ok_or(GatewayError::NotFound)?;

        Ok(TripContext {
            trip_id: if trip.trip_id.is_empty() { key.trip_id.clone() } else { trip.trip_id },
            owner_user_id: if trip.user_id.is_empty() { key.user_id.clone() } else { trip.user_id },
            city: trip.city,
            start_date: trip.start_date,
            end_date: trip.end_date,
            owner_display_name: trip.nickname.unwrap_or_default(),
        })
    }

    async fn fetch_history(&self, key: &TripKey) -> Result<Vec<ConversationEntry>, GatewayError> {
        let body = self.get_checked("getChatMessages", key).await?;
        let messages: MessagesResponse = serde_json::from_value(body)?;
        Ok(messages.messages.into_iter().map(MessagePayload::into_entry).collect())
    }

    async fn fetch_or_create_welcome(
        &self,
        key: &TripKey
    ) -> Result<ConversationEntry, GatewayError> {
        let body = self.get_checked("getWelcomeMessage", key).await?;
        let welcome: WelcomeResponse = serde_json::from_value(body)?;
        Ok(ConversationEntry::bot(welcome.welcome_message).with_delivery(Delivery::Persisted))
    }

    async fn submit_query(&self, key: &TripKey, text: &str) -> Result<QueryReply, GatewayError> {
        let request = QueryRequest {
            user_id: &key.user_id,
            trip_id: &key.trip_id,
            sender: Sender::User,
            message: text,
        };
        let body = self.post_checked("callOpenAIFunction", &request).await?;
        let reply: QueryResponse = serde_json::from_value(body)?;
        let geo = reply.geo.unwrap_or_default();
        let is_structured = reply.is_serp.unwrap_or(!geo.is_empty());

        Ok(QueryReply { text: reply.response, is_structured, geo })
    }

    async fn persist_entry(&self, key: &TripKey, record: &EntryRecord) -> Result<(), GatewayError> {
        let request = SaveMessageRequest {
            user_id: &key.user_id,
            trip_id: &key.trip_id,
            sender: record.sender,
            message: &record.text,
            is_serp: record.is_structured,
            geo: &record.geo,
        };
        let url = self.endpoint("saveChatMessage")?;
        let body = self.send(self.http.post(url).json(&request)).await?;

        // The save endpoint may acknowledge with an empty or non-JSON body.
        match serde_json::from_str::<JsonValue>(&body) {
            Ok(value) if result_code(&value).is_some() => check_result(value).map(|_| ()),
            _ => Ok(()),
        }
    }

    async fn fetch_saved_places(&self, key: &TripKey) -> Result<Vec<SavedPlace>, GatewayError> {
        let body = self.get_checked("getSavePlace", key).await?;
        let places: SavedPlacesResponse = serde_json::from_value(body)?;
        Ok(places.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_both_result_code_spellings() {
        assert_eq!(result_code(&json!({ "result code": 200 })), Some(200));
        assert_eq!(result_code(&json!({ "result_code": 404 })), Some(404));
        assert_eq!(result_code(&json!({ "code": 200 })), None);
    }

    #[test]
    fn maps_result_codes_to_outcomes() {
        assert!(check_result(json!({ "result_code": 200 })).is_ok());
        assert!(check_result(json!({ "result_code": 404 })).unwrap_err().is_not_found());
        match check_result(json!({ "result_code": 500, "message": "boom" })) {
            Err(GatewayError::Rejected { code, message }) => {
                assert_eq!(code, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn history_payload_becomes_persisted_entry() {
        let payload: MessagePayload = serde_json::from_value(
            json!({
                "message": "A\n\nB",
                "sender": "bot",
                "isSerp": true,
                "timestamp": "2024-06-01 10:30:00",
                "geo": [[33.5, 126.5]]
            })
        ).unwrap();
        let entry = payload.into_entry();
        assert!(entry.is_structured);
        assert_eq!(entry.delivery, Delivery::Persisted);
        assert_eq!(entry.geo, vec![GeoPoint::from([33.5, 126.5])]);
        assert_eq!(entry.timestamp.to_rfc3339(), "2024-06-01T10:30:00+00:00");
    }

    #[test]
    fn trip_ids_accept_numbers() {
        let trip: TripPayload = serde_json::from_value(
            json!({ "tripId": 7, "userId": "u1", "city": "Seoul", "startDate": "2024-01-01", "endDate": "2024-01-03" })
        ).unwrap();
        assert_eq!(trip.trip_id, "7");
        assert_eq!(trip.nickname, None);
    }

    #[test]
    fn save_request_omits_plain_fields() {
        let request = SaveMessageRequest {
            user_id: "u1",
            trip_id: "t1",
            sender: Sender::User,
            message: "hi",
            is_serp: false,
            geo: &[],
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({ "userId": "u1", "tripId": "t1", "sender": "user", "message": "hi" })
        );
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let gateway = HttpGateway::new("http://localhost:5000/api", Duration::from_secs(1)).unwrap();
        assert_eq!(gateway.endpoint("getMyTrips").unwrap().as_str(), "http://localhost:5000/api/getMyTrips");
    }
}
