use async_trait::async_trait;
use std::collections::{ HashMap, VecDeque };
use std::sync::{ Mutex, MutexGuard };
use std::time::Duration;
use super::{ ConversationGateway, GatewayError, QueryReply };
use crate::models::chat::{ ConversationEntry, Delivery, EntryRecord };
use crate::models::trip::{ SavedPlace, TripContext, TripKey };

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pre-scripted in-memory gateway for tests. Each call pops the next scripted
/// outcome for its operation; unscripted calls fall back to behaving like a
/// small server that remembers every persisted entry.
pub struct ScriptedGateway {
    context: TripContext,
    context_failures: Mutex<VecDeque<GatewayError>>,
    histories: Mutex<VecDeque<Result<Vec<ConversationEntry>, GatewayError>>>,
    welcomes: Mutex<VecDeque<Result<String, GatewayError>>>,
    replies: Mutex<VecDeque<(Duration, Result<QueryReply, GatewayError>)>>,
    persist_failures: Mutex<VecDeque<GatewayError>>,
    saved_places: Mutex<Vec<SavedPlace>>,
    persisted: Mutex<Vec<EntryRecord>>,
    queries: Mutex<Vec<String>>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl ScriptedGateway {
    pub fn new(context: TripContext) -> Self {
        Self {
            context,
            context_failures: Mutex::new(VecDeque::new()),
            histories: Mutex::new(VecDeque::new()),
            welcomes: Mutex::new(VecDeque::new()),
            replies: Mutex::new(VecDeque::new()),
            persist_failures: Mutex::new(VecDeque::new()),
            saved_places: Mutex::new(Vec::new()),
            persisted: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail_context(&self, error: GatewayError) -> &Self {
        lock(&self.context_failures).push_back(error);
        self
    }

    pub fn script_history(&self, outcome: Result<Vec<ConversationEntry>, GatewayError>) -> &Self {
        lock(&self.histories).push_back(outcome);
        self
    }

    pub fn script_welcome(&self, outcome: Result<String, GatewayError>) -> &Self {
        lock(&self.welcomes).push_back(outcome);
        self
    }

    pub fn script_reply(&self, outcome: Result<QueryReply, GatewayError>) -> &Self {
        self.script_delayed_reply(Duration::ZERO, outcome)
    }

    pub fn script_delayed_reply(
        &self,
        delay: Duration,
        outcome: Result<QueryReply, GatewayError>
    ) -> &Self {
        lock(&self.replies).push_back((delay, outcome));
        self
    }

    /// The next `count` persistence attempts fail.
    pub fn fail_persists(&self, count: usize) -> &Self {
        let mut failures = lock(&self.persist_failures);
        for _ in 0..count {
            failures.push_back(GatewayError::Status(503));
        }
        self
    }

    pub fn set_saved_places(&self, places: Vec<SavedPlace>) -> &Self {
        *lock(&self.saved_places) = places;
        self
    }

    pub fn call_count(&self, operation: &str) -> usize {
        lock(&self.calls).get(operation).copied().unwrap_or(0)
    }

    pub fn persisted(&self) -> Vec<EntryRecord> {
        lock(&self.persisted).clone()
    }

    pub fn queries(&self) -> Vec<String> {
        lock(&self.queries).clone()
    }

    fn record_call(&self, operation: &'static str) {
        *lock(&self.calls).entry(operation).or_insert(0) += 1;
    }
}

#[async_trait]
impl ConversationGateway for ScriptedGateway {
    async fn fetch_trip_context(&self, _key: &TripKey) -> Result<TripContext, GatewayError> {
        self.record_call("fetch_trip_context");
        match lock(&self.context_failures).pop_front() {
            Some(error) => Err(error),
            None => Ok(self.context.clone()),
        }
    }

    async fn fetch_history(&self, _key: &TripKey) -> Result<Vec<ConversationEntry>, GatewayError> {
        self.record_call("fetch_history");
        if let Some(outcome) = lock(&self.histories).pop_front() {
            return outcome;
        }
        let persisted = lock(&self.persisted);
        if persisted.is_empty() {
            return Err(GatewayError::NotFound);
        }
        Ok(
            persisted
                .iter()
                .map(|record| {
                    let entry = if record.is_structured {
                        ConversationEntry::structured(record.text.clone(), record.geo.clone())
                    } else {
                        ConversationEntry::bot(record.text.clone())
                    };
                    ConversationEntry { sender: record.sender, ..entry }.with_delivery(
                        Delivery::Persisted
                    )
                })
                .collect()
        )
    }

    async fn fetch_or_create_welcome(
        &self,
        _key: &TripKey
    ) -> Result<ConversationEntry, GatewayError> {
        self.record_call("fetch_or_create_welcome");
        let outcome = lock(&self.welcomes)
            .pop_front()
            .unwrap_or_else(|| Ok(format!("Welcome to {}!", self.context.city)));
        let text = outcome?;
        let entry = ConversationEntry::bot(text).with_delivery(Delivery::Persisted);
        lock(&self.persisted).push(entry.record());
        Ok(entry)
    }

    async fn submit_query(&self, _key: &TripKey, text: &str) -> Result<QueryReply, GatewayError> {
        self.record_call("submit_query");
        lock(&self.queries).push(text.to_string());
        let scripted = lock(&self.replies).pop_front();
        match scripted {
            Some((delay, outcome)) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                outcome
            }
            None =>
                Err(GatewayError::Rejected {
                    code: 500,
                    message: "no scripted reply".to_string(),
                }),
        }
    }

    async fn persist_entry(&self, _key: &TripKey, record: &EntryRecord) -> Result<(), GatewayError> {
        self.record_call("persist_entry");
        if let Some(error) = lock(&self.persist_failures).pop_front() {
            return Err(error);
        }
        lock(&self.persisted).push(record.clone());
        Ok(())
    }

    async fn fetch_saved_places(&self, _key: &TripKey) -> Result<Vec<SavedPlace>, GatewayError> {
        self.record_call("fetch_saved_places");
        Ok(lock(&self.saved_places).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{ self, AssertUnwindSafe };

    fn trip() -> TripContext {
        TripContext {
            trip_id: "t1".into(),
            owner_user_id: "u1".into(),
            city: "Jeonju".into(),
            start_date: "2024-05-01".into(),
            end_date: "2024-05-02".into(),
            owner_display_name: String::new(),
        }
    }

    #[tokio::test]
    async fn keeps_working_after_a_poisoned_lock() {
        let gateway = ScriptedGateway::new(trip());
        let _ = panic::catch_unwind(
            AssertUnwindSafe(|| {
                let _guard = gateway.queries.lock().unwrap();
                panic!("poison the query log");
            })
        );
        assert!(gateway.queries.is_poisoned());

        gateway.script_reply(Ok(QueryReply::plain("bibimbap")));
        let key = TripKey::new("u1", "t1");
        let reply = gateway.submit_query(&key, "what to eat?").await.unwrap();

        assert_eq!(reply.text, "bibimbap");
        assert_eq!(gateway.queries(), vec!["what to eat?"]);
        assert_eq!(gateway.call_count("submit_query"), 1);
    }
}
