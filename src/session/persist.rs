use log::{ error, info, warn };
use std::sync::{ Arc, RwLock };
use std::time::Duration;
use tokio::sync::{ mpsc, oneshot };
use crate::gateway::ConversationGateway;
use crate::history::MessageStore;
use crate::models::chat::{ Delivery, EntryRecord };
use crate::models::trip::TripKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0 = first retry).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

enum PersistIntent {
    Save {
        index: usize,
        record: EntryRecord,
    },
    Flush(oneshot::Sender<()>),
}

/// FIFO queue of entries waiting to reach the server. A single worker drains
/// it, so the server receives entries in the order they were appended.
#[derive(Clone)]
pub struct PersistQueue {
    tx: mpsc::UnboundedSender<PersistIntent>,
}

impl PersistQueue {
    /// Spawns the worker on the current tokio runtime. The worker exits once
    /// every queue handle is dropped.
    pub fn spawn(
        gateway: Arc<dyn ConversationGateway>,
        store: Arc<RwLock<MessageStore>>,
        key: TripKey,
        policy: RetryPolicy
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(rx, gateway, store, key, policy));
        Self { tx }
    }

    pub fn enqueue(&self, index: usize, record: EntryRecord) {
        if self.tx.send(PersistIntent::Save { index, record }).is_err() {
            error!("Persistence worker stopped; entry {} will not be saved", index);
        }
    }

    /// Resolves once every intent queued before this call has been handled.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(PersistIntent::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<PersistIntent>,
    gateway: Arc<dyn ConversationGateway>,
    store: Arc<RwLock<MessageStore>>,
    key: TripKey,
    policy: RetryPolicy
) {
    while let Some(intent) = rx.recv().await {
        match intent {
            PersistIntent::Save { index, record } => {
                let delivery = if persist_with_retry(gateway.as_ref(), &key, &record, &policy).await {
                    Delivery::Persisted
                } else {
                    Delivery::Unsent
                };
                match store.write() {
                    Ok(mut store) => {
                        if let Err(e) = store.set_delivery(index, delivery) {
                            warn!("Could not record delivery for {}: {}", key, e);
                        }
                    }
                    Err(_) => error!("Message store lock poisoned, delivery of entry {} lost", index),
                }
            }
            PersistIntent::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    info!("Persistence worker for {} stopped", key);
}

async fn persist_with_retry(
    gateway: &dyn ConversationGateway,
    key: &TripKey,
    record: &EntryRecord,
    policy: &RetryPolicy
) -> bool {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match gateway.persist_entry(key, record).await {
            Ok(()) => return true,
            Err(e) if attempt < attempts => {
                let delay = policy.backoff(attempt - 1);
                warn!(
                    "Saving {} message for {} failed (attempt {}/{}): {}; retrying in {:?}",
                    record.sender,
                    key,
                    attempt,
                    attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(
                    "Giving up saving {} message for {} after {} attempts: {}",
                    record.sender,
                    key,
                    attempts,
                    e
                );
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::mock::ScriptedGateway;
    use crate::models::chat::ConversationEntry;
    use crate::models::trip::TripContext;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn setup() -> (Arc<ScriptedGateway>, Arc<RwLock<MessageStore>>) {
        let gateway = Arc::new(ScriptedGateway::new(TripContext {
            trip_id: "t1".into(),
            owner_user_id: "u1".into(),
            city: "Seoul".into(),
            start_date: "2024-03-01".into(),
            end_date: "2024-03-02".into(),
            owner_display_name: "Mina".into(),
        }));
        (gateway, Arc::new(RwLock::new(MessageStore::new())))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(10), Duration::from_secs(8));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn retries_until_saved() {
        let (gateway, store) = setup();
        let index = store.write().unwrap().append(ConversationEntry::user("hello"));
        gateway.fail_persists(2);

        let queue = PersistQueue::spawn(gateway.clone(), store.clone(), TripKey::new("u1", "t1"), fast_policy(3));
        queue.enqueue(index, store.read().unwrap().get(index).unwrap().record());
        queue.flush().await;

        assert_eq!(gateway.call_count("persist_entry"), 3);
        assert_eq!(store.read().unwrap().get(index).unwrap().delivery, Delivery::Persisted);
    }

    #[tokio::test]
    async fn marks_entry_unsent_when_attempts_run_out() {
        let (gateway, store) = setup();
        let index = store.write().unwrap().append(ConversationEntry::user("hello"));
        gateway.fail_persists(5);

        let queue = PersistQueue::spawn(gateway.clone(), store.clone(), TripKey::new("u1", "t1"), fast_policy(2));
        queue.enqueue(index, store.read().unwrap().get(index).unwrap().record());
        queue.flush().await;

        assert_eq!(gateway.call_count("persist_entry"), 2);
        assert!(gateway.persisted().is_empty());
        assert_eq!(store.read().unwrap().get(index).unwrap().delivery, Delivery::Unsent);
    }

    #[tokio::test]
    async fn saves_in_enqueue_order() {
        let (gateway, store) = setup();
        let queue = PersistQueue::spawn(gateway.clone(), store.clone(), TripKey::new("u1", "t1"), fast_policy(3));
        gateway.fail_persists(1);
        for text in ["first", "second", "third"] {
            let entry = ConversationEntry::user(text);
            let record = entry.record();
            let index = store.write().unwrap().append(entry);
            queue.enqueue(index, record);
        }
        queue.flush().await;

        let texts: Vec<String> = gateway.persisted().into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }
}
