pub mod persist;

use log::{ error, info, warn };
use std::sync::{ Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard };
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use crate::config::prompt::{ self, PromptConfig, PromptError, QuickAction };
use crate::gateway::{ ConversationGateway, GatewayError, QueryReply };
use crate::history::{ MessageStore, StoreError };
use crate::models::chat::{ ConversationEntry, Delivery, Sender };
use crate::models::trip::{ TripContext, TripKey };
use crate::pagination::{ self, has_next, has_previous, split_locations };
use crate::places::{ NoopListener, TripPlaceListener, TripPlaceSignal };
use self::persist::{ PersistQueue, RetryPolicy };

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    LoadingContext,
    LoadingHistory,
    Ready,
    /// A query is in flight; the session is otherwise ready.
    Submitting,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to load trip context: {0}")]
    ContextLoad(#[source] GatewayError),
    #[error("Failed to load conversation history: {0}")]
    HistoryLoad(#[source] GatewayError),
    #[error("Query failed: {0}")]
    Submission(#[source] GatewayError),
    #[error("Query timed out after {0:?}")]
    Timeout(Duration),
    #[error("Query was cancelled")]
    Cancelled,
    #[error("Session is not ready (state: {0:?})")]
    NotReady(SessionState),
    #[error("Query text is empty")]
    EmptyQuery,
    #[error("Entry {0} is not an unanswered user message")]
    NotRetryable(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

#[derive(Clone, Copy, Debug)]
pub struct SessionSettings {
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Owns one trip conversation: loads it, appends to it and talks to the
/// server on its behalf. Submissions are admitted one at a time in the order
/// they were issued; readers can look at the store while a query is in flight.
pub struct Session {
    key: TripKey,
    nickname: String,
    gateway: Arc<dyn ConversationGateway>,
    prompts: Arc<PromptConfig>,
    listener: Arc<dyn TripPlaceListener>,
    settings: SessionSettings,
    state: RwLock<SessionState>,
    context: RwLock<Option<Arc<TripContext>>>,
    store: Arc<RwLock<MessageStore>>,
    persistence: PersistQueue,
    turn: tokio::sync::Mutex<()>,
    in_flight: Mutex<Option<CancellationToken>>,
}

/// Returns the session to `Ready` when a dispatch ends, including when the
/// dispatching future is dropped mid-flight. Unless a reply was accepted, the
/// user entry is left `unanswered` so it can be retried.
struct InFlight<'a> {
    session: &'a Session,
    user_index: usize,
    answered: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.answered {
            if let Err(e) = self.session.write_store().set_unanswered(self.user_index, true) {
                warn!("Could not mark entry {} unanswered: {}", self.user_index, e);
            }
        }
        *self.session.lock_in_flight() = None;
        self.session.set_state(SessionState::Ready);
    }
}

impl Session {
    /// Must be called from within a tokio runtime: the persistence worker is
    /// spawned here.
    pub fn new(
        key: TripKey,
        nickname: impl Into<String>,
        gateway: Arc<dyn ConversationGateway>,
        settings: SessionSettings
    ) -> Self {
        let store = Arc::new(RwLock::new(MessageStore::new()));
        let persistence = PersistQueue::spawn(
            Arc::clone(&gateway),
            Arc::clone(&store),
            key.clone(),
            settings.retry
        );

        Self {
            key,
            nickname: nickname.into(),
            gateway,
            prompts: Arc::new(PromptConfig::default()),
            listener: Arc::new(NoopListener),
            settings,
            state: RwLock::new(SessionState::Uninitialized),
            context: RwLock::new(None),
            store,
            persistence,
            turn: tokio::sync::Mutex::new(()),
            in_flight: Mutex::new(None),
        }
    }

    pub fn with_prompts(mut self, prompts: Arc<PromptConfig>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn TripPlaceListener>) -> Self {
        self.listener = listener;
        self
    }

    pub fn key(&self) -> &TripKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn context(&self) -> Option<Arc<TripContext>> {
        self.context
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn entries(&self) -> Vec<ConversationEntry> {
        self.read_store().entries().to_vec()
    }

    pub fn entry(&self, index: usize) -> Option<ConversationEntry> {
        self.read_store().get(index).cloned()
    }

    pub fn len(&self) -> usize {
        self.read_store().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_store().is_empty()
    }

    /// Runs `f` against the store without copying it.
    pub fn with_store<R>(&self, f: impl FnOnce(&MessageStore) -> R) -> R {
        f(&self.read_store())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    fn read_store(&self) -> RwLockReadGuard<'_, MessageStore> {
        self.store.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_store(&self) -> RwLockWriteGuard<'_, MessageStore> {
        self.store.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_state(&self, allowed: &[SessionState]) -> Result<(), SessionError> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(SessionError::NotReady(state))
        }
    }

    fn append_and_persist(&self, entry: ConversationEntry) -> usize {
        let record = entry.record();
        let index = self.write_store().append(entry);
        self.persistence.enqueue(index, record);
        index
    }

    /// Loads the trip and its conversation. Re-activating reloads both from
    /// the server; a failure leaves the session `Uninitialized`.
    pub async fn activate(&self) -> Result<(), SessionError> {
        let _turn = self.turn.lock().await;
        self.persistence.flush().await;

        info!("Activating chat session for {}", self.key);
        self.set_state(SessionState::LoadingContext);
        let context = match self.gateway.fetch_trip_context(&self.key).await {
            Ok(context) => Arc::new(context.with_display_name_fallback(&self.nickname)),
            Err(e) => {
                error!("Error fetching trip data for {}: {}", self.key, e);
                self.set_state(SessionState::Uninitialized);
                return Err(SessionError::ContextLoad(e));
            }
        };
        *self.context.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(
            Arc::clone(&context)
        );

        self.set_state(SessionState::LoadingHistory);
        match self.gateway.fetch_history(&self.key).await {
            Ok(entries) if !entries.is_empty() => {
                info!("Loaded {} conversation entries for {}", entries.len(), self.key);
                *self.write_store() = MessageStore::from_entries(entries);
            }
            Ok(_) | Err(GatewayError::NotFound) => {
                info!("No conversation yet for {}, starting with a welcome message", self.key);
                self.bootstrap_welcome(&context).await;
            }
            Err(e) => {
                error!("Error fetching chat data for {}: {}", self.key, e);
                self.set_state(SessionState::Uninitialized);
                return Err(SessionError::HistoryLoad(e));
            }
        }

        self.set_state(SessionState::Ready);
        Ok(())
    }

    async fn bootstrap_welcome(&self, context: &TripContext) {
        let entry = match self.gateway.fetch_or_create_welcome(&self.key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Welcome message unavailable for {} ({}), composing it locally", self.key, e);
                ConversationEntry::bot(prompt::get_welcome_message(&self.prompts, context))
            }
        };

        let needs_saving = entry.delivery == Delivery::Pending;
        let record = entry.record();
        let mut store = MessageStore::new();
        let index = store.append(entry);
        *self.write_store() = store;
        if needs_saving {
            self.persistence.enqueue(index, record);
        }
    }

    /// Sends a free-text query. The user entry is appended as soon as the
    /// submission is admitted; returns the index of the bot reply.
    pub async fn submit(&self, text: &str) -> Result<usize, SessionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::EmptyQuery);
        }
        let _turn = self.turn.lock().await;
        self.ensure_state(&[SessionState::Ready])?;

        let user_index = self.append_and_persist(ConversationEntry::user(text));
        self.dispatch(user_index, text).await
    }

    /// Re-sends an unanswered user entry without appending it again.
    pub async fn retry(&self, index: usize) -> Result<usize, SessionError> {
        let _turn = self.turn.lock().await;
        self.ensure_state(&[SessionState::Ready])?;

        let text = {
            let store = self.read_store();
            match store.get(index) {
                Some(entry) if entry.sender == Sender::User && entry.unanswered => entry.text.clone(),
                Some(_) => return Err(SessionError::NotRetryable(index)),
                None => return Err(StoreError::NoSuchEntry(index).into()),
            }
        };
        info!("Retrying unanswered entry {} for {}", index, self.key);
        self.dispatch(index, &text).await
    }

    pub async fn trigger(&self, action: QuickAction) -> Result<usize, SessionError> {
        let city = self
            .context()
            .map(|context| context.city.clone())
            .ok_or_else(|| SessionError::NotReady(self.state()))?;

        match prompt::get_quick_action_query(&self.prompts, action, &city)? {
            Some(query) => self.submit(&query).await,
            None => {
                self.ensure_state(&[SessionState::Ready, SessionState::Submitting])?;
                let entry = ConversationEntry::bot(self.prompts.place_prompt.clone()).with_delivery(
                    Delivery::Local
                );
                Ok(self.write_store().append(entry))
            }
        }
    }

    /// Cancels the query in flight, if any.
    pub fn cancel_pending(&self) -> bool {
        match self.lock_in_flight().as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn flush_persistence(&self) {
        self.persistence.flush().await;
    }

    async fn dispatch(&self, user_index: usize, text: &str) -> Result<usize, SessionError> {
        let submission_id = Uuid::new_v4();
        let token = CancellationToken::new();
        *self.lock_in_flight() = Some(token.clone());
        self.set_state(SessionState::Submitting);
        let mut in_flight = InFlight { session: self, user_index, answered: false };

        info!("Submitting query {} for {}", submission_id, self.key);
        let timeout = self.settings.request_timeout;
        let outcome = tokio::select! {
            _ = token.cancelled() => Err(SessionError::Cancelled),
            result = tokio::time::timeout(timeout, self.gateway.submit_query(&self.key, text)) => {
                match result {
                    Ok(Ok(reply)) => Ok(reply),
                    Ok(Err(e)) => Err(SessionError::Submission(e)),
                    Err(_) => Err(SessionError::Timeout(timeout)),
                }
            }
        };

        match outcome {
            Ok(reply) => {
                in_flight.answered = true;
                Ok(self.accept_reply(user_index, reply))
            }
            Err(e) => {
                error!("Query {} for {} failed: {}", submission_id, self.key, e);
                Err(e)
            }
        }
    }

    fn accept_reply(&self, user_index: usize, reply: QueryReply) -> usize {
        let signal = if reply.is_structured {
            TripPlaceSignal::Invalidated
        } else {
            TripPlaceSignal::Updated
        };
        if let Err(e) = self.write_store().set_unanswered(user_index, false) {
            warn!("Could not clear unanswered flag: {}", e);
        }
        let index = self.append_and_persist(reply.into_entry());
        self.listener.notify(signal);
        index
    }

    pub fn next_page(&self, index: usize) -> Result<usize, SessionError> {
        self.move_cursor(index, |cursor, total| {
            if has_next(cursor, total) { cursor + 1 } else { cursor }
        })
    }

    pub fn previous_page(&self, index: usize) -> Result<usize, SessionError> {
        self.move_cursor(index, |cursor, _| {
            if has_previous(cursor) { cursor - 1 } else { cursor }
        })
    }

    /// Jumps to `page`, clamped to the entry's last page.
    pub fn set_page(&self, index: usize, page: usize) -> Result<usize, SessionError> {
        self.move_cursor(index, |_, total| page.min(pagination::page_count(total).saturating_sub(1)))
    }

    fn move_cursor(
        &self,
        index: usize,
        step: impl FnOnce(usize, usize) -> usize
    ) -> Result<usize, SessionError> {
        let mut store = self.write_store();
        let entry = store.get(index).ok_or(StoreError::NoSuchEntry(index))?;
        if !entry.is_structured {
            return Err(StoreError::NotStructured(index).into());
        }
        let cursor = step(entry.page_cursor, split_locations(&entry.text).len());
        store.set_page_cursor(index, cursor)?;
        Ok(cursor)
    }
}
