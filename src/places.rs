use log::{ error, info };
use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::{ Arc, RwLock };
use tokio::sync::mpsc;
use crate::gateway::{ ConversationGateway, GatewayError };
use crate::models::trip::{ SavedPlace, TripKey };

/// Notifications sent to whatever keeps the trip's saved places.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TripPlaceSignal {
    /// A new structured recommendation arrived; saved-place state may be stale.
    Invalidated,
    /// A plain reply arrived, typically confirming a place was added.
    Updated,
}

pub trait TripPlaceListener: Send + Sync {
    fn notify(&self, signal: TripPlaceSignal);
}

/// Discards every signal.
pub struct NoopListener;

impl TripPlaceListener for NoopListener {
    fn notify(&self, _signal: TripPlaceSignal) {}
}

impl TripPlaceListener for mpsc::UnboundedSender<TripPlaceSignal> {
    fn notify(&self, signal: TripPlaceSignal) {
        if self.send(signal).is_err() {
            info!("Trip place receiver dropped, signal {:?} discarded", signal);
        }
    }
}

/// Caches the trip's saved places and refetches them after any signal.
pub struct SavedPlaceTracker {
    gateway: Arc<dyn ConversationGateway>,
    key: TripKey,
    stale: AtomicBool,
    places: RwLock<Vec<SavedPlace>>,
}

impl SavedPlaceTracker {
    pub fn new(gateway: Arc<dyn ConversationGateway>, key: TripKey) -> Self {
        Self {
            gateway,
            key,
            stale: AtomicBool::new(true),
            places: RwLock::new(Vec::new()),
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub fn places(&self) -> Vec<SavedPlace> {
        self.places.read().map(|places| places.clone()).unwrap_or_default()
    }

    /// Refetches when a signal arrived since the last refresh. Returns whether
    /// a fetch happened.
    pub async fn refresh_if_stale(&self) -> Result<bool, GatewayError> {
        if !self.stale.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        match self.gateway.fetch_saved_places(&self.key).await {
            Ok(fetched) => {
                info!("Refreshed {} saved places for {}", fetched.len(), self.key);
                if let Ok(mut places) = self.places.write() {
                    *places = fetched;
                }
                Ok(true)
            }
            Err(e) => {
                error!("Failed to fetch saved places for {}: {}", self.key, e);
                self.stale.store(true, Ordering::Release);
                Err(e)
            }
        }
    }
}

impl TripPlaceListener for SavedPlaceTracker {
    fn notify(&self, _signal: TripPlaceSignal) {
        self.stale.store(true, Ordering::Release);
    }
}
