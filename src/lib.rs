pub mod models;
pub mod config;
pub mod cli;
pub mod history;
pub mod gateway;
pub mod pagination;
pub mod places;
pub mod session;
pub mod console;

use cli::Args;
use config::prompt::initialize_prompts;
use gateway::create_gateway;
use history::format_transcript;
use log::{ debug, error, info };
use models::trip::TripKey;
use places::SavedPlaceTracker;
use session::Session;
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Trip API URL: {}", args.api_url);
    info!("User Id: {}", args.user_id);
    info!("Trip Id: {}", args.trip_id);
    info!("Nickname: {}", args.nickname);
    info!("Prompts Path: {}", args.prompts_path.as_deref().unwrap_or("built-in"));
    info!("Request Timeout: {}s", args.request_timeout_secs);
    info!("Persist Max Attempts: {}", args.persist_max_attempts);
    info!(
        "Persist Backoff: {}ms initial, {}ms max",
        args.persist_initial_backoff_ms,
        args.persist_max_backoff_ms
    );
    info!("-------------------------");

    let prompts = initialize_prompts(args.prompts_path.as_deref())?;
    let gateway = create_gateway(&args)?;
    let key = TripKey::new(args.user_id.clone(), args.trip_id.clone());
    let tracker = Arc::new(SavedPlaceTracker::new(Arc::clone(&gateway), key.clone()));
    let session = Arc::new(
        Session::new(key, args.nickname.clone(), gateway, args.session_settings())
            .with_prompts(prompts)
            .with_listener(tracker.clone())
    );

    if let Err(e) = session.activate().await {
        error!("Chat session could not be started: {}", e);
    }

    console::run_console(Arc::clone(&session), tracker).await?;

    info!("Waiting for unsaved messages...");
    session.flush_persistence().await;
    debug!(
        "Conversation at exit:\n{}",
        session.with_store(|store| format_transcript(store.entries()))
    );

    Ok(())
}
