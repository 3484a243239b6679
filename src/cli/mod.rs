use clap::Parser;
use std::time::Duration;
use crate::session::SessionSettings;
use crate::session::persist::RetryPolicy;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    // --- Trip API Args ---
    /// Base URL of the trip-planning API (e.g., http://localhost:5000)
    #[arg(long, env = "TRIP_API_URL", default_value = "http://localhost:5000")]
    pub api_url: String,

    /// Seconds to wait for any single API request before giving up.
    #[arg(long, env = "TRIP_REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,

    // --- Session Args ---
    /// Id of the logged-in user.
    #[arg(long, env = "TRIP_USER_ID")]
    pub user_id: String,

    /// Id of the trip whose conversation to open (the user's main trip).
    #[arg(long, env = "TRIP_ID")]
    pub trip_id: String,

    /// Name used in greetings when the trip carries no display name.
    #[arg(long, env = "TRIP_NICKNAME", default_value = "traveler")]
    pub nickname: String,

    /// Optional path to a prompt template file (e.g., json/prompts.json). Built-in English templates are used when unset.
    #[arg(long, env = "PROMPTS_PATH")]
    pub prompts_path: Option<String>,

    // --- Persistence Args ---
    /// Attempts per message before it is marked unsent.
    #[arg(long, env = "PERSIST_MAX_ATTEMPTS", default_value = "5")]
    pub persist_max_attempts: u32,

    /// Delay before the first retry of a failed save, doubled on each further retry.
    #[arg(long, env = "PERSIST_INITIAL_BACKOFF_MS", default_value = "250")]
    pub persist_initial_backoff_ms: u64,

    /// Upper bound for the delay between save retries.
    #[arg(long, env = "PERSIST_MAX_BACKOFF_MS", default_value = "8000")]
    pub persist_max_backoff_ms: u64,

    // --- General App Args ---
    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

impl Args {
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.persist_max_attempts,
                initial_backoff: Duration::from_millis(self.persist_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.persist_max_backoff_ms),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_into_settings() {
        let args = Args::try_parse_from([
            "trip-chat",
            "--user-id",
            "u1",
            "--trip-id",
            "t9",
            "--request-timeout-secs",
            "5",
            "--persist-max-attempts",
            "3",
        ]).unwrap();

        assert_eq!(args.trip_id, "t9");
        let settings = args.session_settings();
        assert_eq!(settings.request_timeout, Duration::from_secs(5));
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.initial_backoff, Duration::from_millis(250));
    }
}
