use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use trip_chat::gateway::mock::ScriptedGateway;
use trip_chat::gateway::{ GatewayError, QueryReply };
use trip_chat::models::chat::{ Delivery, GeoPoint, Sender };
use trip_chat::models::trip::{ TripContext, TripKey };
use trip_chat::pagination;
use trip_chat::session::persist::RetryPolicy;
use trip_chat::session::{ Session, SessionSettings };

fn trip() -> TripContext {
    TripContext {
        trip_id: "t1".into(),
        owner_user_id: "u1".into(),
        city: "Gangneung".into(),
        start_date: "2024-10-03".into(),
        end_date: "2024-10-06".into(),
        owner_display_name: "Mina".into(),
    }
}

fn new_session(gateway: &Arc<ScriptedGateway>) -> Session {
    let settings = SessionSettings {
        request_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
    };
    Session::new(TripKey::new("u1", "t1"), "Mina", gateway.clone(), settings)
}

#[tokio::test]
async fn missing_history_bootstraps_exactly_one_welcome() {
    let gateway = Arc::new(ScriptedGateway::new(trip()));
    let session = new_session(&gateway);

    session.activate().await.unwrap();

    assert_eq!(gateway.call_count("fetch_or_create_welcome"), 1);
    let entries = session.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].sender, Sender::Bot);
    assert_eq!(entries[0].text, "Welcome to Gangneung!");
    assert_eq!(entries[0].delivery, Delivery::Persisted);
}

#[tokio::test]
async fn activating_again_never_recreates_the_welcome() {
    let gateway = Arc::new(ScriptedGateway::new(trip()));
    let session = new_session(&gateway);

    session.activate().await.unwrap();
    session.activate().await.unwrap();
    new_session(&gateway).activate().await.unwrap();

    assert_eq!(gateway.call_count("fetch_history"), 3);
    assert_eq!(gateway.call_count("fetch_or_create_welcome"), 1);
    assert_eq!(session.len(), 1);
}

#[tokio::test]
async fn failed_query_keeps_the_optimistic_user_entry() {
    let gateway = Arc::new(ScriptedGateway::new(trip()));
    gateway.script_reply(
        Err(GatewayError::Rejected { code: 500, message: "places lookup failed".into() })
    );
    let session = new_session(&gateway);
    session.activate().await.unwrap();

    assert!(session.submit("best beaches?").await.is_err());

    let entries = session.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].sender, Sender::User);
    assert_eq!(entries[1].text, "best beaches?");
    assert!(entries[1].unanswered);
}

#[tokio::test]
async fn overlapping_submissions_append_in_issue_order() {
    let gateway = Arc::new(ScriptedGateway::new(trip()));
    for (i, delay) in [60u64, 30, 0].into_iter().enumerate() {
        gateway.script_delayed_reply(
            Duration::from_millis(delay),
            Ok(QueryReply::plain(format!("reply {}", i)))
        );
    }
    let session = new_session(&gateway);
    session.activate().await.unwrap();

    let results = join_all((0..3).map(|i| {
        let session = &session;
        async move { session.submit(&format!("question {}", i)).await }
    })).await;
    assert!(results.iter().all(Result::is_ok));

    let texts: Vec<String> = session
        .entries()
        .into_iter()
        .skip(1)
        .map(|entry| entry.text)
        .collect();
    assert_eq!(texts, vec![
        "question 0",
        "reply 0",
        "question 1",
        "reply 1",
        "question 2",
        "reply 2"
    ]);
}

#[tokio::test]
async fn persisted_conversation_reloads_in_order() {
    let gateway = Arc::new(ScriptedGateway::new(trip()));
    let places = (0..6).map(|i| format!("Spot {}", i)).collect::<Vec<_>>().join("\n\n");
    let geo = (0..6).map(|i| GeoPoint::from([37.7 + i as f64 / 100.0, 128.9])).collect();
    gateway.script_reply(Ok(QueryReply::structured(places, geo)));
    gateway.script_reply(Ok(QueryReply::plain("Added Anmok Beach to your plan.")));

    let first = new_session(&gateway);
    first.activate().await.unwrap();
    first.submit("popular sights").await.unwrap();
    first.submit("add Anmok Beach").await.unwrap();
    first.flush_persistence().await;
    assert!(first.entries().iter().all(|entry| entry.delivery == Delivery::Persisted));

    let second = new_session(&gateway);
    second.activate().await.unwrap();

    let before = first.entries();
    let after = second.entries();
    assert_eq!(before.len(), after.len());
    for (original, reloaded) in before.iter().zip(after.iter()) {
        assert_eq!(original.sender, reloaded.sender);
        assert_eq!(original.text, reloaded.text);
        assert_eq!(original.is_structured, reloaded.is_structured);
    }

    let view = pagination::page_view(&after[2]).unwrap();
    assert!(view.has_next);
    assert_eq!(view.markers().len(), 4);
}

#[tokio::test]
async fn unsaved_entries_are_marked_after_retries_run_out() {
    let gateway = Arc::new(ScriptedGateway::new(trip()));
    gateway.script_reply(Ok(QueryReply::plain("Sure!")));
    let session = new_session(&gateway);
    session.activate().await.unwrap();

    gateway.fail_persists(3);
    session.submit("hello").await.unwrap();
    session.flush_persistence().await;

    let entries = session.entries();
    assert_eq!(entries[1].delivery, Delivery::Unsent);
    assert_eq!(entries[2].delivery, Delivery::Persisted);
    assert_eq!(gateway.persisted().len(), 2);
}
